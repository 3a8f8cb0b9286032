//! Integration tests for GENA subscription flows.
//!
//! These tests verify:
//! - In-process subscriptions to local services
//! - Outgoing subscriptions with renewal, failure and expiration
//! - Missed-event detection and malformed event bodies
//! - Cancellation of an outgoing SUBSCRIBE in flight or after the grant
//! - SUBSCRIBE/UNSUBSCRIBE handling for local services


use std::sync::Arc;

use test_helpers::*;
use upnp_registry::gena::headers::names;
use upnp_registry::gena::status;
use upnp_registry::{
    CancelReason, GenaResponse, IncomingEvent, IncomingSubscribe, IncomingUnsubscribe,
    ManualClock, Registry, RegistryConfig, SubscriptionCallback, SubscriptionFailure,
    SubscriptionId, SubscriptionPhase, SubscriptionTarget, TransportError,
};

fn event(sid: &str, seq: &str, body: &str) -> IncomingEvent {
    IncomingEvent {
        sid: Some(sid.to_string()),
        nt: Some("upnp:event".to_string()),
        nts: Some("upnp:propchange".to_string()),
        seq: Some(seq.to_string()),
        body: body.to_string(),
    }
}

fn status_body(value: &str) -> String {
    format!(
        r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><Status>{value}</Status></e:property></e:propertyset>"#
    )
}

async fn remote_setup(
    client: Arc<ScriptedClient>,
    clock: Arc<ManualClock>,
) -> (Registry, SubscriptionCallback, Arc<EventLog>) {
    let registry = manual_registry(clock, client);
    registry
        .add_remote_device(remote_light("uuid:remote", "192.168.1.50:1400", 1800))
        .unwrap();
    let log = EventLog::new();
    let target = SubscriptionTarget::known_remote(&registry, switch_ref("uuid:remote")).unwrap();
    let callback = SubscriptionCallback::new(registry.clone(), target, log.clone());
    (registry, callback, log)
}

#[tokio::test]
async fn test_local_in_process_lifecycle() {
    let registry = manual_registry(Arc::new(ManualClock::at_seconds(0)), ScriptedClient::new());
    let (device, service) = local_light("uuid:light");
    registry.add_local_device(device).unwrap();

    let log = EventLog::new();
    let callback = SubscriptionCallback::new(
        registry.clone(),
        SubscriptionTarget::Local(switch_ref("uuid:light")),
        log.clone(),
    );
    let subscription = callback.establish().await.unwrap();
    assert_eq!(log.sequences(), vec![0]);
    assert_eq!(
        log.events.lock()[0].values.get("Status").map(String::as_str),
        Some("0")
    );

    // Silent variables never produce events
    service.update("Target", "1");
    assert_eq!(log.sequences(), vec![0]);

    service.update("Status", "1");
    service.update("Status", "0");
    assert_eq!(log.sequences(), vec![0, 1, 2]);

    let id = subscription.id().unwrap();
    callback.end().await;
    assert!(registry.get_local_subscription(&id).is_none());
    assert_eq!(log.ended.lock().as_slice(), &[(None, None)]);

    service.update("Status", "1");
    assert_eq!(log.sequences(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_local_subscription_for_unregistered_device() {
    let registry = manual_registry(Arc::new(ManualClock::at_seconds(0)), ScriptedClient::new());
    let log = EventLog::new();
    let callback = SubscriptionCallback::new(
        registry.clone(),
        SubscriptionTarget::Local(switch_ref("uuid:nowhere")),
        log.clone(),
    );

    let failure = callback.establish().await.unwrap_err();
    assert!(failure.error().is_some());
    assert!(failure.response().is_none());
    assert!(registry.local_subscriptions().is_empty());
    assert_eq!(*log.established.lock(), 0);
}

#[tokio::test]
async fn test_remote_lifecycle() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    let (registry, callback, log) =
        remote_setup(client.clone(), Arc::new(ManualClock::at_seconds(0))).await;

    let subscription = callback.establish().await.unwrap();
    let id: SubscriptionId = "uuid:1234".parse().unwrap();
    assert_eq!(subscription.id(), Some(id.clone()));
    assert_eq!(subscription.actual_duration_seconds(), 180);
    assert_eq!(subscription.phase(), SubscriptionPhase::Established);
    assert!(registry.get_remote_subscription(&id).is_some());

    let response = registry.handle_event(event("uuid:1234", "0", EVENT_BODY)).await;
    assert_eq!(response.status, status::OK);
    assert_eq!(log.sequences(), vec![0]);

    callback.end().await;
    callback.end().await;
    assert!(registry.get_remote_subscription(&id).is_none());
    let ended = log.ended.lock().clone();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].0, None);

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    match &requests[0] {
        RecordedRequest::Subscribe(subscribe) => {
            let headers = subscribe.headers();
            assert!(headers.contains(&(names::TIMEOUT, "Second-1800".to_string())));
            assert!(headers.contains(&(
                names::CALLBACK,
                "<http://192.168.1.10:3400/notify>".to_string()
            )));
            assert_eq!(
                subscribe.url.as_str(),
                "http://192.168.1.50:1400/upnp/event/SwitchPower"
            );
        }
        other => panic!("Expected SUBSCRIBE, got {other:?}"),
    }
    assert!(matches!(&requests[1], RecordedRequest::Unsubscribe(u) if u.subscription_id == id));
}

#[tokio::test]
async fn test_remote_failure_categories() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(Err(TransportError::NoResponse("connection refused".to_string())));
    client.reply_to_subscribe(Ok(GenaResponse::new(status::PRECONDITION_FAILED)));
    let (registry, _, _) = remote_setup(client.clone(), Arc::new(ManualClock::at_seconds(0))).await;
    let target = SubscriptionTarget::known_remote(&registry, switch_ref("uuid:remote")).unwrap();

    let log = EventLog::new();
    let unreachable = SubscriptionCallback::new(registry.clone(), target.clone(), log.clone());
    let failure = unreachable.establish().await.unwrap_err();
    assert_eq!(failure, SubscriptionFailure::Unreachable);
    assert!(failure.response().is_none() && failure.error().is_none());

    let rejected = SubscriptionCallback::new(registry.clone(), target, log.clone());
    let failure = rejected.establish().await.unwrap_err();
    assert_eq!(failure.response().map(|r| r.status), Some(status::PRECONDITION_FAILED));
    assert!(failure.default_message().starts_with("Subscription failed: HTTP response was"));

    assert_eq!(log.failures.lock().len(), 2);
    assert!(registry.remote_subscriptions().is_empty());
}

#[tokio::test]
async fn test_cancel_while_subscribe_in_flight() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:late", 300));
    let _gate = client.hold_subscribe();
    let (registry, callback, log) =
        remote_setup(client.clone(), Arc::new(ManualClock::at_seconds(0))).await;
    let callback = Arc::new(callback);

    let establishing = tokio::spawn({
        let callback = callback.clone();
        async move { callback.establish().await }
    });
    eventually("SUBSCRIBE sent", || !client.requests().is_empty()).await;
    callback.cancel();

    let failure = establishing.await.unwrap().unwrap_err();
    assert_eq!(failure, SubscriptionFailure::Cancelled);
    assert_eq!(*log.failures.lock(), vec![SubscriptionFailure::Cancelled]);
    assert_eq!(*log.established.lock(), 0);
    assert!(registry.remote_subscriptions().is_empty());
    // No grant arrived, so there is nothing to release
    assert!(client.unsubscribed().is_empty());
}

#[tokio::test]
async fn test_end_while_subscribe_in_flight() {
    let client = ScriptedClient::new();
    let _gate = client.hold_subscribe();
    let (registry, callback, log) =
        remote_setup(client.clone(), Arc::new(ManualClock::at_seconds(0))).await;
    let callback = Arc::new(callback);

    let establishing = tokio::spawn({
        let callback = callback.clone();
        async move { callback.establish().await }
    });
    eventually("SUBSCRIBE sent", || !client.requests().is_empty()).await;
    callback.end().await;

    let failure = establishing.await.unwrap().unwrap_err();
    assert_eq!(failure, SubscriptionFailure::Cancelled);
    assert!(registry.remote_subscriptions().is_empty());
    assert!(callback.subscription().is_none());
    assert_eq!(*log.established.lock(), 0);
}

#[tokio::test]
async fn test_cancel_after_grant_releases_subscription() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:granted", 300));
    let (registry, callback, log) =
        remote_setup(client.clone(), Arc::new(ManualClock::at_seconds(0))).await;
    client.cancel_on_subscribe(callback.cancellation_token());

    let failure = callback.establish().await.unwrap_err();
    assert_eq!(failure, SubscriptionFailure::Cancelled);
    assert!(registry.remote_subscriptions().is_empty());
    assert_eq!(*log.established.lock(), 0);

    eventually("UNSUBSCRIBE for the granted SID", || {
        client.unsubscribed() == vec!["uuid:granted".to_string()]
    })
    .await;
    assert!(log.ended.lock().is_empty());
}

#[tokio::test]
async fn test_missed_and_stale_events() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    let (registry, callback, log) =
        remote_setup(client, Arc::new(ManualClock::at_seconds(0))).await;
    let subscription = callback.establish().await.unwrap();

    registry.handle_event(event("uuid:1234", "0", &status_body("0"))).await;
    registry.handle_event(event("uuid:1234", "3", &status_body("3"))).await;
    assert_eq!(*log.missed.lock(), vec![2]);
    assert_eq!(subscription.current_sequence().value(), 3);
    assert_eq!(
        subscription.current_values().get("Status").map(String::as_str),
        Some("3")
    );

    // Older numbers are dropped without regressing the sequence
    let response = registry.handle_event(event("uuid:1234", "2", &status_body("2"))).await;
    assert_eq!(response.status, status::OK);
    assert_eq!(log.sequences(), vec![0, 3]);
    assert_eq!(subscription.current_sequence().value(), 3);
}

#[tokio::test]
async fn test_malformed_event_keeps_subscription() {
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    let (registry, callback, log) =
        remote_setup(client, Arc::new(ManualClock::at_seconds(0))).await;
    let subscription = callback.establish().await.unwrap();

    let response = registry.handle_event(event("uuid:1234", "0", "this is not xml")).await;
    assert_eq!(response.status, status::INTERNAL_SERVER_ERROR);
    assert_eq!(log.invalid.lock().len(), 1);
    assert_eq!(subscription.phase(), SubscriptionPhase::Established);

    registry.handle_event(event("uuid:1234", "1", EVENT_BODY)).await;
    assert_eq!(log.sequences(), vec![1]);
}

#[tokio::test]
async fn test_invalid_notify_headers() {
    let registry = manual_registry(Arc::new(ManualClock::at_seconds(0)), ScriptedClient::new());

    let mut missing_seq = event("uuid:1234", "0", EVENT_BODY);
    missing_seq.seq = None;
    assert_eq!(registry.handle_event(missing_seq).await.status, 412);

    let mut wrong_nts = event("uuid:1234", "0", EVENT_BODY);
    wrong_nts.nts = Some("ssdp:alive".to_string());
    assert_eq!(registry.handle_event(wrong_nts).await.status, 400);

    assert_eq!(
        registry.handle_event(event("uuid:unknown", "0", EVENT_BODY)).await.status,
        412
    );
}

#[tokio::test]
async fn test_successful_renewal_extends_subscription() {
    let clock = Arc::new(ManualClock::at_seconds(0));
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    client.reply_to_renew(granted("uuid:1234", 180));
    let (registry, callback, log) = remote_setup(client.clone(), clock.clone()).await;
    let subscription = callback.establish().await.unwrap();

    clock.advance_seconds(91);
    registry.maintain();
    eventually("renewal", || {
        client
            .requests()
            .iter()
            .any(|r| matches!(r, RecordedRequest::Renew(_)))
            && subscription.phase() == SubscriptionPhase::Established
    })
    .await;

    clock.advance_seconds(120);
    registry.maintain();
    assert!(log.ended.lock().is_empty());
    assert!(registry.get_remote_subscription(&subscription.id().unwrap()).is_some());
}

#[tokio::test]
async fn test_rejected_renewal_ends_subscription() {
    let clock = Arc::new(ManualClock::at_seconds(0));
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    client.reply_to_renew(Ok(GenaResponse::new(status::PRECONDITION_FAILED)));
    let (registry, callback, log) = remote_setup(client, clock.clone()).await;
    let subscription = callback.establish().await.unwrap();

    clock.advance_seconds(91);
    registry.maintain();
    eventually("renewal failure", || !log.ended.lock().is_empty()).await;

    let ended = log.ended.lock().clone();
    assert_eq!(ended[0].0, Some(CancelReason::RenewalFailed));
    assert_eq!(ended[0].1.as_ref().map(|r| r.status), Some(status::PRECONDITION_FAILED));
    assert!(registry.get_remote_subscription(&subscription.id().unwrap()).is_none());
}

#[tokio::test]
async fn test_unanswered_renewals_lead_to_expiry() {
    let clock = Arc::new(ManualClock::at_seconds(0));
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    client.reply_to_renew(Err(TransportError::NoResponse("timed out".to_string())));
    let (registry, callback, log) = remote_setup(client.clone(), clock.clone()).await;
    let subscription = callback.establish().await.unwrap();

    clock.advance_seconds(91);
    registry.maintain();
    eventually("first renewal attempt", || {
        client.requests().iter().any(|r| matches!(r, RecordedRequest::Renew(_)))
            && subscription.phase() == SubscriptionPhase::Established
    })
    .await;
    assert!(log.ended.lock().is_empty());

    clock.advance_seconds(90);
    registry.maintain();
    assert_eq!(log.ended.lock().as_slice(), &[(Some(CancelReason::Expired), None)]);
    assert!(registry.remote_subscriptions().is_empty());
}

#[tokio::test]
async fn test_renewal_attempts_are_bounded() {
    let clock = Arc::new(ManualClock::at_seconds(0));
    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:1234", 180));
    client.reply_to_renew(Err(TransportError::NoResponse("timed out".to_string())));
    let registry = Registry::builder()
        .with_config(RegistryConfig::default().with_max_renewal_attempts(1))
        .with_clock(clock.clone())
        .with_client(client.clone())
        .with_callback_url("http://192.168.1.10:3400/notify".parse().unwrap())
        .without_maintainer()
        .build()
        .unwrap();
    registry
        .add_remote_device(remote_light("uuid:remote", "192.168.1.50:1400", 1800))
        .unwrap();
    let log = EventLog::new();
    let target = SubscriptionTarget::known_remote(&registry, switch_ref("uuid:remote")).unwrap();
    SubscriptionCallback::new(registry.clone(), target, log.clone())
        .establish()
        .await
        .unwrap();

    clock.advance_seconds(91);
    registry.maintain();
    eventually("terminal renewal failure", || !log.ended.lock().is_empty()).await;
    assert_eq!(log.ended.lock()[0].0, Some(CancelReason::RenewalFailed));
}

fn inbound_registry() -> (Registry, Arc<ScriptedClient>, Arc<upnp_registry::LocalService>) {
    let client = ScriptedClient::new();
    let registry = manual_registry(Arc::new(ManualClock::at_seconds(0)), client.clone());
    let (device, service) = local_light("uuid:light");
    registry.add_local_device(device).unwrap();
    (registry, client, service)
}

fn new_subscribe(callback: &str, timeout: Option<&str>) -> IncomingSubscribe {
    IncomingSubscribe {
        sid: None,
        nt: Some("upnp:event".to_string()),
        callback: Some(callback.to_string()),
        timeout: timeout.map(str::to_string),
    }
}

#[tokio::test]
async fn test_inbound_subscription_receives_events() {
    let (registry, client, service) = inbound_registry();
    let outcome = registry.handle_subscribe(
        &switch_ref("uuid:light"),
        new_subscribe("<http://192.168.1.20:5000/cb>", Some("Second-300")),
    );
    assert_eq!(outcome.response.status, status::OK);
    assert_eq!(outcome.response.header(names::TIMEOUT), Some("Second-300"));
    let sid = outcome.response.header(names::SID).unwrap().to_string();
    assert!(sid.starts_with("uuid:"));

    outcome.confirmation.unwrap().response_sent(true);
    eventually("initial event", || client.notifications().len() == 1).await;

    service.update("Status", "1");
    eventually("change event", || client.notifications().len() == 2).await;

    let notifications = client.notifications();
    assert_eq!(notifications[0].sequence.value(), 0);
    assert_eq!(notifications[1].sequence.value(), 1);
    assert_eq!(notifications[1].subscription_id.as_str(), sid);
    assert_eq!(notifications[1].url.as_str(), "http://192.168.1.20:5000/cb");
    assert!(notifications[1].body.contains("<Status>1</Status>"));
}

#[tokio::test]
async fn test_inbound_events_reach_every_callback_url() {
    let (registry, client, service) = inbound_registry();
    let outcome = registry.handle_subscribe(
        &switch_ref("uuid:light"),
        new_subscribe(
            "<http://192.168.1.20:5000/a><http://192.168.1.21:5000/b>",
            None,
        ),
    );
    outcome.confirmation.unwrap().response_sent(true);
    eventually("initial event on both URLs", || client.notifications().len() == 2).await;

    service.update("Status", "1");
    eventually("change event on both URLs", || client.notifications().len() == 4).await;

    let notifications = client.notifications();
    let urls: Vec<&str> = notifications.iter().map(|n| n.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "http://192.168.1.20:5000/a",
            "http://192.168.1.21:5000/b",
            "http://192.168.1.20:5000/a",
            "http://192.168.1.21:5000/b",
        ]
    );
    let sequences: Vec<u32> = notifications.iter().map(|n| n.sequence.value()).collect();
    assert_eq!(sequences, vec![0, 0, 1, 1]);
}

#[tokio::test]
async fn test_inbound_renewal_and_unsubscribe() {
    let (registry, _client, _service) = inbound_registry();
    let service = switch_ref("uuid:light");
    let outcome = registry.handle_subscribe(
        &service,
        new_subscribe("<http://192.168.1.20:5000/cb>", Some("Second-99999")),
    );
    assert_eq!(outcome.response.header(names::TIMEOUT), Some("Second-1800"));
    let sid = outcome.response.header(names::SID).unwrap().to_string();
    outcome.confirmation.unwrap().response_sent(true);

    let renewal = registry.handle_subscribe(
        &service,
        IncomingSubscribe {
            sid: Some(sid.clone()),
            timeout: Some("Second-120".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(renewal.response.status, status::OK);
    assert_eq!(renewal.response.header(names::TIMEOUT), Some("Second-120"));
    assert!(renewal.confirmation.is_none());

    let with_nt = registry.handle_unsubscribe(
        &service,
        IncomingUnsubscribe {
            sid: Some(sid.clone()),
            nt: Some("upnp:event".to_string()),
            callback: None,
        },
    );
    assert_eq!(with_nt.status, status::BAD_REQUEST);

    let removed = registry.handle_unsubscribe(
        &service,
        IncomingUnsubscribe {
            sid: Some(sid.clone()),
            ..Default::default()
        },
    );
    assert_eq!(removed.status, status::OK);
    assert!(registry.local_subscriptions().is_empty());

    let again = registry.handle_unsubscribe(
        &service,
        IncomingUnsubscribe {
            sid: Some(sid),
            ..Default::default()
        },
    );
    assert_eq!(again.status, status::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_inbound_subscribe_status_codes() {
    let (registry, _client, _service) = inbound_registry();
    let service = switch_ref("uuid:light");

    let unknown_service = registry.handle_subscribe(
        &switch_ref("uuid:other"),
        new_subscribe("<http://192.168.1.20/cb>", None),
    );
    assert_eq!(unknown_service.response.status, status::NOT_FOUND);

    let sid_and_nt = registry.handle_subscribe(
        &service,
        IncomingSubscribe {
            sid: Some("uuid:abc".to_string()),
            nt: Some("upnp:event".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(sid_and_nt.response.status, status::BAD_REQUEST);

    let unknown_sid = registry.handle_subscribe(
        &service,
        IncomingSubscribe {
            sid: Some("uuid:abc".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(unknown_sid.response.status, status::PRECONDITION_FAILED);

    let no_callback = registry.handle_subscribe(
        &service,
        IncomingSubscribe {
            nt: Some("upnp:event".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(no_callback.response.status, status::PRECONDITION_FAILED);

    let public_callback =
        registry.handle_subscribe(&service, new_subscribe("<http://8.8.8.8/cb>", None));
    assert_eq!(public_callback.response.status, status::PRECONDITION_FAILED);

    assert!(registry.local_subscriptions().is_empty());
}

#[tokio::test]
async fn test_undelivered_response_rolls_back() {
    let (registry, client, _service) = inbound_registry();
    let outcome = registry.handle_subscribe(
        &switch_ref("uuid:light"),
        new_subscribe("<http://192.168.1.20:5000/cb>", None),
    );
    assert_eq!(registry.local_subscriptions().len(), 1);

    outcome.confirmation.unwrap().response_sent(false);
    assert!(registry.local_subscriptions().is_empty());
    tokio::task::yield_now().await;
    assert!(client.notifications().is_empty());
}

#[tokio::test]
async fn test_unconfirmed_subscription_is_dropped() {
    let (registry, client, service) = inbound_registry();
    let outcome = registry.handle_subscribe(
        &switch_ref("uuid:light"),
        new_subscribe("<http://192.168.1.20:5000/cb>", None),
    );
    let subscription = outcome.confirmation.as_ref().unwrap().subscription().clone();
    assert_eq!(registry.local_subscriptions().len(), 1);

    drop(outcome);
    assert!(registry.local_subscriptions().is_empty());
    assert_eq!(subscription.phase(), SubscriptionPhase::Ended);

    service.update("Status", "1");
    tokio::task::yield_now().await;
    assert!(client.notifications().is_empty());
}
