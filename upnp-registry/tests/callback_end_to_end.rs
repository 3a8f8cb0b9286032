//! End-to-end test: NOTIFY over HTTP through the callback server into a
//! remote subscription.


use std::sync::Arc;

use callback_server::CallbackServer;
use reqwest::Method;
use test_helpers::*;
use tokio::sync::mpsc;
use upnp_registry::{
    EventReceiver, ManualClock, Registry, SubscriptionCallback, SubscriptionTarget,
};

async fn notify(port: u16, sid: &str, seq: &str, body: &str) -> u16 {
    reqwest::Client::new()
        .request(
            Method::from_bytes(b"NOTIFY").unwrap(),
            format!("http://127.0.0.1:{port}/notify"),
        )
        .header("SID", sid)
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SEQ", seq)
        .header("Content-Type", "text/xml")
        .body(body.to_string())
        .send()
        .await
        .expect("NOTIFY failed")
        .status()
        .as_u16()
}

#[tokio::test]
async fn test_notify_reaches_remote_subscription() {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = CallbackServer::accepting_all((52000, 52100), tx)
        .await
        .expect("Failed to start callback server");

    let client = ScriptedClient::new();
    client.reply_to_subscribe(granted("uuid:e2e", 300));
    let registry = Registry::builder()
        .with_clock(Arc::new(ManualClock::at_seconds(0)))
        .with_client(client.clone())
        .with_callback_url(server.callback_url().unwrap())
        .without_maintainer()
        .build()
        .unwrap();
    let receiver = EventReceiver::spawn(registry.clone(), rx);

    registry
        .add_remote_device(remote_light("uuid:remote", "192.168.1.50:1400", 1800))
        .unwrap();
    let log = EventLog::new();
    let target = SubscriptionTarget::known_remote(&registry, switch_ref("uuid:remote")).unwrap();
    let callback = SubscriptionCallback::new(registry.clone(), target, log.clone());
    callback.establish().await.unwrap();

    match &client.requests()[0] {
        RecordedRequest::Subscribe(subscribe) => {
            assert!(subscribe.callback_urls.to_string().ends_with("/notify>"));
        }
        other => panic!("Expected SUBSCRIBE, got {other:?}"),
    }

    assert_eq!(notify(server.port(), "uuid:e2e", "0", EVENT_BODY).await, 200);
    assert_eq!(notify(server.port(), "uuid:e2e", "2", EVENT_BODY).await, 200);
    eventually("two events", || log.events.lock().len() == 2).await;
    assert_eq!(log.sequences(), vec![0, 2]);
    assert_eq!(*log.missed.lock(), vec![1]);

    // The server forwards anything well-formed; the registry decides
    assert_eq!(notify(server.port(), "uuid:stranger", "0", EVENT_BODY).await, 200);

    callback.end().await;
    receiver.abort();
    server.shutdown().await.unwrap();
    registry.shutdown().await.unwrap();
}
