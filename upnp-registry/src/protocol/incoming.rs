//! Requests this process receives: SUBSCRIBE and UNSUBSCRIBE for local
//! services, NOTIFY for remote subscriptions.
//!
//! The HTTP server itself lives elsewhere. It hands the relevant headers in
//! and writes the returned [`GenaResponse`] back.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use url::{Host, Url};

use crate::gena::headers::names;
use crate::gena::{
    read_propertyset, status, CallbackUrls, GenaResponse, GenaSubscription, NotifyRequest,
    OutboundEvent, SubscriptionId, SubscriptionTimeout, NTS_PROPCHANGE, NT_EVENT,
};
use crate::model::ServiceReference;
use crate::registry::Registry;
use crate::sequence::EventSequence;

/// Headers of a SUBSCRIBE addressed to a local service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingSubscribe {
    pub sid: Option<String>,
    pub nt: Option<String>,
    pub callback: Option<String>,
    pub timeout: Option<String>,
}

/// Headers of an UNSUBSCRIBE addressed to a local service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingUnsubscribe {
    pub sid: Option<String>,
    pub nt: Option<String>,
    pub callback: Option<String>,
}

/// A NOTIFY received on a callback URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingEvent {
    pub sid: Option<String>,
    pub nt: Option<String>,
    pub nts: Option<String>,
    pub seq: Option<String>,
    pub body: String,
}

/// Result of handling a SUBSCRIBE.
#[derive(Debug)]
pub struct SubscribeOutcome {
    pub response: GenaResponse,
    /// Present for a new subscription. The caller reports whether the
    /// response reached the subscriber; the initial event follows only then.
    pub confirmation: Option<SubscribeConfirmation>,
}

/// Completes a new inbound subscription once its response was sent.
///
/// Dropping it without calling [`response_sent`](Self::response_sent)
/// removes the subscription again.
#[derive(Debug)]
pub struct SubscribeConfirmation {
    registry: Registry,
    subscription: Arc<GenaSubscription>,
    confirmed: bool,
}

impl SubscribeConfirmation {
    pub fn subscription(&self) -> &Arc<GenaSubscription> {
        &self.subscription
    }

    /// With `delivered` the subscription is established and its initial
    /// event queued. Otherwise it is dropped.
    pub fn response_sent(mut self, delivered: bool) {
        self.confirmed = true;
        let Some(id) = self.subscription.id() else {
            return;
        };
        if !delivered {
            tracing::warn!(subscription_id = %id, "SUBSCRIBE response not delivered, dropping subscription");
            self.roll_back(&id);
            return;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscription.attach_outbound(sender);
        spawn_notifier(&self.registry, &self.subscription, id, receiver);
        self.subscription.establish();
        self.subscription
            .deliver_initial_event(self.registry.now_millis());
    }

    fn roll_back(&self, id: &SubscriptionId) {
        self.registry.remove_local_subscription(id);
        self.subscription.end(None, None);
    }
}

impl Drop for SubscribeConfirmation {
    fn drop(&mut self) {
        if self.confirmed {
            return;
        }
        if let Some(id) = self.subscription.id() {
            tracing::warn!(subscription_id = %id, "SUBSCRIBE response never confirmed, dropping subscription");
            self.roll_back(&id);
        }
    }
}

/// Send each queued event to every callback URL, one event at a time.
fn spawn_notifier(
    registry: &Registry,
    subscription: &GenaSubscription,
    id: SubscriptionId,
    mut events: mpsc::UnboundedReceiver<OutboundEvent>,
) {
    let client = registry.client().clone();
    let urls = subscription.callback_urls().to_vec();
    registry.executor().handle().spawn(async move {
        while let Some(event) = events.recv().await {
            for url in &urls {
                let request = NotifyRequest {
                    url: url.clone(),
                    subscription_id: id.clone(),
                    sequence: event.sequence,
                    body: event.body.clone(),
                };
                match client.notify(&request).await {
                    Ok(response) if response.is_success() => {
                        tracing::trace!(subscription_id = %id, sequence = %event.sequence, %url, "Event delivered");
                    }
                    Ok(response) => {
                        tracing::warn!(subscription_id = %id, %url, status = response.status, "Subscriber rejected event");
                    }
                    Err(e) => {
                        tracing::warn!(subscription_id = %id, %url, error = %e, "Event delivery failed");
                    }
                }
            }
        }
        tracing::trace!(subscription_id = %id, "Notifier stopped");
    });
}

/// Whether a subscriber callback points into the local network.
fn is_local_network(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_local_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_local_ip(IpAddr::V6(ip)),
        Some(Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fe80::/10 link-local, fc00::/7 unique local
            v6.is_loopback() || (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00
        }
    }
}

fn response(code: u16) -> GenaResponse {
    GenaResponse::new(code)
}

impl Registry {
    /// Duration granted to an inbound subscriber.
    fn negotiate_duration(&self, timeout: Option<&str>) -> u32 {
        let default = self.config().default_subscription_duration;
        if self.config().received_subscription_timeout_ignored {
            return default;
        }
        match timeout.and_then(|t| t.parse::<SubscriptionTimeout>().ok()) {
            Some(SubscriptionTimeout::Seconds(seconds)) if seconds > 0 && seconds < default => {
                seconds
            }
            _ => default,
        }
    }

    /// Handle a SUBSCRIBE (new or renewal) for a local service.
    ///
    /// Status codes: 404 for an unknown service, 400 when a SID is combined
    /// with NT or CALLBACK, 412 for a missing or invalid NT or CALLBACK, an
    /// unknown SID or a callback outside the local network.
    pub fn handle_subscribe(
        &self,
        service: &ServiceReference,
        request: IncomingSubscribe,
    ) -> SubscribeOutcome {
        let rejected = |code: u16| SubscribeOutcome {
            response: response(code),
            confirmation: None,
        };
        if self.is_shut_down() {
            return rejected(status::PRECONDITION_FAILED);
        }
        let Some(local) = self.get_local_service(service) else {
            tracing::debug!(%service, "SUBSCRIBE for unknown service");
            return rejected(status::NOT_FOUND);
        };

        if let Some(sid) = request.sid {
            if request.nt.is_some() || request.callback.is_some() {
                return rejected(status::BAD_REQUEST);
            }
            let Some(subscription) = sid
                .parse::<SubscriptionId>()
                .ok()
                .and_then(|id| self.get_local_subscription(&id))
                .filter(|s| s.service() == service)
            else {
                tracing::debug!(%sid, "Renewal for unknown subscription");
                return rejected(status::PRECONDITION_FAILED);
            };
            let duration = self.negotiate_duration(request.timeout.as_deref());
            subscription.set_duration(duration);
            self.update_local_subscription(&subscription);
            tracing::debug!(%sid, duration, "Local subscription renewed");
            return SubscribeOutcome {
                response: response(status::OK)
                    .with_header(names::SID, sid)
                    .with_header(names::TIMEOUT, SubscriptionTimeout::header_value(duration)),
                confirmation: None,
            };
        }

        if request.nt.as_deref() != Some(NT_EVENT) {
            return rejected(status::PRECONDITION_FAILED);
        }
        let Some(callback) = request.callback.as_deref() else {
            return rejected(status::PRECONDITION_FAILED);
        };
        let callback_urls = match CallbackUrls::parse(callback) {
            Ok(urls) => urls,
            Err(e) => {
                tracing::debug!(error = %e, "SUBSCRIBE with unusable callback");
                return rejected(status::PRECONDITION_FAILED);
            }
        };
        if let Some(url) = callback_urls.urls().iter().find(|u| !is_local_network(u)) {
            tracing::warn!(%url, "Refusing callback outside the local network");
            return rejected(status::PRECONDITION_FAILED);
        }

        let duration = self.negotiate_duration(request.timeout.as_deref());
        let subscription = GenaSubscription::local_for_callbacks(
            service.clone(),
            local,
            callback_urls.into_inner(),
            duration,
        );
        if let Err(e) = self.add_local_subscription(subscription.clone()) {
            tracing::warn!(error = %e, "Could not track new local subscription");
            return rejected(status::INTERNAL_SERVER_ERROR);
        }
        let Some(id) = subscription.id() else {
            return rejected(status::INTERNAL_SERVER_ERROR);
        };
        tracing::info!(subscription_id = %id, %service, duration, "Local subscription accepted");

        SubscribeOutcome {
            response: response(status::OK)
                .with_header(names::SID, id.to_string())
                .with_header(names::TIMEOUT, SubscriptionTimeout::header_value(duration)),
            confirmation: Some(SubscribeConfirmation {
                registry: self.clone(),
                subscription,
                confirmed: false,
            }),
        }
    }

    /// Handle an UNSUBSCRIBE for a local service.
    pub fn handle_unsubscribe(
        &self,
        service: &ServiceReference,
        request: IncomingUnsubscribe,
    ) -> GenaResponse {
        if request.nt.is_some() || request.callback.is_some() {
            return response(status::BAD_REQUEST);
        }
        let Some(id) = request.sid.and_then(|sid| sid.parse::<SubscriptionId>().ok()) else {
            return response(status::PRECONDITION_FAILED);
        };
        let known = self
            .get_local_subscription(&id)
            .map_or(false, |s| s.service() == service);
        if !known {
            return response(status::PRECONDITION_FAILED);
        }
        if let Some(subscription) = self.remove_local_subscription(&id) {
            subscription.end(None, None);
        }
        tracing::debug!(subscription_id = %id, "Local subscription removed on request");
        response(status::OK)
    }

    /// Handle a NOTIFY for a remote subscription.
    ///
    /// 412 for a missing or unknown SID or a missing SEQ, 400 for a missing
    /// or wrong NT or NTS, 500 when the body does not decode.
    pub async fn handle_event(&self, event: IncomingEvent) -> GenaResponse {
        let Some(id) = event.sid.as_deref().and_then(|sid| sid.parse::<SubscriptionId>().ok())
        else {
            return response(status::PRECONDITION_FAILED);
        };
        if event.nt.as_deref() != Some(NT_EVENT) || event.nts.as_deref() != Some(NTS_PROPCHANGE) {
            return response(status::BAD_REQUEST);
        }
        let Some(sequence) = event
            .seq
            .as_deref()
            .and_then(|seq| seq.parse::<EventSequence>().ok())
        else {
            return response(status::PRECONDITION_FAILED);
        };

        let values = match read_propertyset(&event.body) {
            Ok(values) => values,
            Err(e) => {
                tracing::debug!(subscription_id = %id, error = %e, "Undecodable event body");
                if let Some(subscription) = self.get_remote_subscription(&id) {
                    subscription.invalid_message(&e);
                }
                return response(status::INTERNAL_SERVER_ERROR);
            }
        };

        let Some(subscription) = self.wait_remote_subscription(&id).await else {
            tracing::debug!(subscription_id = %id, "Event for unknown subscription");
            return response(status::PRECONDITION_FAILED);
        };
        let outcome = subscription.receive_event(sequence, values);
        tracing::trace!(subscription_id = %id, %sequence, ?outcome, "Event received");
        response(status::OK)
    }
}
