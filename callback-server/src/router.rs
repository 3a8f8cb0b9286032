//! Event routing for HTTP callback notifications.
//!
//! This module provides the `EventRouter` which decides which incoming UPnP
//! NOTIFY requests are forwarded to the consumer channel.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Generic notification payload for UPnP event notifications.
///
/// This represents an unparsed UPnP event notification that has been received
/// via HTTP callback: the GENA headers as sent plus the raw XML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// The subscription ID from the UPnP SID header, e.g. `uuid:1234`
    pub subscription_id: String,
    /// The SEQ header, the event's sequence number
    pub sequence: Option<String>,
    /// The NT header, `upnp:event` for well-formed events
    pub nt: Option<String>,
    /// The NTS header, `upnp:propchange` for well-formed events
    pub nts: Option<String>,
    /// The raw XML event body
    pub event_xml: String,
}

/// Which subscription ids the router forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutingMode {
    /// Only ids registered through [`EventRouter::register`]
    Registered,
    /// Every id; the consumer decides what it knows
    AcceptAll,
}

/// Routes events from HTTP callbacks to a channel.
///
/// In the default mode the router maintains a set of active subscription
/// IDs and drops events for anything else. A router created with
/// [`EventRouter::accepting_all`] forwards every event and leaves the
/// decision to the consumer, which suits a consumer that tracks its own
/// subscriptions.
#[derive(Clone)]
pub struct EventRouter {
    /// Set of active subscription IDs
    subscriptions: Arc<RwLock<HashSet<String>>>,
    /// Channel for sending notification payloads
    event_sender: mpsc::UnboundedSender<NotificationPayload>,
    mode: RoutingMode,
}

impl EventRouter {
    /// Create a router forwarding only registered subscription IDs.
    ///
    /// # Example
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use callback_server::router::{EventRouter, NotificationPayload};
    ///
    /// let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// let router = EventRouter::new(tx);
    /// assert!(!router.accepts_all());
    /// ```
    pub fn new(event_sender: mpsc::UnboundedSender<NotificationPayload>) -> Self {
        Self::with_mode(event_sender, RoutingMode::Registered)
    }

    /// Create a router forwarding every event.
    pub fn accepting_all(event_sender: mpsc::UnboundedSender<NotificationPayload>) -> Self {
        Self::with_mode(event_sender, RoutingMode::AcceptAll)
    }

    fn with_mode(
        event_sender: mpsc::UnboundedSender<NotificationPayload>,
        mode: RoutingMode,
    ) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            event_sender,
            mode,
        }
    }

    pub fn accepts_all(&self) -> bool {
        self.mode == RoutingMode::AcceptAll
    }

    /// Register a subscription ID for event routing.
    ///
    /// # Example
    ///
    /// ```
    /// # use tokio::sync::mpsc;
    /// # use callback_server::router::{EventRouter, NotificationPayload};
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let (tx, _rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// # let router = EventRouter::new(tx);
    /// router.register("uuid:subscription-123".to_string()).await;
    /// # }
    /// ```
    pub async fn register(&self, subscription_id: String) {
        let mut subs = self.subscriptions.write().await;
        subs.insert(subscription_id);
    }

    /// Unregister a subscription ID.
    pub async fn unregister(&self, subscription_id: &str) {
        let mut subs = self.subscriptions.write().await;
        subs.remove(subscription_id);
    }

    /// Whether an event for `subscription_id` would be forwarded.
    pub async fn is_routable(&self, subscription_id: &str) -> bool {
        match self.mode {
            RoutingMode::AcceptAll => true,
            RoutingMode::Registered => self.subscriptions.read().await.contains(subscription_id),
        }
    }

    /// Route an incoming event to the channel.
    ///
    /// Returns `false`, dropping the event, when the subscription ID is not
    /// routable or the consumer is gone.
    ///
    /// # Example
    ///
    /// ```
    /// # use tokio::sync::mpsc;
    /// # use callback_server::router::{EventRouter, NotificationPayload};
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// # let router = EventRouter::new(tx);
    /// # router.register("uuid:subscription-123".to_string()).await;
    /// let routed = router.route_event(NotificationPayload {
    ///     subscription_id: "uuid:subscription-123".to_string(),
    ///     sequence: Some("0".to_string()),
    ///     nt: Some("upnp:event".to_string()),
    ///     nts: Some("upnp:propchange".to_string()),
    ///     event_xml: "<e:propertyset/>".to_string(),
    /// }).await;
    /// assert!(routed);
    /// # }
    /// ```
    pub async fn route_event(&self, payload: NotificationPayload) -> bool {
        if !self.is_routable(&payload.subscription_id).await {
            tracing::debug!(
                subscription_id = %payload.subscription_id,
                "Dropping event for unregistered subscription"
            );
            return false;
        }
        if self.event_sender.send(payload).is_err() {
            tracing::warn!("Event consumer is gone, dropping event");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(sid: &str, seq: &str) -> NotificationPayload {
        NotificationPayload {
            subscription_id: sid.to_string(),
            sequence: Some(seq.to_string()),
            nt: Some("upnp:event".to_string()),
            nts: Some("upnp:propchange".to_string()),
            event_xml: "<e:propertyset/>".to_string(),
        }
    }

    #[tokio::test]
    async fn test_event_router_register_and_route() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(tx);

        router.register("uuid:sub-123".to_string()).await;

        let routed = router.route_event(payload("uuid:sub-123", "4")).await;
        assert!(routed);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, payload("uuid:sub-123", "4"));
    }

    #[tokio::test]
    async fn test_event_router_unregister() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(tx);

        router.register("uuid:sub-123".to_string()).await;
        router.unregister("uuid:sub-123").await;

        assert!(!router.route_event(payload("uuid:sub-123", "0")).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_accepting_all_routes_unknown_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::accepting_all(tx);

        assert!(router.accepts_all());
        assert!(router.route_event(payload("uuid:never-registered", "0")).await);
        assert_eq!(rx.recv().await.unwrap().subscription_id, "uuid:never-registered");
    }

    #[tokio::test]
    async fn test_closed_consumer_is_not_routed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = EventRouter::accepting_all(tx);
        drop(rx);

        assert!(!router.route_event(payload("uuid:sub-1", "0")).await);
    }
}
