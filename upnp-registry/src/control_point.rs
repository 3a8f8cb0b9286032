//! Control-point side of a subscription.
//!
//! [`SubscriptionCallback`] drives one subscription from establishment to
//! end, for a local service in this process or a service on another device,
//! and reports every transition to a [`SubscriptionHandler`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::GenaError;
use crate::gena::{GenaSubscription, SubscriptionFailure, SubscriptionHandler};
use crate::model::{RemoteService, ServiceReference};
use crate::protocol::outgoing;
use crate::registry::Registry;

/// The service a [`SubscriptionCallback`] listens to.
#[derive(Debug, Clone)]
pub enum SubscriptionTarget {
    /// A service of a local device registered with the Registry
    Local(ServiceReference),
    /// A service reached over the network through its event URL
    Remote {
        service: ServiceReference,
        endpoint: RemoteService,
    },
}

impl SubscriptionTarget {
    pub fn remote(service: ServiceReference, endpoint: RemoteService) -> Self {
        Self::Remote { service, endpoint }
    }

    /// Resolve a remote target through the devices the Registry knows.
    pub fn known_remote(registry: &Registry, service: ServiceReference) -> Option<Self> {
        let endpoint = registry.get_remote_service(&service)?;
        Some(Self::Remote { service, endpoint })
    }

    pub fn service(&self) -> &ServiceReference {
        match self {
            Self::Local(service) | Self::Remote { service, .. } => service,
        }
    }
}

/// Establishes and ends one subscription on behalf of a caller.
///
/// A callback is single use: once ended it does not establish again, and a
/// new subscription needs a new callback.
pub struct SubscriptionCallback {
    registry: Registry,
    target: SubscriptionTarget,
    requested_duration_seconds: u32,
    handler: Arc<dyn SubscriptionHandler>,
    subscription: Mutex<Option<Arc<GenaSubscription>>>,
    cancel: CancellationToken,
}

impl SubscriptionCallback {
    pub fn new(
        registry: Registry,
        target: SubscriptionTarget,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Self {
        let requested_duration_seconds = registry.config().default_subscription_duration;
        Self {
            registry,
            target,
            requested_duration_seconds,
            handler,
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Duration to request from a remote publisher. Local subscriptions
    /// ignore it.
    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.requested_duration_seconds = seconds;
        self
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// The subscription, once establishment started.
    pub fn subscription(&self) -> Option<Arc<GenaSubscription>> {
        self.subscription.lock().clone()
    }

    /// Token that aborts an in-flight establishment when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort an establishment still in progress. Has no effect on an
    /// established subscription; use [`end`](Self::end) for that.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Establish the subscription.
    ///
    /// The handler sees `established` on success and `failed` otherwise.
    /// Calling this again while the subscription is live returns it as is.
    pub async fn establish(&self) -> Result<Arc<GenaSubscription>, SubscriptionFailure> {
        if let Some(existing) = self.subscription().filter(|s| !s.is_ended()) {
            return Ok(existing);
        }
        if self.cancel.is_cancelled() {
            let failure = SubscriptionFailure::Cancelled;
            self.handler.failed(None, &failure);
            return Err(failure);
        }
        if self.registry.is_shut_down() {
            let failure = SubscriptionFailure::Precondition(GenaError::Registry(
                "registry has been shut down".to_string(),
            ));
            self.handler.failed(None, &failure);
            return Err(failure);
        }

        match &self.target {
            SubscriptionTarget::Local(service) => self.establish_local(service),
            SubscriptionTarget::Remote { service, endpoint } => {
                self.establish_remote(service, endpoint).await
            }
        }
    }

    fn establish_local(
        &self,
        service: &ServiceReference,
    ) -> Result<Arc<GenaSubscription>, SubscriptionFailure> {
        let Some(local) = self.registry.get_local_service(service) else {
            let error = if self.registry.get_local_device(&service.udn, false).is_none() {
                GenaError::DeviceNotRegistered(service.udn.clone())
            } else {
                GenaError::ServiceNotFound {
                    udn: service.udn.clone(),
                    service: service.service_id.clone(),
                }
            };
            tracing::debug!(%service, %error, "Local subscription refused");
            let failure = SubscriptionFailure::Precondition(error);
            self.handler.failed(None, &failure);
            return Err(failure);
        };

        let subscription =
            GenaSubscription::local_in_process(service.clone(), local, self.handler.clone());
        *self.subscription.lock() = Some(subscription.clone());

        if let Err(e) = self.registry.add_local_subscription(subscription.clone()) {
            let failure = SubscriptionFailure::Precondition(GenaError::Registry(e.to_string()));
            subscription.fail(&failure);
            return Err(failure);
        }
        if self.cancel.is_cancelled() {
            // end() may have run before the entry existed
            if let Some(id) = subscription.id() {
                self.registry.remove_local_subscription(&id);
            }
            let failure = SubscriptionFailure::Cancelled;
            subscription.fail(&failure);
            return Err(failure);
        }
        subscription.establish();
        subscription.deliver_initial_event(self.registry.now_millis());
        Ok(subscription)
    }

    async fn establish_remote(
        &self,
        service: &ServiceReference,
        endpoint: &RemoteService,
    ) -> Result<Arc<GenaSubscription>, SubscriptionFailure> {
        let subscription = GenaSubscription::remote(
            service.clone(),
            endpoint.clone(),
            self.requested_duration_seconds,
            self.handler.clone(),
        );
        *self.subscription.lock() = Some(subscription.clone());

        outgoing::subscribe(&self.registry, &subscription, &self.cancel).await?;

        if self.cancel.is_cancelled() && subscription.is_ended() {
            // end() tore it down right after registration
            return Err(SubscriptionFailure::Cancelled);
        }
        Ok(subscription)
    }

    /// End the subscription. Only the first call has an effect.
    ///
    /// A local subscription ends right away. A remote one is removed from the
    /// Registry first, then UNSUBSCRIBE runs on the executor and this call
    /// waits for it.
    pub async fn end(&self) {
        self.cancel.cancel();
        let Some(subscription) = self.subscription.lock().take() else {
            return;
        };
        let Some(id) = subscription.id() else {
            return;
        };

        if subscription.is_local() {
            if let Some(removed) = self.registry.remove_local_subscription(&id) {
                removed.end(None, None);
            }
            return;
        }

        let Some(removed) = self.registry.remove_remote_subscription(&id) else {
            tracing::debug!(subscription_id = %id, "Remote subscription already gone");
            return;
        };
        let client = self.registry.client().clone();
        self.registry
            .executor()
            .submit(async move {
                outgoing::unsubscribe(client.as_ref(), &removed).await;
            })
            .wait()
            .await;
    }
}

impl std::fmt::Debug for SubscriptionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallback")
            .field("target", &self.target)
            .field("requested_duration_seconds", &self.requested_duration_seconds)
            .field("subscription", &self.subscription.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ManualClock;
    use crate::gena::{RecordingHandler, SubscriptionPhase};
    use crate::model::{DeviceIdentity, LocalDevice, LocalService, StateVariable};
    use crate::registry::tests::test_registry;

    const SWITCH: &str = "urn:upnp-org:serviceId:SwitchPower";

    fn light() -> (LocalDevice, Arc<LocalService>) {
        let service = Arc::new(
            LocalService::new(SWITCH, "urn:schemas-upnp-org:service:SwitchPower:1")
                .with_variable(StateVariable::evented("Status"), "0"),
        );
        let device = LocalDevice::new(
            DeviceIdentity::new("uuid:light", 0),
            "urn:schemas-upnp-org:device:BinaryLight:1",
        )
        .with_service(service.clone());
        (device, service)
    }

    #[tokio::test]
    async fn test_local_subscription_sequences() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(1_000)));
        let (device, service) = light();
        registry.add_local_device(device).unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let callback = SubscriptionCallback::new(
            registry.clone(),
            SubscriptionTarget::Local(ServiceReference::new("uuid:light", SWITCH)),
            handler.clone(),
        );
        let subscription = callback.establish().await.unwrap();
        assert_eq!(subscription.phase(), SubscriptionPhase::Established);
        assert_eq!(*handler.established.lock(), 1);

        service.update("Status", "1");
        service.update("Status", "0");

        let sequences: Vec<u32> = handler.events.lock().iter().map(|e| e.sequence.value()).collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        let id = subscription.id().unwrap();
        callback.end().await;
        callback.end().await;
        assert!(registry.get_local_subscription(&id).is_none());
        assert_eq!(handler.ended.lock().as_slice(), &[(None, None)]);
    }

    #[tokio::test]
    async fn test_unregistered_device_fails_without_entry() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(1_000)));
        let handler = Arc::new(RecordingHandler::default());
        let callback = SubscriptionCallback::new(
            registry.clone(),
            SubscriptionTarget::Local(ServiceReference::new("uuid:missing", SWITCH)),
            handler.clone(),
        );

        let failure = callback.establish().await.unwrap_err();
        assert_eq!(
            failure,
            SubscriptionFailure::Precondition(GenaError::DeviceNotRegistered("uuid:missing".into()))
        );
        assert!(failure.response().is_none());
        assert_eq!(handler.failures.lock().len(), 1);
        assert!(registry.local_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_service_on_registered_device() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(1_000)));
        let (device, _service) = light();
        registry.add_local_device(device).unwrap();

        let callback = SubscriptionCallback::new(
            registry.clone(),
            SubscriptionTarget::Local(ServiceReference::new(
                "uuid:light",
                "urn:upnp-org:serviceId:Dimming",
            )),
            Arc::new(RecordingHandler::default()),
        );
        let failure = callback.establish().await.unwrap_err();
        assert!(matches!(
            failure,
            SubscriptionFailure::Precondition(GenaError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_establish() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(1_000)));
        let (device, _service) = light();
        registry.add_local_device(device).unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let callback = SubscriptionCallback::new(
            registry.clone(),
            SubscriptionTarget::Local(ServiceReference::new("uuid:light", SWITCH)),
            handler.clone(),
        );
        callback.cancel();
        assert_eq!(callback.establish().await.unwrap_err(), SubscriptionFailure::Cancelled);
        assert!(registry.local_subscriptions().is_empty());
        assert_eq!(*handler.established.lock(), 0);
    }
}
