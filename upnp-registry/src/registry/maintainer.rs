//! Periodic registry maintenance.
//!
//! A sweep runs in this order:
//! 1. expired resources are dropped, the rest get their `maintain` hook
//! 2. expired remote devices are removed
//! 3. expired remote subscriptions are ended with `Expired`, those past half
//!    their lifetime are renewed on the task executor
//! 4. expired local subscriptions are ended with `Expired`
//! 5. side effects queued by resource hooks run
//!
//! Local devices are never expired here. Re-advertising them is the job of
//! the discovery layer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::{isolate, PendingExecution, Registry, RegistryInner};
use crate::error::{RegistryError, Result};
use crate::expiration::ExpirationDetails;
use crate::gena::{CancelReason, GenaSubscription, SubscriptionId};
use crate::model::Udn;
use crate::protocol::outgoing;

/// Background task calling [`Registry::maintain`] on a fixed interval.
pub(crate) struct Maintainer {
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Maintainer {
    pub(crate) fn start(registry: Weak<RegistryInner>, period: Duration, handle: &Handle) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let background_task = handle.spawn(Self::maintenance_task(registry, period, shutdown_rx));
        Self {
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the task and wait up to `wait` for it to finish.
    pub(crate) async fn shutdown(mut self, wait: Duration) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.background_task.take() {
            match timeout(wait, task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RegistryError::ShutdownError(format!(
                    "Maintenance task panicked: {e}"
                ))),
                Err(_) => Err(RegistryError::ShutdownError(format!(
                    "Maintenance task shutdown timed out after {wait:?}"
                ))),
            }
        } else {
            Ok(())
        }
    }

    async fn maintenance_task(
        registry: Weak<RegistryInner>,
        period: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = registry.upgrade() else {
                        break;
                    };
                    Registry::from_inner(inner).maintain();
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
        tracing::trace!("Maintenance task stopped");
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        if let Some(task) = self.background_task.take() {
            task.abort();
        }
    }
}

impl Registry {
    /// Run one maintenance sweep now.
    pub fn maintain(&self) {
        if self.is_shut_down() {
            return;
        }
        let now = self.now_seconds();
        let mut pending: Vec<PendingExecution> = Vec::new();

        self.maintain_resources(now, &mut pending);
        self.maintain_remote_devices(now);
        self.maintain_remote_subscriptions(now);
        self.maintain_local_subscriptions(now);

        if !pending.is_empty() {
            tracing::trace!(count = pending.len(), "Running queued maintenance executions");
        }
        for execution in pending {
            isolate("queued maintenance execution", execution);
        }
    }

    fn maintain_resources(&self, now: u64, pending: &mut Vec<PendingExecution>) {
        let expired: Vec<String> = self
            .inner
            .resources
            .iter()
            .filter(|entry| entry.value().expiration.has_expired(false, now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            if self.inner.resources.remove(&id).is_some() {
                tracing::debug!(resource = %id, "Removed expired resource");
            }
        }

        let alive: Vec<(Arc<dyn super::Resource>, ExpirationDetails)> = self
            .inner
            .resources
            .iter()
            .map(|entry| (entry.value().value.clone(), entry.value().expiration))
            .collect();
        for (resource, expiration) in alive {
            isolate("resource maintenance", || resource.maintain(pending, &expiration));
        }
    }

    fn maintain_remote_devices(&self, now: u64) {
        let expired: Vec<Udn> = self
            .inner
            .remote
            .read()
            .devices
            .iter()
            .filter(|(_, item)| item.expiration.has_expired(false, now))
            .map(|(udn, _)| udn.clone())
            .collect();
        for udn in expired {
            tracing::info!(%udn, "Remote device expired");
            self.remove_remote_device(&udn);
        }
    }

    fn maintain_remote_subscriptions(&self, now: u64) {
        let max_attempts = self.inner.config.max_renewal_attempts;
        let (expired, renewals) = {
            let mut remote = self.inner.remote.write();
            let expired_ids: Vec<SubscriptionId> = remote
                .subscriptions
                .iter()
                .filter(|(_, item)| item.expiration.has_expired(false, now))
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<Arc<GenaSubscription>> = expired_ids
                .iter()
                .filter_map(|id| remote.subscriptions.remove(id))
                .map(|item| item.value)
                .collect();

            let mut renewals = Vec::new();
            for item in remote.subscriptions.values_mut() {
                if item.expiration.has_expired(true, now)
                    && item.expiration.renew_attempts() < max_attempts
                    && item.value.begin_renewal()
                {
                    item.expiration.renew_attempted();
                    renewals.push((item.value.clone(), item.expiration.renew_attempts()));
                }
            }
            (expired, renewals)
        };

        for subscription in expired {
            tracing::info!(subscription_id = ?subscription.id(), "Remote subscription expired");
            isolate("remote subscription end", || {
                subscription.end(Some(CancelReason::Expired), None);
            });
        }
        for (subscription, attempt) in renewals {
            tracing::debug!(subscription_id = ?subscription.id(), attempt, "Renewing remote subscription");
            let registry = self.clone();
            // Tracked through the registry, nobody waits on the handle
            let _ = self.executor().submit(async move {
                outgoing::renew(&registry, subscription, attempt).await;
            });
        }
    }

    fn maintain_local_subscriptions(&self, now: u64) {
        let expired: Vec<Arc<GenaSubscription>> = {
            let mut local = self.inner.local.write();
            let ids: Vec<SubscriptionId> = local
                .subscriptions
                .iter()
                .filter(|(_, item)| item.expiration.has_expired(false, now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| local.subscriptions.remove(id))
                .map(|item| item.value)
                .collect()
        };
        for subscription in expired {
            tracing::info!(subscription_id = ?subscription.id(), "Local subscription expired");
            isolate("local subscription end", || {
                subscription.end(Some(CancelReason::Expired), None);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_registry;
    use super::super::Resource;
    use super::*;
    use crate::expiration::ManualClock;
    use crate::model::{DeviceIdentity, RemoteDevice};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResource {
        id: String,
        hooks: Arc<AtomicUsize>,
        executions: Arc<Mutex<Vec<u64>>>,
    }

    impl Resource for CountingResource {
        fn id(&self) -> &str {
            &self.id
        }

        fn maintain(&self, pending: &mut Vec<PendingExecution>, expiration: &ExpirationDetails) {
            self.hooks.fetch_add(1, Ordering::SeqCst);
            let executions = self.executions.clone();
            let refreshed = expiration.last_refresh_seconds();
            pending.push(Box::new(move || executions.lock().push(refreshed)));
        }
    }

    #[tokio::test]
    async fn test_expired_remote_device_is_removed() {
        let clock = Arc::new(ManualClock::at_seconds(0));
        let registry = test_registry(clock.clone());
        registry
            .add_remote_device(RemoteDevice::new(
                DeviceIdentity::new("uuid:short", 2),
                "urn:test:device:Light:1",
            ))
            .unwrap();

        clock.advance_seconds(2);
        registry.maintain();
        assert_eq!(registry.stats().remote_devices, 1);

        clock.advance_seconds(1);
        registry.maintain();
        assert_eq!(registry.stats().remote_devices, 0);
    }

    #[tokio::test]
    async fn test_resource_hooks_run_until_expiry() {
        let clock = Arc::new(ManualClock::at_seconds(100));
        let registry = test_registry(clock.clone());
        let hooks = Arc::new(AtomicUsize::new(0));
        let executions = Arc::new(Mutex::new(Vec::new()));
        registry
            .add_resource(
                Arc::new(CountingResource {
                    id: "/dev/uuid:abc/desc".to_string(),
                    hooks: hooks.clone(),
                    executions: executions.clone(),
                }),
                2,
            )
            .unwrap();

        registry.maintain();
        clock.advance_seconds(2);
        registry.maintain();
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
        assert_eq!(*executions.lock(), vec![100, 100]);

        clock.advance_seconds(1);
        registry.maintain();
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
        assert!(registry.get_resource("/dev/uuid:abc/desc").is_none());
    }

    #[tokio::test]
    async fn test_maintainer_shutdown_stops_task() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        let maintainer = Maintainer::start(
            registry.downgrade(),
            Duration::from_millis(10),
            registry.executor().handle(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        maintainer.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
