//! Local and remote subscription collections.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Registry, RegistryInner, RegistryItem};
use crate::error::{RegistryError, Result};
use crate::expiration::ExpirationDetails;
use crate::gena::{GenaSubscription, SubscriptionId};
use crate::model::ServiceReference;

/// Marks a remote subscription whose SUBSCRIBE response has not been
/// processed yet. NOTIFY handling waits for these before declaring a SID
/// unknown.
pub(crate) struct PendingSubscriptionGuard {
    inner: Arc<RegistryInner>,
}

impl Drop for PendingSubscriptionGuard {
    fn drop(&mut self) {
        self.inner.pending_remote.fetch_sub(1, Ordering::SeqCst);
        self.inner.remote_settled.notify_waiters();
    }
}

impl Registry {
    fn subscription_item(
        &self,
        subscription: &Arc<GenaSubscription>,
    ) -> Result<(SubscriptionId, RegistryItem<Arc<GenaSubscription>>)> {
        self.ensure_running()?;
        let id = subscription.id().ok_or(RegistryError::MissingSubscriptionId)?;
        let expiration =
            ExpirationDetails::new(subscription.actual_duration_seconds(), self.now_seconds());
        Ok((id, RegistryItem::new(subscription.clone(), expiration)))
    }

    /// Track a subscription to a service hosted here. Its expiration runs
    /// from now for the negotiated duration.
    pub fn add_local_subscription(&self, subscription: Arc<GenaSubscription>) -> Result<()> {
        let (id, item) = self.subscription_item(&subscription)?;
        tracing::debug!(subscription_id = %id, service = %subscription.service(), "Local subscription added");
        self.inner.local.write().subscriptions.insert(id, item);
        Ok(())
    }

    pub fn get_local_subscription(&self, id: &SubscriptionId) -> Option<Arc<GenaSubscription>> {
        self.inner
            .local
            .read()
            .subscriptions
            .get(id)
            .map(|item| item.value.clone())
    }

    /// Restart the expiration of a renewed local subscription with its
    /// current duration.
    pub fn update_local_subscription(&self, subscription: &GenaSubscription) -> bool {
        let Some(id) = subscription.id() else {
            return false;
        };
        let now = self.now_seconds();
        match self.inner.local.write().subscriptions.get_mut(&id) {
            Some(item) => {
                item.expiration
                    .refresh(subscription.actual_duration_seconds(), now);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a local subscription. Ending it is up to the caller.
    pub fn remove_local_subscription(&self, id: &SubscriptionId) -> Option<Arc<GenaSubscription>> {
        self.inner
            .local
            .write()
            .subscriptions
            .remove(id)
            .map(|item| item.value)
    }

    pub fn local_subscriptions(&self) -> Vec<Arc<GenaSubscription>> {
        self.inner
            .local
            .read()
            .subscriptions
            .values()
            .map(|item| item.value.clone())
            .collect()
    }

    /// Local subscriptions listening to `service`.
    pub fn local_subscriptions_for(&self, service: &ServiceReference) -> Vec<Arc<GenaSubscription>> {
        self.inner
            .local
            .read()
            .subscriptions
            .values()
            .filter(|item| item.value.service() == service)
            .map(|item| item.value.clone())
            .collect()
    }

    /// Track an established remote subscription. It must carry the SID the
    /// publisher assigned.
    pub fn add_remote_subscription(&self, subscription: Arc<GenaSubscription>) -> Result<()> {
        let (id, item) = self.subscription_item(&subscription)?;
        tracing::debug!(subscription_id = %id, service = %subscription.service(), "Remote subscription added");
        self.inner.remote.write().subscriptions.insert(id, item);
        self.inner.remote_settled.notify_waiters();
        Ok(())
    }

    pub fn get_remote_subscription(&self, id: &SubscriptionId) -> Option<Arc<GenaSubscription>> {
        self.inner
            .remote
            .read()
            .subscriptions
            .get(id)
            .map(|item| item.value.clone())
    }

    /// Record a successful renewal: the expiration restarts and the renewal
    /// attempt counter resets.
    pub fn update_remote_subscription(&self, subscription: &GenaSubscription) -> bool {
        let Some(id) = subscription.id() else {
            return false;
        };
        let now = self.now_seconds();
        match self.inner.remote.write().subscriptions.get_mut(&id) {
            Some(item) => {
                item.expiration
                    .refresh(subscription.actual_duration_seconds(), now);
                true
            }
            None => false,
        }
    }

    pub fn remove_remote_subscription(&self, id: &SubscriptionId) -> Option<Arc<GenaSubscription>> {
        self.inner
            .remote
            .write()
            .subscriptions
            .remove(id)
            .map(|item| item.value)
    }

    pub fn remote_subscriptions(&self) -> Vec<Arc<GenaSubscription>> {
        self.inner
            .remote
            .read()
            .subscriptions
            .values()
            .map(|item| item.value.clone())
            .collect()
    }

    pub(crate) fn register_pending_remote_subscription(&self) -> PendingSubscriptionGuard {
        self.inner.pending_remote.fetch_add(1, Ordering::SeqCst);
        PendingSubscriptionGuard {
            inner: self.inner.clone(),
        }
    }

    /// Look up a remote subscription by SID, waiting while establishments
    /// are in flight.
    ///
    /// A NOTIFY can overtake the SUBSCRIBE response that carries its SID.
    /// While any remote establishment is pending this waits, up to the
    /// configured `pending_subscription_wait`, for the SID to show up.
    pub async fn wait_remote_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Option<Arc<GenaSubscription>> {
        let deadline = tokio::time::Instant::now() + self.inner.config.pending_subscription_wait;
        loop {
            // Register interest before checking, so a settle in between is
            // not lost.
            let settled = self.inner.remote_settled.notified();
            if let Some(subscription) = self.get_remote_subscription(id) {
                return Some(subscription);
            }
            if self.inner.pending_remote.load(Ordering::SeqCst) == 0 {
                return None;
            }
            tracing::trace!(subscription_id = %id, "Waiting for pending subscriptions to settle");
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return self.get_remote_subscription(id);
            }
        }
    }
}
