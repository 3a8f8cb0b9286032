//! Registry entries and generic expiring resources.

use std::sync::Arc;

use crate::expiration::ExpirationDetails;

/// Side effect queued during a sweep, run once the sweep released its locks.
pub type PendingExecution = Box<dyn FnOnce() + Send + 'static>;

/// A value tracked by the Registry together with its expiration.
#[derive(Debug, Clone)]
pub struct RegistryItem<T> {
    pub value: T,
    pub expiration: ExpirationDetails,
}

impl<T> RegistryItem<T> {
    pub fn new(value: T, expiration: ExpirationDetails) -> Self {
        Self { value, expiration }
    }
}

/// An expiring entry that is neither a device nor a subscription, such as a
/// cached descriptor path.
///
/// Ids are paths relative to the local HTTP namespace.
pub trait Resource: Send + Sync {
    fn id(&self) -> &str;

    /// Called on every sweep while the resource is alive. Side effects go in
    /// `pending`; they run after the sweep, outside any registry lock.
    fn maintain(&self, _pending: &mut Vec<PendingExecution>, _expiration: &ExpirationDetails) {}

    /// Called when the Registry shuts down.
    fn shutdown(&self) {}
}

pub(crate) type ResourceEntry = RegistryItem<Arc<dyn Resource>>;

/// Whether `id` is usable as a resource id.
pub(crate) fn is_relative(id: &str) -> bool {
    url::Url::parse(id).is_err()
}
