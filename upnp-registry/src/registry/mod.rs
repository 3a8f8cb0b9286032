//! The Registry: the in-memory store of devices, subscriptions and
//! resources that every other part of the stack consults.
//!
//! # Locking
//!
//! Remote items and local items sit behind two separate locks. Whenever both
//! are needed the remote lock is taken first. Listener callbacks,
//! subscription handlers and queued side effects run only after every
//! registry lock was released, so they are free to call back into the
//! Registry.
//!
//! # Maintenance
//!
//! [`Registry::maintain`] performs one sweep: expired resources, devices and
//! subscriptions are removed, remote subscriptions past half their lifetime
//! are renewed. A background [`Maintainer`] calls it on a fixed interval
//! unless the Registry was built without one, in which case tests drive
//! sweeps directly together with a [`ManualClock`](crate::expiration::ManualClock).

mod builder;
mod devices;
mod item;
mod listener;
mod maintainer;
mod resources;
mod subscriptions;

pub use builder::RegistryBuilder;
pub use item::{PendingExecution, RegistryItem, Resource};
pub use listener::{ChannelListener, RegistryEvent, RegistryListener};

pub(crate) use subscriptions::PendingSubscriptionGuard;

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use url::Url;

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::expiration::Clock;
use crate::gena::{CancelReason, GenaSubscription, SubscriptionId};
use crate::model::{LocalDevice, LocalService, RemoteDevice, ServiceReference, StateChangeObserver, Udn};
use crate::transport::{GenaClient, TaskExecutor};

use item::ResourceEntry;
use maintainer::Maintainer;

#[derive(Default)]
struct RemoteItems {
    devices: HashMap<Udn, RegistryItem<RemoteDevice>>,
    subscriptions: HashMap<SubscriptionId, RegistryItem<Arc<GenaSubscription>>>,
}

#[derive(Default)]
struct LocalItems {
    devices: HashMap<Udn, RegistryItem<LocalDevice>>,
    subscriptions: HashMap<SubscriptionId, RegistryItem<Arc<GenaSubscription>>>,
}

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    client: Arc<dyn GenaClient>,
    executor: TaskExecutor,
    callback_urls: RwLock<Vec<Url>>,
    remote: RwLock<RemoteItems>,
    local: RwLock<LocalItems>,
    resources: DashMap<String, ResourceEntry>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    pending_remote: AtomicUsize,
    remote_settled: Notify,
    maintainer: Mutex<Option<Maintainer>>,
    shut_down: AtomicBool,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Point-in-time counts of everything the Registry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub remote_devices: usize,
    pub local_devices: usize,
    pub remote_subscriptions: usize,
    pub local_subscriptions: usize,
    pub resources: usize,
    pub pending_remote_subscriptions: usize,
    pub maintainer_running: bool,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registry Statistics:")?;
        writeln!(f, "  Remote devices: {}", self.remote_devices)?;
        writeln!(f, "  Local devices: {}", self.local_devices)?;
        writeln!(f, "  Remote subscriptions: {}", self.remote_subscriptions)?;
        writeln!(f, "  Local subscriptions: {}", self.local_subscriptions)?;
        writeln!(f, "  Resources: {}", self.resources)?;
        writeln!(
            f,
            "  Pending remote subscriptions: {}",
            self.pending_remote_subscriptions
        )?;
        write!(f, "  Maintainer running: {}", self.maintainer_running)
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registry with `config`, the HTTP client, the system clock and a
    /// running maintainer. Must be called inside a tokio runtime.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        RegistryBuilder::new().with_config(config).build()
    }

    pub(crate) fn from_parts(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        client: Arc<dyn GenaClient>,
        executor: TaskExecutor,
        callback_urls: Vec<Url>,
        listeners: Vec<Arc<dyn RegistryListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                clock,
                client,
                executor,
                callback_urls: RwLock::new(callback_urls),
                remote: RwLock::new(RemoteItems::default()),
                local: RwLock::new(LocalItems::default()),
                resources: DashMap::new(),
                listeners: RwLock::new(listeners),
                pending_remote: AtomicUsize::new(0),
                remote_settled: Notify::new(),
                maintainer: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn client(&self) -> &Arc<dyn GenaClient> {
        &self.inner.client
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    pub(crate) fn now_seconds(&self) -> u64 {
        self.inner.clock.now_seconds()
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    /// URLs handed to publishers in the CALLBACK header of outgoing
    /// subscriptions.
    pub fn callback_urls(&self) -> Vec<Url> {
        self.inner.callback_urls.read().clone()
    }

    pub fn set_callback_urls(&self, urls: Vec<Url>) {
        *self.inner.callback_urls.write() = urls;
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RegistryListener>) {
        self.inner
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Call `notify` on a snapshot of the listeners. Must not be called with
    /// a registry lock held.
    fn notify_listeners(&self, what: &str, notify: impl Fn(&dyn RegistryListener)) {
        let listeners = self.inner.listeners.read().clone();
        for listener in listeners {
            isolate(what, || notify(listener.as_ref()));
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        Ok(())
    }

    /// Start the background maintainer if it is not running.
    ///
    /// Every remote device is re-stamped first, so time spent paused does
    /// not count against advertised max-ages.
    pub fn resume(&self) {
        if self.is_shut_down() {
            return;
        }
        let mut maintainer = self.inner.maintainer.lock();
        if maintainer.is_some() {
            return;
        }
        let now = self.now_seconds();
        for item in self.inner.remote.write().devices.values_mut() {
            item.expiration.stamp(now);
        }
        *maintainer = Some(Maintainer::start(
            self.downgrade(),
            self.inner.config.maintenance_interval,
            self.inner.executor.handle(),
        ));
        tracing::debug!(
            interval = ?self.inner.config.maintenance_interval,
            "Registry maintainer started"
        );
    }

    /// Stop the background maintainer. Explicit [`maintain`](Self::maintain)
    /// calls keep working.
    pub async fn pause(&self) {
        let maintainer = self.inner.maintainer.lock().take();
        if let Some(maintainer) = maintainer {
            if let Err(e) = maintainer.shutdown(self.inner.config.shutdown_timeout).await {
                tracing::warn!(error = %e, "Maintainer did not stop cleanly");
            }
            tracing::debug!("Registry maintainer paused");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.maintainer.lock().is_none()
    }

    /// Shut the registry down.
    ///
    /// Stops the maintainer, notifies listeners, shuts resources down,
    /// unsubscribes every remote subscription, ends every local subscription
    /// with [`CancelReason::DeviceWasRemoved`] and finally reports
    /// `after_shutdown`. Later calls return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down registry");

        let maintainer = self.inner.maintainer.lock().take();
        let stopped = match maintainer {
            Some(maintainer) => maintainer.shutdown(self.inner.config.shutdown_timeout).await,
            None => Ok(()),
        };

        self.notify_listeners("before_shutdown", |l| l.before_shutdown(self));

        let resources: Vec<Arc<dyn Resource>> = self
            .inner
            .resources
            .iter()
            .map(|entry| entry.value().value.clone())
            .collect();
        self.inner.resources.clear();
        for resource in resources {
            isolate("resource shutdown", || resource.shutdown());
        }

        let remote_subscriptions: Vec<Arc<GenaSubscription>> = {
            let mut remote = self.inner.remote.write();
            remote.devices.clear();
            remote
                .subscriptions
                .drain()
                .map(|(_, item)| item.value)
                .collect()
        };
        let client = self.inner.client.clone();
        futures::future::join_all(
            remote_subscriptions
                .iter()
                .map(|s| crate::protocol::outgoing::unsubscribe(client.as_ref(), s)),
        )
        .await;

        let (local_devices, local_subscriptions) = {
            let mut local = self.inner.local.write();
            let devices: Vec<LocalDevice> = local.devices.drain().map(|(_, i)| i.value).collect();
            let subscriptions: Vec<Arc<GenaSubscription>> =
                local.subscriptions.drain().map(|(_, i)| i.value).collect();
            (devices, subscriptions)
        };
        for device in &local_devices {
            for (_, service) in device.all_services() {
                service.clear_observer();
            }
        }
        for subscription in local_subscriptions {
            isolate("local subscription end", || {
                subscription.end(Some(CancelReason::DeviceWasRemoved), None);
            });
        }

        self.notify_listeners("after_shutdown", |l| l.after_shutdown());
        tracing::info!("Registry shut down");
        stopped
    }

    pub fn stats(&self) -> RegistryStats {
        let (remote_devices, remote_subscriptions) = {
            let remote = self.inner.remote.read();
            (remote.devices.len(), remote.subscriptions.len())
        };
        let (local_devices, local_subscriptions) = {
            let local = self.inner.local.read();
            (local.devices.len(), local.subscriptions.len())
        };
        RegistryStats {
            remote_devices,
            local_devices,
            remote_subscriptions,
            local_subscriptions,
            resources: self.inner.resources.len(),
            pending_remote_subscriptions: self.inner.pending_remote.load(Ordering::SeqCst),
            maintainer_running: self.inner.maintainer.lock().is_some(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Fans state changes of one local service out to its subscriptions.
struct ServiceObserver {
    registry: Weak<RegistryInner>,
    service: ServiceReference,
}

impl StateChangeObserver for ServiceObserver {
    fn on_state_changed(&self, _service: &LocalService, names: &[String]) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let registry = Registry::from_inner(inner);
        let subscriptions = registry.local_subscriptions_for(&self.service);
        let now = registry.now_millis();
        for subscription in subscriptions {
            isolate("state change delivery", || {
                subscription.on_state_changed(names, now);
            });
        }
    }
}

/// Run `f`, logging instead of propagating a panic.
pub(crate) fn isolate(what: &str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!(what, %message, "Isolated a panic in registry callback");
    }
}
