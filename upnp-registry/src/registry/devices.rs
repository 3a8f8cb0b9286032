//! Local and remote device collections.

use std::collections::HashSet;
use std::sync::Arc;

use super::{isolate, Registry, RegistryItem, ServiceObserver};
use crate::error::{RegistryError, Result};
use crate::expiration::ExpirationDetails;
use crate::gena::{CancelReason, GenaSubscription};
use crate::model::{
    DeviceIdentity, DeviceRef, LocalDevice, LocalService, RemoteDevice, RemoteService,
    ServiceMeta, ServiceRef, ServiceReference, Udn,
};

enum RemoteAdd {
    Added,
    Updated,
}

impl Registry {
    /// Add a discovered device graph, or refresh it if it is already known.
    ///
    /// A known device whose descriptor moved to another host is treated as a
    /// new device: the old entry is removed (ending its subscriptions) and
    /// the new one added.
    pub fn add_remote_device(&self, device: RemoteDevice) -> Result<()> {
        self.ensure_running()?;
        let udn = device.udn().clone();
        if self.is_owned_locally(&device) {
            return Err(RegistryError::UdnOwnedLocally(udn));
        }

        let moved = {
            let remote = self.inner.remote.read();
            remote.devices.get(&udn).map_or(false, |item| {
                item.value.identity().descriptor_host() != device.identity().descriptor_host()
            })
        };
        if moved {
            tracing::info!(%udn, "Remote device changed host, re-adding");
            self.remove_remote_device(&udn);
        }

        let now = self.now_seconds();
        let max_age = self
            .inner
            .config
            .remote_device_max_age(device.identity().max_age_seconds);
        let outcome = {
            let mut remote = self.inner.remote.write();
            match remote.devices.get_mut(&udn) {
                Some(item) => {
                    item.value = device.clone();
                    item.expiration.refresh(max_age, now);
                    RemoteAdd::Updated
                }
                None => {
                    remote.devices.insert(
                        udn.clone(),
                        RegistryItem::new(device.clone(), ExpirationDetails::new(max_age, now)),
                    );
                    RemoteAdd::Added
                }
            }
        };

        match outcome {
            RemoteAdd::Added => {
                tracing::info!(%udn, max_age, "Remote device added");
                self.notify_listeners("remote_device_added", |l| {
                    l.remote_device_added(self, &device)
                });
            }
            RemoteAdd::Updated => {
                tracing::debug!(%udn, max_age, "Remote device refreshed");
                self.notify_listeners("remote_device_updated", |l| {
                    l.remote_device_updated(self, &device)
                });
            }
        }
        Ok(())
    }

    /// Refresh the expiration of the known graph containing `identity.udn`.
    ///
    /// Returns false if the device is unknown, owned locally, or was
    /// announced from a different host, in which case it is removed so a
    /// fresh discovery can add it again.
    pub fn update_remote_device(&self, identity: &DeviceIdentity) -> bool {
        if self.get_local_device(&identity.udn, false).is_some() {
            return false;
        }
        let now = self.now_seconds();
        let max_age = self.inner.config.remote_device_max_age(identity.max_age_seconds);

        let moved_root = {
            let mut remote = self.inner.remote.write();
            let Some(item) = remote
                .devices
                .values_mut()
                .find(|item| item.value.contains(&identity.udn))
            else {
                return false;
            };
            let known_host = item
                .value
                .find_device(&identity.udn)
                .and_then(|d| d.identity().descriptor_host());
            let announced_host = identity.descriptor_host();
            if announced_host.is_some() && known_host.is_some() && announced_host != known_host {
                Some(item.value.udn().clone())
            } else {
                item.expiration.refresh(max_age, now);
                if let Some(url) = &identity.descriptor_url {
                    if item.value.udn() == &identity.udn {
                        item.value.identity_mut().descriptor_url = Some(url.clone());
                    }
                }
                None
            }
        };

        if let Some(root) = moved_root {
            tracing::info!(udn = %identity.udn, "Device announced from a new host, removing");
            self.remove_remote_device(&root);
            return false;
        }
        tracing::trace!(udn = %identity.udn, max_age, "Remote device expiration refreshed");
        true
    }

    /// Remove the remote graph containing `udn`, ending its subscriptions
    /// with [`CancelReason::DeviceWasRemoved`].
    pub fn remove_remote_device(&self, udn: &Udn) -> bool {
        let (device, subscriptions) = {
            let mut remote = self.inner.remote.write();
            let Some(root) = remote
                .devices
                .iter()
                .find(|(_, item)| item.value.contains(udn))
                .map(|(key, _)| key.clone())
            else {
                return false;
            };
            let Some(item) = remote.devices.remove(&root) else {
                return false;
            };
            let udns: HashSet<Udn> = item
                .value
                .all_devices()
                .into_iter()
                .map(|d| d.udn().clone())
                .collect();
            let ids: Vec<_> = remote
                .subscriptions
                .iter()
                .filter(|(_, s)| udns.contains(&s.value.service().udn))
                .map(|(id, _)| id.clone())
                .collect();
            let subscriptions: Vec<Arc<GenaSubscription>> = ids
                .iter()
                .filter_map(|id| remote.subscriptions.remove(id))
                .map(|item| item.value)
                .collect();
            (item.value, subscriptions)
        };

        tracing::info!(udn = %device.udn(), subscriptions = subscriptions.len(), "Remote device removed");
        for subscription in subscriptions {
            isolate("remote subscription end", || {
                subscription.end(Some(CancelReason::DeviceWasRemoved), None);
            });
        }
        self.notify_listeners("remote_device_removed", |l| {
            l.remote_device_removed(self, &device)
        });
        true
    }

    pub fn remove_all_remote_devices(&self) {
        let udns: Vec<Udn> = self.inner.remote.read().devices.keys().cloned().collect();
        for udn in udns {
            self.remove_remote_device(&udn);
        }
    }

    /// Register a device graph hosted by this process. Re-adding a known
    /// UDN replaces the previous graph.
    pub fn add_local_device(&self, device: LocalDevice) -> Result<()> {
        self.ensure_running()?;
        let udn = device.udn().clone();
        let owned_remotely = {
            let remote = self.inner.remote.read();
            device
                .all_devices()
                .iter()
                .any(|d| remote.devices.values().any(|item| item.value.contains(d.udn())))
        };
        if owned_remotely {
            return Err(RegistryError::UdnOwnedRemotely(udn));
        }

        if self.inner.local.read().devices.contains_key(&udn) {
            tracing::debug!(%udn, "Replacing local device");
            self.remove_local_device(&udn);
        }

        for (service_udn, service) in device.all_services() {
            service.set_observer(Arc::new(ServiceObserver {
                registry: self.downgrade(),
                service: ServiceReference::new(service_udn.clone(), service.service_id().clone()),
            }));
        }

        let now = self.now_seconds();
        let expiration = ExpirationDetails::new(device.identity().max_age_seconds, now);
        self.inner
            .local
            .write()
            .devices
            .insert(udn.clone(), RegistryItem::new(device.clone(), expiration));

        tracing::info!(%udn, "Local device added");
        self.notify_listeners("local_device_added", |l| l.local_device_added(self, &device));
        Ok(())
    }

    /// Remove a local root device, ending its subscriptions with
    /// [`CancelReason::DeviceWasRemoved`].
    pub fn remove_local_device(&self, udn: &Udn) -> bool {
        let (device, subscriptions) = {
            let mut local = self.inner.local.write();
            let Some(item) = local.devices.remove(udn) else {
                return false;
            };
            let udns: HashSet<Udn> = item
                .value
                .all_devices()
                .into_iter()
                .map(|d| d.udn().clone())
                .collect();
            let ids: Vec<_> = local
                .subscriptions
                .iter()
                .filter(|(_, s)| udns.contains(&s.value.service().udn))
                .map(|(id, _)| id.clone())
                .collect();
            let subscriptions: Vec<Arc<GenaSubscription>> = ids
                .iter()
                .filter_map(|id| local.subscriptions.remove(id))
                .map(|item| item.value)
                .collect();
            (item.value, subscriptions)
        };

        for (_, service) in device.all_services() {
            service.clear_observer();
        }
        tracing::info!(%udn, subscriptions = subscriptions.len(), "Local device removed");
        for subscription in subscriptions {
            isolate("local subscription end", || {
                subscription.end(Some(CancelReason::DeviceWasRemoved), None);
            });
        }
        self.notify_listeners("local_device_removed", |l| {
            l.local_device_removed(self, &device)
        });
        true
    }

    pub fn remove_all_local_devices(&self) {
        let udns: Vec<Udn> = self.inner.local.read().devices.keys().cloned().collect();
        for udn in udns {
            self.remove_local_device(&udn);
        }
    }

    /// Tell listeners that discovery of `device` began. Returns false, and
    /// stays silent, when the device is already known.
    pub fn notify_discovery_start(&self, device: &RemoteDevice) -> bool {
        if self.get_device(device.udn(), true).is_some() {
            tracing::trace!(udn = %device.udn(), "Not notifying discovery of a known device");
            return false;
        }
        self.notify_listeners("remote_device_discovery_started", |l| {
            l.remote_device_discovery_started(self, device)
        });
        true
    }

    pub fn notify_discovery_failure(&self, device: &RemoteDevice, error: &str) {
        tracing::debug!(udn = %device.udn(), error, "Remote device discovery failed");
        self.notify_listeners("remote_device_discovery_failed", |l| {
            l.remote_device_discovery_failed(self, device, error)
        });
    }

    /// Look a device up among local devices first, then remote ones.
    /// With `root_only` embedded devices are not searched.
    pub fn get_device(&self, udn: &Udn, root_only: bool) -> Option<DeviceRef> {
        if let Some(device) = self.get_local_device(udn, root_only) {
            return Some(DeviceRef::Local(device));
        }
        self.get_remote_device(udn, root_only).map(DeviceRef::Remote)
    }

    pub fn get_local_device(&self, udn: &Udn, root_only: bool) -> Option<LocalDevice> {
        let local = self.inner.local.read();
        if root_only {
            return local.devices.get(udn).map(|item| item.value.clone());
        }
        local
            .devices
            .values()
            .find_map(|item| item.value.find_device(udn).cloned())
    }

    pub fn get_remote_device(&self, udn: &Udn, root_only: bool) -> Option<RemoteDevice> {
        let remote = self.inner.remote.read();
        if root_only {
            return remote.devices.get(udn).map(|item| item.value.clone());
        }
        remote
            .devices
            .values()
            .find_map(|item| item.value.find_device(udn).cloned())
    }

    /// Every root device, local ones first.
    pub fn get_devices(&self) -> Vec<DeviceRef> {
        let mut devices: Vec<DeviceRef> = self
            .inner
            .local
            .read()
            .devices
            .values()
            .map(|item| DeviceRef::Local(item.value.clone()))
            .collect();
        devices.extend(
            self.inner
                .remote
                .read()
                .devices
                .values()
                .map(|item| DeviceRef::Remote(item.value.clone())),
        );
        devices
    }

    pub fn get_local_devices(&self) -> Vec<LocalDevice> {
        self.inner
            .local
            .read()
            .devices
            .values()
            .map(|item| item.value.clone())
            .collect()
    }

    pub fn get_remote_devices(&self) -> Vec<RemoteDevice> {
        self.inner
            .remote
            .read()
            .devices
            .values()
            .map(|item| item.value.clone())
            .collect()
    }

    /// Root or embedded devices of `device_type`.
    pub fn get_devices_by_type(&self, device_type: &str) -> Vec<DeviceRef> {
        self.collect_devices(
            |d| d.device_type() == device_type,
            |d| d.device_type() == device_type,
        )
    }

    /// Root or embedded devices offering a service of `service_type`.
    pub fn get_devices_by_service_type(&self, service_type: &str) -> Vec<DeviceRef> {
        self.collect_devices(
            |d| d.services().iter().any(|s| s.service_type() == service_type),
            |d| d.services().iter().any(|s| s.service_type() == service_type),
        )
    }

    fn collect_devices(
        &self,
        local_matches: impl Fn(&LocalDevice) -> bool,
        remote_matches: impl Fn(&RemoteDevice) -> bool,
    ) -> Vec<DeviceRef> {
        let mut found: Vec<DeviceRef> = Vec::new();
        for item in self.inner.local.read().devices.values() {
            found.extend(
                item.value
                    .all_devices()
                    .into_iter()
                    .filter(|d| local_matches(d))
                    .map(|d| DeviceRef::Local(d.clone())),
            );
        }
        for item in self.inner.remote.read().devices.values() {
            found.extend(
                item.value
                    .all_devices()
                    .into_iter()
                    .filter(|d| remote_matches(d))
                    .map(|d| DeviceRef::Remote(d.clone())),
            );
        }
        found
    }

    /// Resolve a service reference, local devices first.
    pub fn get_service(&self, service: &ServiceReference) -> Option<ServiceRef> {
        if let Some(local) = self.get_local_service(service) {
            return Some(ServiceRef::Local(local));
        }
        self.get_remote_service(service).map(ServiceRef::Remote)
    }

    pub fn get_local_service(&self, service: &ServiceReference) -> Option<Arc<LocalService>> {
        self.inner
            .local
            .read()
            .devices
            .values()
            .find_map(|item| item.value.find_service(&service.udn, &service.service_id).cloned())
    }

    pub fn get_remote_service(&self, service: &ServiceReference) -> Option<RemoteService> {
        self.inner
            .remote
            .read()
            .devices
            .values()
            .find_map(|item| item.value.find_service(&service.udn, &service.service_id).cloned())
    }

    fn is_owned_locally(&self, device: &RemoteDevice) -> bool {
        let local = self.inner.local.read();
        device
            .all_devices()
            .iter()
            .any(|d| local.devices.values().any(|item| item.value.contains(d.udn())))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_registry;
    use super::super::{ChannelListener, RegistryEvent};
    use super::*;
    use crate::expiration::ManualClock;
    use crate::model::{Device, StateVariable};
    use url::Url;

    fn remote(udn: &str, host: &str, max_age: u32) -> RemoteDevice {
        let base = format!("http://{host}");
        Device::new(
            DeviceIdentity::new(udn, max_age)
                .with_descriptor_url(Url::parse(&format!("{base}/desc.xml")).unwrap()),
            "urn:schemas-upnp-org:device:BinaryLight:1",
        )
        .with_service(RemoteService::new(
            "urn:upnp-org:serviceId:SwitchPower",
            "urn:schemas-upnp-org:service:SwitchPower:1",
            Url::parse(&format!("{base}/event")).unwrap(),
            Url::parse(&format!("{base}/control")).unwrap(),
        ))
    }

    fn local(udn: &str) -> LocalDevice {
        Device::new(
            DeviceIdentity::new(udn, 1800),
            "urn:schemas-upnp-org:device:BinaryLight:1",
        )
        .with_service(Arc::new(
            LocalService::new(
                "urn:upnp-org:serviceId:SwitchPower",
                "urn:schemas-upnp-org:service:SwitchPower:1",
            )
            .with_variable(StateVariable::evented("Status"), "0"),
        ))
    }

    #[tokio::test]
    async fn test_add_then_update_notifies_listeners() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        let (listener, mut events) = ChannelListener::new();
        registry.add_listener(Arc::new(listener));

        registry.add_remote_device(remote("uuid:r1", "10.0.0.5:1400", 60)).unwrap();
        registry.add_remote_device(remote("uuid:r1", "10.0.0.5:1400", 60)).unwrap();

        assert_eq!(events.try_recv().unwrap(), RegistryEvent::RemoteDeviceAdded(Udn::new("uuid:r1")));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::RemoteDeviceUpdated(Udn::new("uuid:r1")));
        assert_eq!(registry.get_remote_devices().len(), 1);
    }

    #[tokio::test]
    async fn test_host_change_re_adds_device() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        let (listener, mut events) = ChannelListener::new();
        registry.add_listener(Arc::new(listener));

        registry.add_remote_device(remote("uuid:r1", "10.0.0.5:1400", 60)).unwrap();
        registry.add_remote_device(remote("uuid:r1", "10.0.0.6:1400", 60)).unwrap();

        let received: Vec<RegistryEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![
                RegistryEvent::RemoteDeviceAdded(Udn::new("uuid:r1")),
                RegistryEvent::RemoteDeviceRemoved(Udn::new("uuid:r1")),
                RegistryEvent::RemoteDeviceAdded(Udn::new("uuid:r1")),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_from_new_host_removes_device() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        registry.add_remote_device(remote("uuid:r1", "10.0.0.5:1400", 60)).unwrap();

        let same = DeviceIdentity::new("uuid:r1", 60)
            .with_descriptor_url(Url::parse("http://10.0.0.5:1400/desc.xml").unwrap());
        assert!(registry.update_remote_device(&same));

        let moved = DeviceIdentity::new("uuid:r1", 60)
            .with_descriptor_url(Url::parse("http://10.0.0.7:1400/desc.xml").unwrap());
        assert!(!registry.update_remote_device(&moved));
        assert!(registry.get_remote_device(&Udn::new("uuid:r1"), true).is_none());
    }

    #[tokio::test]
    async fn test_local_udn_is_never_registered_as_remote() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        registry.add_local_device(local("uuid:mine")).unwrap();

        let result = registry.add_remote_device(remote("uuid:mine", "10.0.0.5:1400", 60));
        assert!(matches!(result, Err(RegistryError::UdnOwnedLocally(_))));
        assert!(registry.get_device(&Udn::new("uuid:mine"), true).unwrap().is_local());
    }

    #[tokio::test]
    async fn test_queries_by_type() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        registry.add_local_device(local("uuid:mine")).unwrap();
        registry.add_remote_device(remote("uuid:r1", "10.0.0.5:1400", 60)).unwrap();

        assert_eq!(
            registry
                .get_devices_by_type("urn:schemas-upnp-org:device:BinaryLight:1")
                .len(),
            2
        );
        assert_eq!(
            registry
                .get_devices_by_service_type("urn:schemas-upnp-org:service:SwitchPower:1")
                .len(),
            2
        );
        assert!(registry.get_devices_by_type("urn:other").is_empty());
        assert!(registry
            .get_local_service(&ServiceReference::new(
                "uuid:mine",
                "urn:upnp-org:serviceId:SwitchPower"
            ))
            .is_some());
        assert!(registry
            .get_remote_service(&ServiceReference::new(
                "uuid:r1",
                "urn:upnp-org:serviceId:SwitchPower"
            ))
            .is_some());
        let found = registry
            .get_service(&ServiceReference::new(
                "uuid:r1",
                "urn:upnp-org:serviceId:SwitchPower",
            ))
            .unwrap();
        assert!(!found.is_local());
        assert!(registry
            .get_service(&ServiceReference::new("uuid:r1", "urn:upnp-org:serviceId:Missing"))
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_local_device_clears_observers() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        let device = local("uuid:mine");
        let service = device.services()[0].clone();

        registry.add_local_device(device).unwrap();
        assert!(service.has_observer());

        assert!(registry.remove_local_device(&Udn::new("uuid:mine")));
        assert!(!service.has_observer());
        assert!(!registry.remove_local_device(&Udn::new("uuid:mine")));
    }

    #[tokio::test]
    async fn test_discovery_start_is_silent_for_known_devices() {
        let registry = test_registry(Arc::new(ManualClock::at_seconds(0)));
        let (listener, mut events) = ChannelListener::new();
        registry.add_listener(Arc::new(listener));
        let device = remote("uuid:r1", "10.0.0.5:1400", 60);

        assert!(registry.notify_discovery_start(&device));
        registry.add_remote_device(device.clone()).unwrap();
        assert!(!registry.notify_discovery_start(&device));
        registry.notify_discovery_failure(&device, "descriptor fetch failed");

        let received: Vec<RegistryEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(
            &received[2],
            RegistryEvent::RemoteDeviceDiscoveryFailed { error, .. } if error == "descriptor fetch failed"
        ));
    }
}
