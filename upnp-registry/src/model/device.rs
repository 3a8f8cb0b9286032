//! Device graphs.

use std::sync::Arc;

use url::Url;

use super::service::{LocalService, RemoteService, ServiceMeta};
use super::{ServiceId, Udn};

/// Identity of a device as announced by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udn: Udn,
    /// Advertised max-age in seconds; 0 never expires
    pub max_age_seconds: u32,
    /// Location of the device descriptor, absent for local devices
    pub descriptor_url: Option<Url>,
}

impl DeviceIdentity {
    pub fn new(udn: impl Into<Udn>, max_age_seconds: u32) -> Self {
        Self {
            udn: udn.into(),
            max_age_seconds,
            descriptor_url: None,
        }
    }

    pub fn with_descriptor_url(mut self, url: Url) -> Self {
        self.descriptor_url = Some(url);
        self
    }

    /// `host[:port]` of the descriptor URL.
    pub fn descriptor_host(&self) -> Option<String> {
        let url = self.descriptor_url.as_ref()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

/// A root or embedded device with services of type `S`.
#[derive(Debug, Clone)]
pub struct Device<S> {
    identity: DeviceIdentity,
    device_type: String,
    services: Vec<S>,
    embedded: Vec<Device<S>>,
}

/// A device hosted by this process.
pub type LocalDevice = Device<Arc<LocalService>>;

/// A device discovered on the network.
pub type RemoteDevice = Device<RemoteService>;

impl<S: ServiceMeta> Device<S> {
    pub fn new(identity: DeviceIdentity, device_type: impl Into<String>) -> Self {
        Self {
            identity,
            device_type: device_type.into(),
            services: Vec::new(),
            embedded: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: S) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_embedded(mut self, device: Device<S>) -> Self {
        self.embedded.push(device);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn udn(&self) -> &Udn {
        &self.identity.udn
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn services(&self) -> &[S] {
        &self.services
    }

    pub fn embedded_devices(&self) -> &[Device<S>] {
        &self.embedded
    }

    pub(crate) fn identity_mut(&mut self) -> &mut DeviceIdentity {
        &mut self.identity
    }

    /// This device and every embedded device, depth first.
    pub fn all_devices(&self) -> Vec<&Device<S>> {
        let mut devices = vec![self];
        for embedded in &self.embedded {
            devices.extend(embedded.all_devices());
        }
        devices
    }

    /// Find this device or an embedded one by UDN.
    pub fn find_device(&self, udn: &Udn) -> Option<&Device<S>> {
        if self.udn() == udn {
            return Some(self);
        }
        self.embedded.iter().find_map(|d| d.find_device(udn))
    }

    pub fn contains(&self, udn: &Udn) -> bool {
        self.find_device(udn).is_some()
    }

    /// Find a service on the device named by `udn` within this graph.
    pub fn find_service(&self, udn: &Udn, service_id: &ServiceId) -> Option<&S> {
        self.find_device(udn)?
            .services
            .iter()
            .find(|s| s.service_id() == service_id)
    }

    /// Every service of the graph paired with the UDN of its device.
    pub fn all_services(&self) -> Vec<(&Udn, &S)> {
        self.all_devices()
            .into_iter()
            .flat_map(|d| d.services.iter().map(move |s| (d.udn(), s)))
            .collect()
    }
}

/// A device returned by a lookup that searches both collections.
#[derive(Debug, Clone)]
pub enum DeviceRef {
    Local(LocalDevice),
    Remote(RemoteDevice),
}

impl DeviceRef {
    pub fn udn(&self) -> &Udn {
        match self {
            DeviceRef::Local(d) => d.udn(),
            DeviceRef::Remote(d) => d.udn(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, DeviceRef::Local(_))
    }
}

/// A service returned by [`Registry::get_service`](crate::Registry::get_service).
#[derive(Debug, Clone)]
pub enum ServiceRef {
    Local(Arc<LocalService>),
    Remote(RemoteService),
}

impl ServiceRef {
    pub fn service_id(&self) -> &ServiceId {
        match self {
            ServiceRef::Local(s) => s.service_id(),
            ServiceRef::Remote(s) => s.service_id(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ServiceRef::Local(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str) -> RemoteService {
        RemoteService::new(
            id,
            "urn:schemas-upnp-org:service:SwitchPower:1",
            Url::parse("http://192.168.1.20:1400/event").unwrap(),
            Url::parse("http://192.168.1.20:1400/control").unwrap(),
        )
    }

    fn graph() -> RemoteDevice {
        let child = Device::new(DeviceIdentity::new("uuid:child", 0), "urn:test:device:Child:1")
            .with_service(service("urn:upnp-org:serviceId:Dimming"));
        Device::new(DeviceIdentity::new("uuid:root", 1800), "urn:test:device:Root:1")
            .with_service(service("urn:upnp-org:serviceId:SwitchPower"))
            .with_embedded(child)
    }

    #[test]
    fn test_find_embedded_device() {
        let root = graph();
        assert!(root.find_device(&Udn::new("uuid:child")).is_some());
        assert!(root.find_device(&Udn::new("uuid:missing")).is_none());
        assert_eq!(root.all_devices().len(), 2);
    }

    #[test]
    fn test_find_service_on_embedded_device() {
        let root = graph();
        let dimming = ServiceId::new("urn:upnp-org:serviceId:Dimming");
        assert!(root.find_service(&Udn::new("uuid:child"), &dimming).is_some());
        assert!(root.find_service(&Udn::new("uuid:root"), &dimming).is_none());
        assert_eq!(root.all_services().len(), 2);
    }

    #[test]
    fn test_descriptor_host() {
        let identity = DeviceIdentity::new("uuid:root", 60)
            .with_descriptor_url(Url::parse("http://192.168.1.20:1400/xml/desc.xml").unwrap());
        assert_eq!(identity.descriptor_host().as_deref(), Some("192.168.1.20:1400"));
        assert_eq!(DeviceIdentity::new("uuid:local", 0).descriptor_host(), None);
    }
}
