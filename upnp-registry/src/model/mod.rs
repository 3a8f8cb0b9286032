//! Device and service model consumed by the Registry.
//!
//! Descriptor parsing lives outside this crate. What the Registry needs is a
//! device graph with stable identities, the event-subscription endpoints of
//! remote services, and evented state for local services.

mod device;
mod service;

pub use device::{Device, DeviceIdentity, DeviceRef, LocalDevice, RemoteDevice, ServiceRef};
pub use service::{
    EventDetails, LocalService, RemoteService, ServiceMeta, StateChangeObserver, StateValues,
    StateVariable,
};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique Device Name, e.g. `uuid:2fac1234-31f8-11b4-a222-08002b34c003`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Udn(String);

impl Udn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Udn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Udn {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Service id, e.g. `urn:upnp-org:serviceId:SwitchPower`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Address of one service: the UDN of the device that hosts it plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceReference {
    pub udn: Udn,
    pub service_id: ServiceId,
}

impl ServiceReference {
    pub fn new(udn: impl Into<Udn>, service_id: impl Into<ServiceId>) -> Self {
        Self {
            udn: udn.into(),
            service_id: service_id.into(),
        }
    }
}

impl fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.udn, self.service_id)
    }
}
