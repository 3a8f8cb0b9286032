//! Registry listeners.
//!
//! Listeners are called synchronously after the Registry released its
//! locks, so a listener may call back into the Registry.

use tokio::sync::mpsc;

use super::Registry;
use crate::model::{LocalDevice, RemoteDevice, Udn};

/// Device lifecycle notifications. Every method defaults to a no-op.
pub trait RegistryListener: Send + Sync {
    fn remote_device_discovery_started(&self, _registry: &Registry, _device: &RemoteDevice) {}

    fn remote_device_discovery_failed(
        &self,
        _registry: &Registry,
        _device: &RemoteDevice,
        _error: &str,
    ) {
    }

    fn remote_device_added(&self, _registry: &Registry, _device: &RemoteDevice) {}

    fn remote_device_updated(&self, _registry: &Registry, _device: &RemoteDevice) {}

    fn remote_device_removed(&self, _registry: &Registry, _device: &RemoteDevice) {}

    fn local_device_added(&self, _registry: &Registry, _device: &LocalDevice) {}

    fn local_device_removed(&self, _registry: &Registry, _device: &LocalDevice) {}

    fn before_shutdown(&self, _registry: &Registry) {}

    fn after_shutdown(&self) {}
}

/// Notification emitted by a [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    RemoteDeviceDiscoveryStarted(Udn),
    RemoteDeviceDiscoveryFailed { udn: Udn, error: String },
    RemoteDeviceAdded(Udn),
    RemoteDeviceUpdated(Udn),
    RemoteDeviceRemoved(Udn),
    LocalDeviceAdded(Udn),
    LocalDeviceRemoved(Udn),
    BeforeShutdown,
    AfterShutdown,
}

/// Forwards registry notifications to a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<RegistryEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn emit(&self, event: RegistryEvent) {
        // The receiver may be gone; the registry does not care.
        let _ = self.sender.send(event);
    }
}

impl RegistryListener for ChannelListener {
    fn remote_device_discovery_started(&self, _registry: &Registry, device: &RemoteDevice) {
        self.emit(RegistryEvent::RemoteDeviceDiscoveryStarted(device.udn().clone()));
    }

    fn remote_device_discovery_failed(
        &self,
        _registry: &Registry,
        device: &RemoteDevice,
        error: &str,
    ) {
        self.emit(RegistryEvent::RemoteDeviceDiscoveryFailed {
            udn: device.udn().clone(),
            error: error.to_string(),
        });
    }

    fn remote_device_added(&self, _registry: &Registry, device: &RemoteDevice) {
        self.emit(RegistryEvent::RemoteDeviceAdded(device.udn().clone()));
    }

    fn remote_device_updated(&self, _registry: &Registry, device: &RemoteDevice) {
        self.emit(RegistryEvent::RemoteDeviceUpdated(device.udn().clone()));
    }

    fn remote_device_removed(&self, _registry: &Registry, device: &RemoteDevice) {
        self.emit(RegistryEvent::RemoteDeviceRemoved(device.udn().clone()));
    }

    fn local_device_added(&self, _registry: &Registry, device: &LocalDevice) {
        self.emit(RegistryEvent::LocalDeviceAdded(device.udn().clone()));
    }

    fn local_device_removed(&self, _registry: &Registry, device: &LocalDevice) {
        self.emit(RegistryEvent::LocalDeviceRemoved(device.udn().clone()));
    }

    fn before_shutdown(&self, _registry: &Registry) {
        self.emit(RegistryEvent::BeforeShutdown);
    }

    fn after_shutdown(&self) {
        self.emit(RegistryEvent::AfterShutdown);
    }
}
