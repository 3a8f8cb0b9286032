//! Error types for the upnp-registry crate.

use crate::model::{ServiceId, Udn};

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Resource ids are paths relative to the local HTTP namespace
    #[error("Resource id must be a relative path: {0}")]
    ResourceNotRelative(String),

    /// The UDN belongs to a device graph registered as local
    #[error("Device {0} is registered as a local device")]
    UdnOwnedLocally(Udn),

    /// The UDN belongs to a device graph registered as remote
    #[error("Device {0} is registered as a remote device")]
    UdnOwnedRemotely(Udn),

    /// Only subscriptions with an id can be tracked
    #[error("Subscription has no id yet")]
    MissingSubscriptionId,

    /// The registry no longer accepts work
    #[error("Registry has been shut down")]
    ShutDown,

    /// Construction happened outside a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The HTTP transport could not be created
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The maintenance task did not stop cleanly
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Errors from the GENA protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenaError {
    /// A local subscription was requested for a device that is not registered
    #[error("Local device {0} is not registered")]
    DeviceNotRegistered(Udn),

    /// The referenced service does not exist on the device
    #[error("Service {service} not found on device {udn}")]
    ServiceNotFound {
        /// The device UDN
        udn: Udn,
        /// The missing service id
        service: ServiceId,
    },

    /// SID header did not carry the `uuid:` prefix
    #[error("Invalid SID header: {0}")]
    InvalidSubscriptionId(String),

    /// TIMEOUT header was not of the form `Second-<n>`
    #[error("Invalid TIMEOUT header: {0}")]
    InvalidTimeout(String),

    /// CALLBACK header carried no usable URL
    #[error("Invalid CALLBACK header: {0}")]
    InvalidCallback(String),

    /// SEQ header was not an unsigned 32-bit integer
    #[error("Invalid SEQ header: {0}")]
    InvalidSequence(String),

    /// The registry refused to track the subscription
    #[error("Registry rejected subscription: {0}")]
    Registry(String),
}

/// Errors from a [`GenaClient`](crate::transport::GenaClient) where no HTTP
/// response was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request was sent but nothing came back
    #[error("No response received: {0}")]
    NoResponse(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// There is no local callback URL to hand to the publisher
    #[error("No callback URL available for event delivery")]
    NoCallbackUrl,
}

/// Errors decoding a NOTIFY property set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The body contained no XML
    #[error("Event body is empty")]
    EmptyBody,

    /// The root element was not a property set
    #[error("Unexpected root element '{0}', expected 'propertyset'")]
    UnexpectedRoot(String),

    /// The body is not well-formed XML
    #[error("Malformed event body: {reason}")]
    Malformed {
        /// Parser diagnostic
        reason: String,
        /// The offending body
        body: String,
    },
}

/// Convenience type alias for Results using RegistryError.
pub type Result<T> = std::result::Result<T, RegistryError>;
