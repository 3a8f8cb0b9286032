//! # upnp-registry
//!
//! Device registry and GENA subscription engine for a UPnP control point
//! that also hosts devices of its own.
//!
//! # Features
//!
//! - **Registry**: local and remote devices, local and remote subscriptions
//!   and arbitrary expiring resources, each with its own deadline
//! - **Maintainer**: background sweep expiring entries and renewing remote
//!   subscriptions before they lapse
//! - **GENA subscriptions**: one state machine for in-process, inbound and
//!   outbound subscriptions, with sequence tracking and missed-event detection
//! - **Protocol handlers**: SUBSCRIBE/UNSUBSCRIBE for local services and
//!   NOTIFY for remote subscriptions, independent of the HTTP server
//!
//! # Architecture
//!
//! ```text
//! SubscriptionCallback ──▶ Registry ◀── Maintainer (interval)
//!                             ▲  │
//!  callback-server ──▶ EventReceiver  └──▶ GenaClient (SUBSCRIBE/NOTIFY)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use callback_server::CallbackServer;
//! use upnp_registry::{EventReceiver, Registry, SubscriptionCallback, SubscriptionTarget};
//!
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let server = CallbackServer::accepting_all((3400, 3500), tx).await?;
//!
//! let registry = Registry::builder()
//!     .with_callback_url(server.callback_url()?)
//!     .build()?;
//! let _receiver = EventReceiver::spawn(registry.clone(), rx);
//!
//! let target = SubscriptionTarget::known_remote(&registry, service_ref).unwrap();
//! let callback = SubscriptionCallback::new(registry.clone(), target, Arc::new(MyHandler));
//! let subscription = callback.establish().await?;
//!
//! // ...
//! callback.end().await;
//! registry.shutdown().await?;
//! ```

pub mod config;
pub mod control_point;
pub mod error;
pub mod expiration;
pub mod gena;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod sequence;
pub mod transport;

pub use config::RegistryConfig;
pub use control_point::{SubscriptionCallback, SubscriptionTarget};
pub use error::{CodecError, GenaError, RegistryError, Result, TransportError};
pub use expiration::{Clock, ExpirationDetails, ManualClock, SystemClock};
pub use gena::{
    CancelReason, GenaEvent, GenaResponse, GenaSubscription, SubscriptionFailure,
    SubscriptionHandler, SubscriptionId, SubscriptionPhase,
};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use model::{
    DeviceIdentity, DeviceRef, LocalDevice, LocalService, RemoteDevice, RemoteService, ServiceId,
    ServiceRef, ServiceReference, Udn,
};
pub use protocol::{
    EventReceiver, IncomingEvent, IncomingSubscribe, IncomingUnsubscribe, SubscribeConfirmation,
    SubscribeOutcome,
};
pub use registry::{
    ChannelListener, Registry, RegistryBuilder, RegistryEvent, RegistryListener, RegistryStats,
    Resource,
};
pub use sequence::EventSequence;
pub use transport::{GenaClient, HttpGenaClient, TaskExecutor};
