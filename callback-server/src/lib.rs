//! Generic UPnP callback server for receiving GENA event notifications.
//!
//! This crate provides a lightweight HTTP server for handling UPnP NOTIFY requests.
//! It knows the GENA headers but nothing about devices or services.
//!
//! # Overview
//!
//! - [`CallbackServer`]: HTTP server that binds to a local port and receives
//!   NOTIFY requests.
//! - [`EventRouter`]: Decides which subscription IDs are forwarded and sends
//!   them to a channel.
//! - [`NotificationPayload`]: The SID, SEQ, NT and NTS headers plus the raw
//!   XML body of one event.
//!
//! # Example: Registered subscriptions
//!
//! ```no_run
//! use callback_server::{CallbackServer, NotificationPayload};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
//!
//!     let server = CallbackServer::new((3400, 3500), tx).await?;
//!     println!("Callback server listening at: {}", server.base_url());
//!
//!     server.router().register("uuid:subscription-123".to_string()).await;
//!
//!     tokio::spawn(async move {
//!         while let Some(notification) = rx.recv().await {
//!             println!(
//!                 "Event {:?} for subscription {}",
//!                 notification.sequence, notification.subscription_id
//!             );
//!         }
//!     });
//!
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Consumer-tracked subscriptions
//!
//! A consumer that keeps its own subscription table, such as a GENA
//! registry, starts the server with [`CallbackServer::accepting_all`] and
//! judges each payload itself.
//!
//! ```no_run
//! use callback_server::{CallbackServer, NotificationPayload};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, _rx) = mpsc::unbounded_channel::<NotificationPayload>();
//!     let server = CallbackServer::accepting_all((3400, 3500), tx).await?;
//!     println!("Hand this to publishers: {}", server.callback_url()?);
//!     Ok(())
//! }
//! ```

mod error;
pub mod router;
mod server;

pub use error::ServerError;
pub use router::{EventRouter, NotificationPayload};
pub use server::{CallbackServer, NOTIFY_PATH};
