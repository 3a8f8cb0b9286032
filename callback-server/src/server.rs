//! HTTP server for receiving UPnP event notifications.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::Filter;

use super::error::ServerError;
use super::router::{EventRouter, NotificationPayload};

/// Path of the NOTIFY endpoint under the base URL.
pub const NOTIFY_PATH: &str = "notify";

/// HTTP callback server for receiving UPnP event notifications.
///
/// The `CallbackServer` binds to a local port and provides an HTTP endpoint
/// for receiving UPnP NOTIFY requests. It validates the GENA headers and
/// routes events through an `EventRouter` to a channel.
///
/// Status codes follow GENA: 412 for a missing SID or SEQ or an unroutable
/// subscription, 400 for a missing or wrong NT or NTS, 200 once the event
/// was handed to the channel.
///
/// # Example
///
/// ```no_run
/// use tokio::sync::mpsc;
/// use callback_server::{CallbackServer, NotificationPayload};
///
/// #[tokio::main]
/// async fn main() {
///     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
///
///     let server = CallbackServer::new((3400, 3500), tx)
///         .await
///         .expect("Failed to create callback server");
///
///     println!("Server listening at: {}", server.base_url());
///
///     // Process notifications
///     while let Some(notification) = rx.recv().await {
///         println!("Received event for subscription: {}", notification.subscription_id);
///     }
/// }
/// ```
pub struct CallbackServer {
    /// The port the server is bound to
    port: u16,
    /// The base URL for callback registration
    base_url: String,
    /// Event router for handling incoming events
    event_router: Arc<EventRouter>,
    /// Shutdown signal sender
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Create and start a callback server routing only registered
    /// subscription IDs.
    ///
    /// The server:
    /// - Finds an available port in the specified range
    /// - Detects the local IP address for callback URLs
    /// - Starts an HTTP server to receive UPnP NOTIFY requests
    ///
    /// # Errors
    ///
    /// Returns an error if no port in `port_range` could be bound or the
    /// server task did not come up.
    pub async fn new(
        port_range: (u16, u16),
        event_sender: mpsc::UnboundedSender<NotificationPayload>,
    ) -> Result<Self, ServerError> {
        Self::with_router(port_range, EventRouter::new(event_sender)).await
    }

    /// Create and start a callback server forwarding every event, for
    /// consumers that track subscriptions themselves.
    pub async fn accepting_all(
        port_range: (u16, u16),
        event_sender: mpsc::UnboundedSender<NotificationPayload>,
    ) -> Result<Self, ServerError> {
        Self::with_router(port_range, EventRouter::accepting_all(event_sender)).await
    }

    /// Create and start a callback server with a prepared router.
    pub async fn with_router(
        port_range: (u16, u16),
        router: EventRouter,
    ) -> Result<Self, ServerError> {
        let port = Self::find_available_port(port_range.0, port_range.1).ok_or(
            ServerError::NoAvailablePort {
                start: port_range.0,
                end: port_range.1,
            },
        )?;

        let local_ip = Self::detect_local_ip().unwrap_or_else(|| {
            tracing::warn!("Could not detect the local IP address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        let base_url = format!("http://{local_ip}:{port}");

        let event_router = Arc::new(router);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);

        let server_handle = Self::start_server(port, event_router.clone(), shutdown_rx, ready_tx);

        ready_rx.recv().await.ok_or(ServerError::StartupFailed)?;

        Ok(Self {
            port,
            base_url,
            event_router,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// The base URL, `http://<local_ip>:<port>`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The URL to hand to publishers in the CALLBACK header.
    pub fn callback_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse(&format!("{}/{NOTIFY_PATH}", self.base_url))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the event router, e.g. to register subscriptions.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Shutdown the callback server gracefully, letting in-flight requests
    /// complete.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use tokio::sync::mpsc;
    /// # use callback_server::{CallbackServer, NotificationPayload};
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let (tx, _rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// # let server = CallbackServer::new((3400, 3500), tx).await.unwrap();
    /// server.shutdown().await.unwrap();
    /// # }
    /// ```
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| ServerError::ShutdownFailed(e.to_string()))?;
        }
        tracing::debug!(port = self.port, "Callback server stopped");

        Ok(())
    }

    /// Find an available port in the given range.
    fn find_available_port(start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|&port| Self::is_port_available(port))
    }

    /// Check if a port is available for binding.
    fn is_port_available(port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port,
        ))
        .is_ok()
    }

    /// Detect the local IP address for callback URLs.
    ///
    /// This uses a UDP socket connection to determine the local IP address
    /// that would be used for outbound connections. No data is actually sent.
    fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    /// Start the HTTP server on the given port.
    fn start_server(
        port: u16,
        event_router: Arc<EventRouter>,
        mut shutdown_rx: mpsc::Receiver<()>,
        ready_tx: mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // NOTIFY on any path; publishers append their own suffixes
            let notify_route = warp::method()
                .and(warp::path::full())
                .and(warp::header::optional::<String>("sid"))
                .and(warp::header::optional::<String>("nt"))
                .and(warp::header::optional::<String>("nts"))
                .and(warp::header::optional::<String>("seq"))
                .and(warp::body::bytes())
                .and_then({
                    let router = event_router.clone();
                    move |method: warp::http::Method,
                          path: warp::path::FullPath,
                          sid: Option<String>,
                          nt: Option<String>,
                          nts: Option<String>,
                          seq: Option<String>,
                          body: bytes::Bytes| {
                        let router = router.clone();
                        async move {
                            if method.as_str() != "NOTIFY" {
                                return Err(warp::reject::not_found());
                            }

                            tracing::trace!(
                                path = path.as_str(),
                                sid = ?sid,
                                seq = ?seq,
                                bytes = body.len(),
                                "Incoming NOTIFY"
                            );

                            let payload = Self::validate_upnp_headers(sid, nt, nts, seq)
                                .map_err(warp::reject::custom)?;
                            let payload = NotificationPayload {
                                event_xml: String::from_utf8_lossy(&body).to_string(),
                                ..payload
                            };
                            let subscription_id = payload.subscription_id.clone();

                            if router.route_event(payload).await {
                                Ok::<_, warp::Rejection>(warp::reply::with_status(
                                    "",
                                    warp::http::StatusCode::OK,
                                ))
                            } else {
                                tracing::debug!(%subscription_id, "Event not routed");
                                Err(warp::reject::custom(InvalidUpnpHeaders::UnknownSubscription))
                            }
                        }
                    }
                });

            let routes = notify_route.recover(handle_rejection);

            let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port),
                async move {
                    shutdown_rx.recv().await;
                },
            );

            tracing::info!(%addr, "Callback server listening");
            let _ = ready_tx.send(()).await;
            server.await;
        })
    }

    /// Validate the GENA headers of a NOTIFY and build its payload, body
    /// still empty.
    fn validate_upnp_headers(
        sid: Option<String>,
        nt: Option<String>,
        nts: Option<String>,
        seq: Option<String>,
    ) -> Result<NotificationPayload, InvalidUpnpHeaders> {
        let subscription_id = sid.ok_or(InvalidUpnpHeaders::MissingSid)?;

        if nt.as_deref() != Some("upnp:event") || nts.as_deref() != Some("upnp:propchange") {
            return Err(InvalidUpnpHeaders::BadNotificationType);
        }

        match seq.as_deref().map(|s| s.trim().parse::<u32>()) {
            Some(Ok(_)) => {}
            _ => return Err(InvalidUpnpHeaders::MissingSequence),
        }

        Ok(NotificationPayload {
            subscription_id,
            sequence: seq,
            nt,
            nts,
            event_xml: String::new(),
        })
    }
}

/// Custom rejections for malformed NOTIFY requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvalidUpnpHeaders {
    MissingSid,
    BadNotificationType,
    MissingSequence,
    UnknownSubscription,
}

impl warp::reject::Reject for InvalidUpnpHeaders {}

/// Handle rejections and convert them to HTTP responses.
async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = match err.find::<InvalidUpnpHeaders>() {
        Some(InvalidUpnpHeaders::MissingSid) => (
            warp::http::StatusCode::PRECONDITION_FAILED,
            "Missing SID header",
        ),
        Some(InvalidUpnpHeaders::BadNotificationType) => (
            warp::http::StatusCode::BAD_REQUEST,
            "Missing or invalid NT/NTS headers",
        ),
        Some(InvalidUpnpHeaders::MissingSequence) => (
            warp::http::StatusCode::PRECONDITION_FAILED,
            "Missing or invalid SEQ header",
        ),
        Some(InvalidUpnpHeaders::UnknownSubscription) => (
            warp::http::StatusCode::PRECONDITION_FAILED,
            "Subscription not found",
        ),
        None if err.is_not_found() => (warp::http::StatusCode::NOT_FOUND, "Not found"),
        None => (
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        ),
    };

    Ok(warp::reply::with_status(message, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn test_is_port_available() {
        // Port 0 should always be available (OS assigns a free port)
        assert!(CallbackServer::is_port_available(0));

        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!CallbackServer::is_port_available(port));
        drop(listener);
    }

    #[test]
    fn test_find_available_port() {
        let port = CallbackServer::find_available_port(50000, 50100);
        assert!(port.is_some());
        assert!(port.unwrap() >= 50000 && port.unwrap() <= 50100);
    }

    #[test]
    fn test_validate_upnp_headers() {
        let payload = CallbackServer::validate_upnp_headers(
            some("uuid:123"),
            some("upnp:event"),
            some("upnp:propchange"),
            some("7"),
        )
        .unwrap();
        assert_eq!(payload.subscription_id, "uuid:123");
        assert_eq!(payload.sequence.as_deref(), Some("7"));

        assert_eq!(
            CallbackServer::validate_upnp_headers(
                None,
                some("upnp:event"),
                some("upnp:propchange"),
                some("0")
            ),
            Err(InvalidUpnpHeaders::MissingSid)
        );

        assert_eq!(
            CallbackServer::validate_upnp_headers(some("uuid:123"), None, None, some("0")),
            Err(InvalidUpnpHeaders::BadNotificationType)
        );

        assert_eq!(
            CallbackServer::validate_upnp_headers(
                some("uuid:123"),
                some("upnp:event"),
                some("wrong"),
                some("0")
            ),
            Err(InvalidUpnpHeaders::BadNotificationType)
        );

        assert_eq!(
            CallbackServer::validate_upnp_headers(
                some("uuid:123"),
                some("upnp:event"),
                some("upnp:propchange"),
                some("minus-one")
            ),
            Err(InvalidUpnpHeaders::MissingSequence)
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_any_u32_sequence_is_accepted(seq in proptest::prelude::any::<u32>()) {
            let payload = CallbackServer::validate_upnp_headers(
                some("uuid:123"),
                some("upnp:event"),
                some("upnp:propchange"),
                Some(seq.to_string()),
            );
            proptest::prop_assert!(payload.is_ok());
        }
    }

    #[tokio::test]
    async fn test_callback_server_creation() {
        let (tx, _rx) = mpsc::unbounded_channel();

        let server = CallbackServer::new((50000, 50100), tx).await.unwrap();
        assert!(server.port() >= 50000 && server.port() <= 50100);
        assert!(server.base_url().contains(&server.port().to_string()));
        assert!(server
            .callback_url()
            .unwrap()
            .as_str()
            .ends_with("/notify"));

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_accepting_all_server_uses_accepting_router() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = CallbackServer::accepting_all((50000, 50100), tx).await.unwrap();

        assert!(server.router().accepts_all());
        server.shutdown().await.unwrap();
    }
}
