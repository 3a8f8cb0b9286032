//! Bridge from the callback server to the Registry.
//!
//! The callback server only knows GENA headers. This module feeds every
//! [`NotificationPayload`] it forwards into [`Registry::handle_event`], which
//! resolves the subscription and applies sequence checking.

use callback_server::NotificationPayload;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::IncomingEvent;
use crate::registry::Registry;

impl From<NotificationPayload> for IncomingEvent {
    fn from(payload: NotificationPayload) -> Self {
        Self {
            sid: Some(payload.subscription_id),
            nt: payload.nt,
            nts: payload.nts,
            seq: payload.sequence,
            body: payload.event_xml,
        }
    }
}

/// Background task handing callback notifications to a [`Registry`].
///
/// Payloads are processed one at a time in arrival order, which keeps the
/// events of each subscription ordered. The task ends when the notification
/// channel closes, which happens when the callback server shuts down.
pub struct EventReceiver {
    task: JoinHandle<()>,
}

impl EventReceiver {
    /// Spawn the receiving task on the current runtime.
    pub fn spawn(
        registry: Registry,
        mut notification_rx: mpsc::UnboundedReceiver<NotificationPayload>,
    ) -> Self {
        let task = tokio::spawn(async move {
            while let Some(notification) = notification_rx.recv().await {
                let subscription_id = notification.subscription_id.clone();
                let response = registry.handle_event(notification.into()).await;
                if !response.is_success() {
                    tracing::debug!(
                        %subscription_id,
                        status = response.status,
                        "Callback notification not accepted"
                    );
                }
            }
            tracing::debug!("Notification channel closed, event receiver stopping");
        });

        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop receiving without waiting for the channel to close.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
