//! Transport seams: the GENA client and the task executor.

mod executor;
mod http;

pub use executor::{TaskExecutor, TaskHandle};
pub use http::HttpGenaClient;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::gena::{GenaResponse, NotifyRequest, RenewRequest, SubscribeRequest, UnsubscribeRequest};

/// Sends GENA requests.
///
/// `Ok` carries any HTTP response, success or not. `Err` means no response
/// arrived at all.
#[async_trait]
pub trait GenaClient: Send + Sync {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<GenaResponse, TransportError>;

    async fn renew(&self, request: &RenewRequest) -> Result<GenaResponse, TransportError>;

    async fn unsubscribe(
        &self,
        request: &UnsubscribeRequest,
    ) -> Result<GenaResponse, TransportError>;

    async fn notify(&self, request: &NotifyRequest) -> Result<GenaResponse, TransportError>;
}
