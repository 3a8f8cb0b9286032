//! GENA requests and responses exchanged with a [`GenaClient`](crate::transport::GenaClient).

use std::collections::HashMap;
use std::fmt;

use url::Url;

use super::headers::{names, CallbackUrls, SubscriptionId, SubscriptionTimeout, NTS_PROPCHANGE, NT_EVENT};
use crate::sequence::EventSequence;

/// Status codes GENA handlers produce.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

/// An HTTP response to a GENA request.
///
/// Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenaResponse {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: String,
}

impl GenaResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(status::OK)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `SID` header, if present and well-formed.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.header(names::SID)?.parse().ok()
    }

    /// The `TIMEOUT` header, if present and well-formed.
    pub fn timeout(&self) -> Option<SubscriptionTimeout> {
        self.header(names::TIMEOUT)?.parse().ok()
    }
}

impl fmt::Display for GenaResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(HTTP {})", self.status)?;
        if !self.body.is_empty() {
            write!(f, " {}", self.body)?;
        }
        Ok(())
    }
}

/// Initial SUBSCRIBE to a remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub url: Url,
    pub callback_urls: CallbackUrls,
    pub duration_seconds: u32,
}

impl SubscribeRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (names::CALLBACK, self.callback_urls.to_string()),
            (names::NT, NT_EVENT.to_string()),
            (
                names::TIMEOUT,
                SubscriptionTimeout::header_value(self.duration_seconds),
            ),
        ]
    }
}

/// Renewal SUBSCRIBE for an existing subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewRequest {
    pub url: Url,
    pub subscription_id: SubscriptionId,
    pub duration_seconds: u32,
}

impl RenewRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (names::SID, self.subscription_id.to_string()),
            (
                names::TIMEOUT,
                SubscriptionTimeout::header_value(self.duration_seconds),
            ),
        ]
    }
}

/// UNSUBSCRIBE for an existing subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub url: Url,
    pub subscription_id: SubscriptionId,
}

impl UnsubscribeRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![(names::SID, self.subscription_id.to_string())]
    }
}

/// Event NOTIFY to one callback URL of a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRequest {
    pub url: Url,
    pub subscription_id: SubscriptionId,
    pub sequence: EventSequence,
    pub body: String,
}

impl NotifyRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (names::CONTENT_TYPE, r#"text/xml; charset="utf-8""#.to_string()),
            (names::NT, NT_EVENT.to_string()),
            (names::NTS, NTS_PROPCHANGE.to_string()),
            (names::SID, self.subscription_id.to_string()),
            (names::SEQ, self.sequence.to_string()),
        ]
    }
}
