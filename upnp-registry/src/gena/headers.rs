//! GENA header values: `SID`, `TIMEOUT`, `CALLBACK`, `NT`, `NTS`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::GenaError;

/// `NT` value of event subscriptions and notifications.
pub const NT_EVENT: &str = "upnp:event";

/// `NTS` value of property-change notifications.
pub const NTS_PROPCHANGE: &str = "upnp:propchange";

/// Header names as they appear on the wire.
pub mod names {
    pub const SID: &str = "SID";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CALLBACK: &str = "CALLBACK";
    pub const NT: &str = "NT";
    pub const NTS: &str = "NTS";
    pub const SEQ: &str = "SEQ";
    pub const CONTENT_TYPE: &str = "CONTENT-TYPE";
}

const SID_PREFIX: &str = "uuid:";

/// Subscription identifier carried in the `SID` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// A fresh `uuid:<v4>` identifier.
    pub fn generate() -> Self {
        Self(format!("{SID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SubscriptionId {
    type Err = GenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        match value.strip_prefix(SID_PREFIX) {
            Some(token) if !token.is_empty() => Ok(Self(value.to_string())),
            _ => Err(GenaError::InvalidSubscriptionId(s.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed `TIMEOUT` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTimeout {
    Seconds(u32),
    /// Only meaningful in-process; never put on the wire
    Infinite,
}

impl SubscriptionTimeout {
    /// `Second-<n>` for a finite duration.
    pub fn header_value(seconds: u32) -> String {
        format!("Second-{seconds}")
    }

    pub fn seconds(&self) -> Option<u32> {
        match self {
            SubscriptionTimeout::Seconds(s) => Some(*s),
            SubscriptionTimeout::Infinite => None,
        }
    }
}

impl FromStr for SubscriptionTimeout {
    type Err = GenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let invalid = || GenaError::InvalidTimeout(s.to_string());
        if value.len() < 7 || !value.is_char_boundary(7) {
            return Err(invalid());
        }
        let (prefix, amount) = value.split_at(7);
        if !prefix.eq_ignore_ascii_case("second-") {
            return Err(invalid());
        }
        if amount.eq_ignore_ascii_case("infinite") {
            return Ok(SubscriptionTimeout::Infinite);
        }
        amount
            .parse::<u32>()
            .map(SubscriptionTimeout::Seconds)
            .map_err(|_| invalid())
    }
}

/// URLs of a `CALLBACK` header, `<url1><url2>...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackUrls(Vec<Url>);

impl CallbackUrls {
    pub fn new(urls: Vec<Url>) -> Self {
        Self(urls)
    }

    pub fn urls(&self) -> &[Url] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Url> {
        self.0
    }

    /// Parse a header value, skipping bracketed entries that are not URLs.
    ///
    /// Fails when no usable URL remains.
    pub fn parse(header: &str) -> Result<Self, GenaError> {
        let mut urls = Vec::new();
        let mut rest = header.trim();
        while let Some(start) = rest.find('<') {
            let Some(len) = rest[start + 1..].find('>') else {
                break;
            };
            let candidate = rest[start + 1..start + 1 + len].trim();
            match Url::parse(candidate) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => urls.push(url),
                _ => tracing::debug!(candidate, "Skipping invalid callback URL"),
            }
            rest = &rest[start + 1 + len + 1..];
        }
        if urls.is_empty() {
            return Err(GenaError::InvalidCallback(header.to_string()));
        }
        Ok(Self(urls))
    }
}

impl fmt::Display for CallbackUrls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for url in &self.0 {
            write!(f, "<{url}>")?;
        }
        Ok(())
    }
}

impl From<Vec<Url>> for CallbackUrls {
    fn from(urls: Vec<Url>) -> Self {
        Self(urls)
    }
}
