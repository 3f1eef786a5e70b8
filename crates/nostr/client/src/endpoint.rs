//! Normalized relay URLs.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A relay URL in canonical form, used as the key of every per-relay map.
///
/// Normalization: surrounding whitespace trimmed, missing scheme defaults to
/// `wss://`, only `ws`/`wss` accepted, host lowercased, trailing slash removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayEndpoint(String);

impl RelayEndpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ClientError::InvalidUrl("empty relay URL".to_string()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("wss://{}", trimmed)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidUrl(format!("{}: missing host", trimmed)));
        }

        let mut normalized = url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_secure(&self) -> bool {
        self.0.starts_with("wss://")
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayEndpoint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayEndpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for RelayEndpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayEndpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a list of relay URLs, skipping (and logging) invalid entries.
pub fn parse_endpoints<I, S>(urls: I) -> Vec<RelayEndpoint>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut endpoints: Vec<RelayEndpoint> = Vec::new();
    for url in urls {
        match RelayEndpoint::parse(url.as_ref()) {
            Ok(endpoint) => {
                if !endpoints.contains(&endpoint) {
                    endpoints.push(endpoint);
                }
            }
            Err(e) => tracing::warn!("Ignoring relay {:?}: {}", url.as_ref(), e),
        }
    }
    endpoints
}
