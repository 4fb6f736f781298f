//! Quota key resolution.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{GatekeeperError, Result};

/// What identifies a request for quota purposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Remote address of the client
    pub client_addr: Option<IpAddr>,
    /// Authenticated user id, if any
    pub user_id: Option<String>,
    /// Caller-chosen key, e.g. an API key or tenant
    pub custom_key: Option<String>,
}

impl RequestIdentity {
    /// Identity of an anonymous client.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self {
            client_addr: Some(addr),
            ..Default::default()
        }
    }

    /// Attach an authenticated user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a custom key.
    pub fn with_custom_key(mut self, key: impl Into<String>) -> Self {
        self.custom_key = Some(key.into());
        self
    }
}

/// Which part of a [`RequestIdentity`] the quota is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// One quota per client address
    #[default]
    ClientAddress,
    /// One quota per user, anonymous requests fall back to the address
    UserId,
    /// One quota per custom key
    Custom,
}

impl KeySource {
    /// Derive the quota key, or `None` when the identity lacks the part
    /// this source needs.
    pub fn resolve(&self, identity: &RequestIdentity) -> Option<String> {
        let by_addr = || identity.client_addr.map(|addr| format!("ip:{}", addr));
        match self {
            KeySource::ClientAddress => by_addr(),
            KeySource::UserId => identity
                .user_id
                .as_deref()
                .filter(|u| !u.is_empty())
                .map(|u| format!("user:{}", u))
                .or_else(by_addr),
            KeySource::Custom => identity
                .custom_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(|k| format!("custom:{}", k)),
        }
    }
}

/// A quota bucket key, namespaced by the limiter's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Namespace of the limiter configuration
    pub prefix: String,
    /// The bucket within that namespace
    pub key: String,
}

impl RateLimitKey {
    /// Create a key. An empty key is a configuration error in the caller.
    pub fn new(prefix: &str, key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(GatekeeperError::Config(
                "rate limit key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
        })
    }

    /// The key under which the window is stored.
    pub fn to_store_key(&self) -> String {
        format!("{}:rl:{}", self.prefix, self.key)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.prefix, self.key)
    }
}
