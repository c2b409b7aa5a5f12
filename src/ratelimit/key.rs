//! Rate limit key derivation.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{FloodgateError, Result};

/// Namespace distinguishing one limiter instance's keys from another's.
///
/// Must not be empty, longer than 128 bytes, or contain `:` (the separator
/// between prefix and subject).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(Arc<str>);

impl KeyPrefix {
    /// Validate and wrap a prefix.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            Err(FloodgateError::Config("key prefix must not be empty".to_string()))
        } else if prefix.len() > 128 {
            Err(FloodgateError::Config(
                "key prefix must not be longer than 128 bytes".to_string(),
            ))
        } else if prefix.contains(':') {
            Err(FloodgateError::Config(format!(
                "key prefix {prefix:?} must not contain ':'"
            )))
        } else {
            Ok(Self(Arc::from(prefix)))
        }
    }

    /// The prefix string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full store key for `subject`.
    pub fn key_for(&self, subject: &str) -> String {
        format!("{}:{}", self.0, subject)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The entity being throttled.
///
/// An authenticated user is preferred; the network address is the fallback
/// for anonymous HTTP traffic, and the connection id for message transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Authenticated user id
    User(String),
    /// Client network address
    Address(IpAddr),
    /// Transport connection id
    Connection(String),
}

impl Subject {
    /// Pick the most specific identity available.
    pub fn resolve(
        user: Option<&str>,
        address: Option<IpAddr>,
        connection: Option<&str>,
    ) -> Option<Self> {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            return Some(Subject::User(user.to_string()));
        }
        if let Some(address) = address {
            return Some(Subject::Address(address));
        }
        connection
            .filter(|c| !c.is_empty())
            .map(|c| Subject::Connection(c.to_string()))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "user:{id}"),
            Subject::Address(ip) => write!(f, "ip:{ip}"),
            Subject::Connection(id) => write!(f, "conn:{id}"),
        }
    }
}
