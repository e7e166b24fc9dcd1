//! Transport configuration.
//!
//! Both configurations deserialize from JSON with every field optional, and
//! offer builder-style setters for programmatic use:
//!
//! ```
//! use conqueror::config::{FramedConfig, HttpTransportConfig};
//! use std::time::Duration;
//!
//! let http = HttpTransportConfig::new("http://localhost:8080")
//!     .with_timeout(Duration::from_secs(5))
//!     .with_header("x-api-key", "secret");
//! assert_eq!(http.timeout(), Duration::from_secs(5));
//!
//! let framed = FramedConfig::from_json(r#"{ "max_concurrent_requests": 8 }"#).unwrap();
//! assert_eq!(framed.max_concurrent_requests, 8);
//! assert_eq!(framed.channel_capacity, conqueror::config::DEFAULT_CHANNEL_CAPACITY);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default base address of the HTTP transport.
pub const DEFAULT_BASE_ADDRESS: &str = "http://localhost";

/// Default HTTP request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default maximum payload size of one frame (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum concurrently handled requests per connection.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

fn default_base_address() -> String {
    DEFAULT_BASE_ADDRESS.to_string()
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Configuration of the HTTP transport client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    /// Base address requests are sent to (scheme, host, port, optional path).
    #[serde(default = "default_base_address")]
    pub base_address: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Headers added to every request.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

impl HttpTransportConfig {
    /// Create a configuration for the given base address.
    pub fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_address: default_base_address(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            default_headers: BTreeMap::new(),
        }
    }
}

/// Configuration of the framed transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramedConfig {
    /// Largest accepted frame payload in bytes.
    pub max_payload_size: usize,
    /// Capacity of the outbound frame channel.
    pub channel_capacity: usize,
    /// Requests handled concurrently by a receiver; extra requests are rejected.
    pub max_concurrent_requests: usize,
}

impl FramedConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the maximum payload size.
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the outbound channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the maximum number of concurrently handled requests.
    pub fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit;
        self
    }
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}
