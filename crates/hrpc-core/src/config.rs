//! Runtime configuration.
//!
//! [`RpcConfig`] is an ordinary value handed to every component at
//! construction; there is no process-wide instance. Fixed protocol limits
//! live on [`TransportLimits`].

use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol limits shared by client and server.
pub struct TransportLimits;

impl TransportLimits {
    /// Largest accepted frame body (request id + payload).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Length prefix (4 bytes) plus request id (8 bytes).
    pub const FRAME_HEADER_LEN: usize = 12;
    /// Concurrent inbound connections a receive server accepts.
    pub const MAX_SERVER_CONNECTIONS: usize = 256;
}

/// Serializer names accepted in [`RpcConfig::serializer`].
pub const SERIALIZER_NAMES: &[&str] = &["json", "msgpack"];

/// Configuration for registry, transport and context construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address of the coordination ensemble.
    pub coordination_address: String,
    /// Coordination session timeout in milliseconds.
    pub session_timeout_ms: u64,
    /// Root node under which services register.
    pub registry_path: String,
    /// Bind address for the receive server; `None` disables serving.
    pub server_address: Option<String>,
    /// Address written into registration nodes. Defaults to the bound address.
    pub advertise_address: Option<String>,
    /// Service names to watch. Empty means every service under the root.
    pub focus_services: Vec<String>,
    /// Per-call deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Connection establishment bound in milliseconds.
    pub connect_timeout_ms: u64,
    /// Period of the pending-call timeout sweep in milliseconds.
    pub sweep_interval_ms: u64,
    /// Serializer name, one of [`SERIALIZER_NAMES`].
    pub serializer: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            coordination_address: "127.0.0.1:2181".to_string(),
            session_timeout_ms: 5_000,
            registry_path: "/registry".to_string(),
            server_address: None,
            advertise_address: None,
            focus_services: Vec::new(),
            request_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            sweep_interval_ms: 250,
            serializer: "json".to_string(),
        }
    }
}

impl RpcConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RpcConfig = serde_json::from_str(json).map_err(|e| RpcError::Config {
            message: format!("Invalid configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let path = &self.registry_path;
        if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
            return Err(RpcError::Config {
                message: format!(
                    "registry_path must be an absolute node path without a trailing slash: {:?}",
                    path
                ),
            });
        }

        for (field, value) in [
            ("session_timeout_ms", self.session_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(RpcError::Config {
                    message: format!("{} must be greater than zero", field),
                });
            }
        }

        if !SERIALIZER_NAMES.contains(&self.serializer.as_str()) {
            return Err(RpcError::Config {
                message: format!(
                    "Unknown serializer {:?}, expected one of {:?}",
                    self.serializer, SERIALIZER_NAMES
                ),
            });
        }

        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Set the registry root path.
    pub fn with_registry_path(mut self, path: impl Into<String>) -> Self {
        self.registry_path = path.into();
        self
    }

    /// Set the receive server bind address.
    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    /// Set the address published in registration nodes.
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    /// Restrict discovery to the given service names.
    pub fn with_focus_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.focus_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-call deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connection establishment bound.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pending-call sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Select the serializer by name.
    pub fn with_serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = name.into();
        self
    }
}
