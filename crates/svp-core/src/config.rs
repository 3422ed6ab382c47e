//! Centralized configuration for the Shared Variable Processor.
//!
//! Compile-time defaults live as associated constants on unit structs;
//! runtime settings for a broker instance are collected by
//! [`BrokerConfig::builder`].

use crate::{Result, SvpError};
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

/// Protocol-level configuration shared by broker and clients.
pub struct SvpConfig;

impl SvpConfig {
    pub const DEFAULT_PORT: u16 = 16366;
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    /// Upper bound on the 4-byte frame length prefix.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Maximum number of code points in a shared variable name.
    pub const MAX_SVAR_NAMELEN: usize = 64;
    /// Upper bound on a length-prefixed string field.
    pub const MAX_STRING_FIELD: usize = u16::MAX as usize;
}

/// Client-side access polling (`may_use` / `may_set` retry loop).
pub struct AccessConfig;

impl AccessConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Attempts after which a still-blocked access is logged.
    pub const LOG_AFTER_ATTEMPTS: u32 = 20;
    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Broker resource limits.
pub struct BrokerLimits;

impl BrokerLimits {
    /// How long the remainder of a frame may take once its length prefix
    /// has arrived.
    pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 256;
    /// Bound on requests queued for the broker task across all connections.
    pub const EVENT_QUEUE: usize = 1024;
    /// Signals queued for one connection's writer. A peer that falls this
    /// far behind is disconnected.
    pub const OUTBOUND_QUEUE: usize = 256;
}

/// Where the broker listens and clients connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp {
            host: SvpConfig::DEFAULT_HOST.to_string(),
            port: SvpConfig::DEFAULT_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Runtime configuration of one broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub endpoint: Endpoint,
    /// Bound on live shared variables; `None` means unbounded.
    pub max_variables: Option<usize>,
    pub max_connections: usize,
    pub frame_read_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            max_variables: None,
            max_connections: BrokerLimits::MAX_CONNECTIONS,
            frame_read_timeout: BrokerLimits::FRAME_READ_TIMEOUT,
        }
    }
}

impl BrokerConfig {
    /// Create a builder starting from the compiled-in defaults.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let config = BrokerConfig::builder()
    ///     .tcp("127.0.0.1", 0)
    ///     .max_variables(64)
    ///     .build()?;
    /// ```
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder {
            config: BrokerConfig::default(),
        }
    }
}

/// Builder for [`BrokerConfig`].
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Listen on a TCP address. Port 0 lets the OS pick one.
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.endpoint = Endpoint::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Listen on a Unix-domain socket path.
    #[cfg(unix)]
    pub fn unix(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.endpoint = Endpoint::Unix(path.into());
        self
    }

    /// Bound the number of live shared variables.
    ///
    /// Once the table holds this many records, new offers are refused.
    /// Default: unbounded
    pub fn max_variables(mut self, max: usize) -> Self {
        self.config.max_variables = Some(max);
        self
    }

    /// Default: [`BrokerLimits::MAX_CONNECTIONS`]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Default: [`BrokerLimits::FRAME_READ_TIMEOUT`]
    pub fn frame_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.frame_read_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<BrokerConfig> {
        let config = self.config;
        if config.max_variables == Some(0) {
            return Err(SvpError::Config {
                message: "max_variables must be at least 1".to_string(),
            });
        }
        if config.max_connections == 0 {
            return Err(SvpError::Config {
                message: "max_connections must be at least 1".to_string(),
            });
        }
        if config.frame_read_timeout.is_zero() {
            return Err(SvpError::Config {
                message: "frame_read_timeout must be non-zero".to_string(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::builder().build().unwrap();
        assert_eq!(
            config.endpoint,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: SvpConfig::DEFAULT_PORT
            }
        );
        assert_eq!(config.max_variables, None);
        assert_eq!(config.max_connections, BrokerLimits::MAX_CONNECTIONS);
    }

    #[test]
    fn test_builder_rejects_zero_limits() {
        assert!(BrokerConfig::builder().max_variables(0).build().is_err());
        assert!(BrokerConfig::builder().max_connections(0).build().is_err());
        assert!(BrokerConfig::builder()
            .frame_read_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let config = BrokerConfig::builder().tcp("0.0.0.0", 4000).build().unwrap();
        assert_eq!(config.endpoint.to_string(), "0.0.0.0:4000");
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(AccessConfig::DEFAULT_TIMEOUT > AccessConfig::POLL_INTERVAL);
        assert!(BrokerLimits::FRAME_READ_TIMEOUT > Duration::ZERO);
    }
}
