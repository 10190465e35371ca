//! Process-level settings
//!
//! These live in the same file as the broker sections:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:3000"
//! request_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use authgate::ConfigError;
use serde::Deserialize;

use crate::logging::LoggingConfig;

/// `[server]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind: SocketAddr,
    /// Whole-request deadline, upstream calls included
    pub request_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            request_timeout_secs: 30,
        }
    }
}

impl ListenConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Settings owned by the binary rather than the broker library
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub server: ListenConfig,
    pub logging: LoggingConfig,
}

impl ServerSettings {
    /// Read `[server]` and `[logging]` with `AUTHGATE_*` overrides
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`authgate::config::load_layered`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        authgate::config::load_layered(path, "AUTHGATE")
    }
}
