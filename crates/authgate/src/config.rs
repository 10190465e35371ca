//! Broker configuration
//!
//! All settings deserialize from TOML, YAML or JSON via the `config` crate, with
//! environment variables layered on top. Secrets are held as [`SecretString`]
//! and never printed by `Debug`.
//!
//! ```toml
//! base_url = "https://mcp.example.com"
//! resource_path = "/mcp"
//! state_secret = "..."
//!
//! [provider]
//! client_id = "1234.apps.googleusercontent.com"
//! client_secret = "..."
//!
//! [token]
//! signing_secret = "..."
//!
//! [security]
//! mode = "live"
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::gate::{BotCategory, BucketLimit, GateMode};
use crate::resource::validate_resource_uri;

/// Minimum length for HMAC and signing secrets
pub const MIN_SECRET_LEN: usize = 32;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value is present but unusable
    #[error("Invalid configuration for `{field}`: {message}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Load any deserializable settings type from a file plus environment overrides
///
/// The format is picked from the extension. Variables named
/// `{prefix}_{SECTION}__{KEY}` override file values, e.g.
/// `AUTHGATE_PROVIDER__CLIENT_ID`.
///
/// # Errors
///
/// Returns an error if the file is missing, has an unknown extension, or does
/// not deserialize into `T`.
pub fn load_layered<T: DeserializeOwned>(
    path: impl AsRef<Path>,
    env_prefix: &str,
) -> Result<T, ConfigError> {
    load_with_env(path.as_ref(), env_overrides(env_prefix))
}

fn env_overrides(prefix: &str) -> config::Environment {
    config::Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn load_with_env<T: DeserializeOwned>(
    path: &Path,
    env: config::Environment,
) -> Result<T, ConfigError> {
    use config::{Config, File, FileFormat};

    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => FileFormat::Toml,
        Some("yaml" | "yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => return Err(ConfigError::UnsupportedFormat),
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
            format,
        ))
        .add_source(env)
        .build()?;

    Ok(settings.try_deserialize()?)
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(SecretString::new(s))
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// Top-level broker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Public origin of the broker, e.g. `https://mcp.example.com`
    pub base_url: String,
    /// Path of the protected resource; joined with `base_url` it forms the
    /// resource identifier tokens are bound to
    pub resource_path: String,
    /// Human-readable resource name for metadata
    pub resource_name: Option<String>,
    /// Realm in `WWW-Authenticate` challenges
    pub realm: String,
    /// Path the upstream provider redirects back to
    pub callback_path: String,
    /// Scopes clients may request
    pub supported_scopes: Vec<String>,
    /// Scope recorded when the client sends none
    pub default_scope: String,
    /// Reject authorization requests without `state`
    pub require_state: bool,
    /// Accept requests without PKCE from loopback redirect URIs
    pub allow_pkce_opt_out: bool,
    /// Lifetime of a pending grant in seconds
    pub grant_ttl_secs: u64,
    /// Key for the continuation-state MAC
    #[serde(deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub state_secret: SecretString,
    /// Upstream identity provider
    pub provider: ProviderConfig,
    /// Access tokens minted and accepted by the broker
    pub token: TokenConfig,
    /// Security gate
    pub security: SecurityConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            resource_path: "/mcp".to_string(),
            resource_name: None,
            realm: "MCP Server".to_string(),
            callback_path: "/callback".to_string(),
            supported_scopes: ["openid", "profile", "email", "mcp:read", "mcp:write"]
                .into_iter()
                .map(String::from)
                .collect(),
            default_scope: "openid profile email mcp:read mcp:write".to_string(),
            require_state: false,
            allow_pkce_opt_out: false,
            grant_ttl_secs: 600,
            state_secret: empty_secret(),
            provider: ProviderConfig::default(),
            token: TokenConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load from a file with `AUTHGATE_*` environment overrides
    ///
    /// # Errors
    ///
    /// See [`load_layered`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_layered(path, "AUTHGATE")
    }

    /// Origin without a trailing slash
    pub fn origin(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Canonical RFC 8707 identifier of the protected resource
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` + `resource_path` is not a usable resource URI.
    pub fn resource_identifier(&self) -> Result<String, ConfigError> {
        validate_resource_uri(&format!("{}{}", self.origin(), self.resource_path))
            .map_err(|e| ConfigError::invalid("resource_path", e.to_string()))
    }

    /// URL of the protected-resource metadata document
    pub fn resource_metadata_url(&self) -> String {
        format!("{}/.well-known/oauth-protected-resource", self.origin())
    }

    /// Redirect URI registered with the upstream provider
    pub fn provider_redirect_uri(&self) -> String {
        format!("{}{}", self.origin(), self.callback_path)
    }

    /// Issuer of broker-minted access tokens
    pub fn token_issuer(&self) -> String {
        self.token
            .issuer
            .clone()
            .unwrap_or_else(|| self.origin().to_string())
    }

    /// Pending grant lifetime
    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl_secs)
    }

    /// Check the configuration is usable before serving
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("base_url", "must be http or https"));
        }
        self.resource_identifier()?;

        if !self.callback_path.starts_with('/') {
            return Err(ConfigError::invalid("callback_path", "must start with '/'"));
        }
        if self.grant_ttl_secs == 0 {
            return Err(ConfigError::invalid("grant_ttl_secs", "must be positive"));
        }
        for scope in self.default_scope.split_whitespace() {
            if !self.supported_scopes.iter().any(|s| s == scope) {
                return Err(ConfigError::invalid(
                    "default_scope",
                    format!("`{scope}` is not in supported_scopes"),
                ));
            }
        }

        check_secret("state_secret", &self.state_secret)?;
        check_secret("token.signing_secret", &self.token.signing_secret)?;
        self.provider.validate()?;
        self.security.validate()
    }
}

fn check_secret(field: &'static str, secret: &SecretString) -> Result<(), ConfigError> {
    if secret.expose_secret().len() < MIN_SECRET_LEN {
        return Err(ConfigError::invalid(
            field,
            format!("must be at least {MIN_SECRET_LEN} bytes"),
        ));
    }
    Ok(())
}

/// Upstream OpenID Connect provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name, used in the callback route
    pub name: String,
    /// Authorization endpoint
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Broker's client ID at the provider
    pub client_id: String,
    /// Broker's client secret at the provider
    #[serde(deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub client_secret: SecretString,
    /// Scopes requested from the provider
    pub scopes: Vec<String>,
    /// Additional authorization parameters
    pub extra_params: BTreeMap<String, String>,
    /// Code exchange timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "google".to_string(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: String::new(),
            client_secret: empty_secret(),
            scopes: ["openid", "profile", "email"]
                .into_iter()
                .map(String::from)
                .collect(),
            extra_params: BTreeMap::from([
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ]),
            timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid(
                "provider.name",
                "must be a non-empty path segment",
            ));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::invalid("provider.client_id", "is required"));
        }
        Url::parse(&self.authorize_url)
            .map_err(|e| ConfigError::invalid("provider.authorize_url", e.to_string()))?;
        Url::parse(&self.token_url)
            .map_err(|e| ConfigError::invalid("provider.token_url", e.to_string()))?;
        Ok(())
    }

    /// Code exchange timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Access token issuance and verification
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HS256 key for broker-minted access tokens
    #[serde(deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub signing_secret: SecretString,
    /// `iss` of minted tokens; defaults to the broker origin
    pub issuer: Option<String>,
    /// Access token lifetime in seconds
    pub access_token_ttl_secs: u64,
    /// Scopes every request to the protected resource must carry
    pub required_scopes: Vec<String>,
    /// Verify provider-issued tokens against this JWKS instead of the signing secret
    pub jwks_uri: Option<String>,
    /// Expected `iss` when verifying through JWKS
    pub jwks_issuer: Option<String>,
    /// Upper bound on a single verification, in milliseconds
    pub verify_timeout_ms: u64,
    /// Clock skew tolerance in seconds
    pub leeway_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: empty_secret(),
            issuer: None,
            access_token_ttl_secs: 3600,
            required_scopes: Vec::new(),
            jwks_uri: None,
            jwks_issuer: None,
            verify_timeout_ms: 5000,
            leeway_secs: 60,
        }
    }
}

impl TokenConfig {
    /// Verification timeout
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms.max(1))
    }

    /// Access token lifetime
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }
}

/// Refill and capacity of one gate profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BucketConfig {
    /// Tokens added per interval
    pub refill_rate: u32,
    /// Interval length in seconds
    pub interval_secs: u64,
    /// Bucket capacity
    pub capacity: u32,
}

impl BucketConfig {
    /// Create a bucket setting
    pub const fn new(refill_rate: u32, interval_secs: u64, capacity: u32) -> Self {
        Self {
            refill_rate,
            interval_secs,
            capacity,
        }
    }

    /// As a limiter setting
    pub fn limit(&self) -> BucketLimit {
        BucketLimit::new(
            self.refill_rate,
            Duration::from_secs(self.interval_secs),
            self.capacity,
        )
    }
}

/// Security gate settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enforce or only log denials
    pub mode: GateMode,
    /// Protected resource bucket
    pub protected: BucketConfig,
    /// OAuth endpoint bucket
    pub oauth: BucketConfig,
    /// Discovery document bucket
    pub discovery: BucketConfig,
    /// Bot categories that pass bot detection
    pub allowed_bots: Vec<BotCategory>,
    /// Run the attack-signature shield
    pub shield: bool,
    /// Reverse proxies whose `X-Forwarded-For` and `X-Real-IP` are believed
    ///
    /// Empty means the socket peer is always the client.
    pub trusted_proxies: Vec<IpAddr>,
    /// Minimum seconds between idle bucket sweeps
    pub sweep_interval_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl SecurityConfig {
    /// Production limits, enforced
    pub fn production() -> Self {
        Self {
            mode: GateMode::Live,
            protected: BucketConfig::new(30, 60, 50),
            oauth: BucketConfig::new(60, 60, 100),
            discovery: BucketConfig::new(120, 60, 150),
            allowed_bots: BotCategory::DEFAULT_ALLOWED.to_vec(),
            shield: true,
            trusted_proxies: Vec::new(),
            sweep_interval_secs: 300,
        }
    }

    /// Looser limits, denials only logged
    pub fn development() -> Self {
        Self {
            mode: GateMode::DryRun,
            protected: BucketConfig::new(100, 60, 200),
            oauth: BucketConfig::new(100, 60, 200),
            discovery: BucketConfig::new(200, 60, 300),
            ..Self::production()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, bucket) in [
            ("security.protected", self.protected),
            ("security.oauth", self.oauth),
            ("security.discovery", self.discovery),
        ] {
            if bucket.refill_rate == 0 || bucket.interval_secs == 0 || bucket.capacity == 0 {
                return Err(ConfigError::invalid(field, "refill_rate, interval_secs and capacity must be positive"));
            }
        }
        Ok(())
    }
}
