//! Request admission control
//!
//! Every externally reachable endpoint asks the [`SecurityGate`] for a
//! [`SecurityDecision`] before doing any work. The gate runs three checks in
//! order:
//!
//! 1. **Shield** - attack-signature match on the request target
//! 2. **Bot detection** - user-agent classification with an allow-list
//! 3. **Token bucket** - per-profile, per-IP rate limit
//!
//! A request refused by the shield or bot check never touches the bucket.
//!
//! ## Profiles
//!
//! | profile     | checks               |
//! |-------------|----------------------|
//! | `protected` | shield, bot, bucket  |
//! | `oauth`     | shield, bucket       |
//! | `discovery` | bucket               |
//!
//! In [`GateMode::DryRun`] every check still runs and counts, but a denial is
//! only logged.

mod bot;
mod bucket;
mod shield;

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::extract::ConnectInfo;
use http::{HeaderMap, request::Parts};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use bot::{BotCategory, classify_user_agent};
pub use bucket::{BucketLimit, Exhausted, TokenBucketLimiter};
pub use shield::{Shield, ShieldRule};

use crate::config::SecurityConfig;

/// Which limit and which checks apply to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateProfile {
    /// The protected resource itself
    #[serde(rename = "protected")]
    Protected,
    /// Authorization, callback and token endpoints
    #[serde(rename = "oauth")]
    OAuth,
    /// Well-known metadata documents
    #[serde(rename = "discovery")]
    Discovery,
}

impl GateProfile {
    /// Stable name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protected => "protected",
            Self::OAuth => "oauth",
            Self::Discovery => "discovery",
        }
    }

    fn runs_shield(self) -> bool {
        !matches!(self, Self::Discovery)
    }

    fn runs_bot_detection(self) -> bool {
        matches!(self, Self::Protected)
    }
}

/// Whether denials are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Denials are returned to the caller
    #[default]
    Live,
    /// Denials are logged and the request is allowed
    DryRun,
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Token bucket exhausted until `reset_at`
    RateLimit {
        /// Monotonic instant at which the bucket can pay again
        reset_at: Instant,
    },
    /// Automated client outside the allow-list
    Bot {
        /// Detected bot family
        category: BotCategory,
    },
    /// Attack signature matched
    Shield {
        /// Matched signature family
        rule: ShieldRule,
    },
}

impl DenyReason {
    /// Taxonomy name: `rate_limit`, `bot` or `shield`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::Bot { .. } => "bot",
            Self::Shield { .. } => "shield",
        }
    }

    /// Whole seconds to wait, rounded up and at least one; `None` unless rate limited
    pub fn retry_after_secs(&self, now: Instant) -> Option<u64> {
        match self {
            Self::RateLimit { reset_at } => {
                let wait = reset_at.saturating_duration_since(now);
                Some(ceil_secs(wait).max(1))
            }
            _ => None,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit { .. } => f.write_str("rate limit exceeded"),
            Self::Bot { category } => write!(f, "bot detected ({category})"),
            Self::Shield { rule } => write!(f, "shield rule matched ({rule})"),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityDecision {
    /// Proceed
    Allow,
    /// Refuse with the given reason
    Deny(DenyReason),
}

impl SecurityDecision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Deny reason, if any
    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

/// The parts of a request the gate looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFacts {
    /// Client address used as the bucket key
    pub client_ip: String,
    /// Request path
    pub path: String,
    /// Raw query string
    pub query: Option<String>,
    /// `User-Agent` header value
    pub user_agent: Option<String>,
}

impl RequestFacts {
    /// Facts for a bare IP and path
    pub fn new(client_ip: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            path: path.into(),
            query: None,
            user_agent: None,
        }
    }

    /// Attach a raw query string
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Attach a user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Collect facts from request parts
    ///
    /// Forwarding headers are read only when the socket peer is one of
    /// `trusted_proxies`.
    pub fn from_parts(parts: &Parts, trusted_proxies: &[IpAddr]) -> Self {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            client_ip: client_ip(&parts.headers, peer, trusted_proxies),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            user_agent: parts
                .headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

/// Resolve the client address
///
/// The socket peer is the client unless it is a trusted proxy. Behind a
/// trusted proxy the first `X-Forwarded-For` entry wins, then `X-Real-IP`,
/// then the proxy itself. Header values that are not IP addresses are
/// ignored. Without a peer the result is `"unknown"`.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> String {
    let Some(peer) = peer.map(|addr| addr.ip().to_canonical()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    forwarded.or_else(real_ip).unwrap_or(peer).to_string()
}

/// Bucket key: one bucket per profile per client
pub type GateKey = (GateProfile, String);

/// Admission controller shared by all endpoints
#[derive(Debug)]
pub struct SecurityGate {
    mode: GateMode,
    protected: BucketLimit,
    oauth: BucketLimit,
    discovery: BucketLimit,
    allowed_bots: HashSet<BotCategory>,
    trusted_proxies: Vec<IpAddr>,
    shield: Option<Shield>,
    limiter: TokenBucketLimiter<GateKey>,
}

impl SecurityGate {
    /// Build a gate from configuration
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            mode: config.mode,
            protected: config.protected.limit(),
            oauth: config.oauth.limit(),
            discovery: config.discovery.limit(),
            allowed_bots: config.allowed_bots.iter().copied().collect(),
            trusted_proxies: config
                .trusted_proxies
                .iter()
                .map(IpAddr::to_canonical)
                .collect(),
            shield: config.shield.then_some(Shield),
            limiter: TokenBucketLimiter::new(Duration::from_secs(config.sweep_interval_secs)),
        }
    }

    /// Enforcement mode
    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Facts for a request, resolving the client through trusted proxies
    pub fn facts(&self, parts: &Parts) -> RequestFacts {
        RequestFacts::from_parts(parts, &self.trusted_proxies)
    }

    /// Bucket settings for a profile
    pub fn limit(&self, profile: GateProfile) -> BucketLimit {
        match profile {
            GateProfile::Protected => self.protected,
            GateProfile::OAuth => self.oauth,
            GateProfile::Discovery => self.discovery,
        }
    }

    /// Classify a request at the current instant
    pub fn evaluate(&self, facts: &RequestFacts, profile: GateProfile, cost: u32) -> SecurityDecision {
        self.evaluate_at(facts, profile, cost, Instant::now())
    }

    /// Classify a request at `now`
    pub fn evaluate_at(
        &self,
        facts: &RequestFacts,
        profile: GateProfile,
        cost: u32,
        now: Instant,
    ) -> SecurityDecision {
        let decision = self.decide(facts, profile, cost, now);

        let SecurityDecision::Deny(reason) = decision else {
            return decision;
        };

        warn!(
            target: "authgate::security",
            profile = profile.as_str(),
            client_ip = %facts.client_ip,
            path = %facts.path,
            reason = reason.kind(),
            detail = %reason,
            dry_run = self.mode == GateMode::DryRun,
            "security gate denial"
        );

        match self.mode {
            GateMode::Live => decision,
            GateMode::DryRun => SecurityDecision::Allow,
        }
    }

    fn decide(
        &self,
        facts: &RequestFacts,
        profile: GateProfile,
        cost: u32,
        now: Instant,
    ) -> SecurityDecision {
        if profile.runs_shield()
            && let Some(shield) = &self.shield
            && let Some(rule) = shield.inspect(&facts.path, facts.query.as_deref())
        {
            return SecurityDecision::Deny(DenyReason::Shield { rule });
        }

        if profile.runs_bot_detection()
            && let Some(category) = classify_user_agent(facts.user_agent.as_deref())
            && !self.allowed_bots.contains(&category)
        {
            return SecurityDecision::Deny(DenyReason::Bot { category });
        }

        let key = (profile, facts.client_ip.clone());
        let limit = self.limit(profile);
        let outcome = self.limiter.try_acquire(&key, &limit, cost, now);

        let swept = self.limiter.sweep_if_due(|(p, _)| self.limit(*p), now);
        if swept > 0 {
            debug!(target: "authgate::security", swept, "swept idle rate-limit buckets");
        }

        match outcome {
            Ok(_) => SecurityDecision::Allow,
            Err(exhausted) => SecurityDecision::Deny(DenyReason::RateLimit {
                reset_at: exhausted.reset_at,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, SecurityConfig};

    const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";

    fn tight_config() -> SecurityConfig {
        SecurityConfig {
            protected: BucketConfig::new(1, 10, 2),
            oauth: BucketConfig::new(1, 10, 3),
            discovery: BucketConfig::new(1, 10, 1),
            ..SecurityConfig::default()
        }
    }

    fn browser(ip: &str, path: &str) -> RequestFacts {
        RequestFacts::new(ip, path).with_user_agent(BROWSER)
    }

    #[tokio::test]
    async fn test_gate_rate_limits_per_profile_and_ip() {
        let gate = SecurityGate::new(&tight_config());
        let now = Instant::now();
        let facts = browser("203.0.113.7", "/mcp");

        assert!(gate.evaluate_at(&facts, GateProfile::Protected, 1, now).is_allowed());
        assert!(gate.evaluate_at(&facts, GateProfile::Protected, 1, now).is_allowed());
        let denied = gate.evaluate_at(&facts, GateProfile::Protected, 1, now);
        assert_eq!(denied.reason().map(DenyReason::kind), Some("rate_limit"));

        // Same client, different profile has its own bucket
        assert!(gate.evaluate_at(&facts, GateProfile::OAuth, 1, now).is_allowed());
        // Different client, same profile
        let other = browser("203.0.113.8", "/mcp");
        assert!(gate.evaluate_at(&other, GateProfile::Protected, 1, now).is_allowed());
    }

    #[tokio::test]
    async fn test_gate_retry_after_is_ceiled() {
        let gate = SecurityGate::new(&tight_config());
        let start = Instant::now();
        let facts = browser("198.51.100.1", "/.well-known/oauth-protected-resource");

        assert!(gate.evaluate_at(&facts, GateProfile::Discovery, 1, start).is_allowed());
        let later = start + Duration::from_millis(3500);
        let decision = gate.evaluate_at(&facts, GateProfile::Discovery, 1, later);
        let reason = decision.reason().copied().unwrap();
        assert_eq!(reason.retry_after_secs(later), Some(7));

        let after_wait = later + Duration::from_secs(7);
        assert!(gate.evaluate_at(&facts, GateProfile::Discovery, 1, after_wait).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_bucket_refills_with_clock() {
        let gate = SecurityGate::new(&tight_config());
        let facts = browser("198.51.100.2", "/mcp");

        assert!(gate.evaluate(&facts, GateProfile::Protected, 1).is_allowed());
        assert!(gate.evaluate(&facts, GateProfile::Protected, 1).is_allowed());
        assert!(!gate.evaluate(&facts, GateProfile::Protected, 1).is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(gate.evaluate(&facts, GateProfile::Protected, 1).is_allowed());
        assert!(!gate.evaluate(&facts, GateProfile::Protected, 1).is_allowed());
    }

    #[tokio::test]
    async fn test_gate_bot_allow_list() {
        let gate = SecurityGate::new(&SecurityConfig::default());

        let crawler = RequestFacts::new("192.0.2.1", "/mcp").with_user_agent("Googlebot/2.1");
        assert!(gate.evaluate(&crawler, GateProfile::Protected, 1).is_allowed());

        let scanner = RequestFacts::new("192.0.2.2", "/mcp").with_user_agent("sqlmap/1.7");
        assert_eq!(
            gate.evaluate(&scanner, GateProfile::Protected, 1),
            SecurityDecision::Deny(DenyReason::Bot {
                category: BotCategory::Scanner
            })
        );

        // Bot detection only runs on the protected profile
        assert!(gate.evaluate(&scanner, GateProfile::OAuth, 1).is_allowed());
    }

    #[tokio::test]
    async fn test_gate_shield_precedes_bucket() {
        let gate = SecurityGate::new(&tight_config());
        let now = Instant::now();
        let attack = browser("192.0.2.9", "/authorize").with_query("state=%3Cscript%3E");

        for _ in 0..10 {
            assert_eq!(
                gate.evaluate_at(&attack, GateProfile::OAuth, 1, now),
                SecurityDecision::Deny(DenyReason::Shield {
                    rule: ShieldRule::ScriptInjection
                })
            );
        }

        // Blocked requests did not drain the bucket
        let clean = browser("192.0.2.9", "/authorize");
        for _ in 0..3 {
            assert!(gate.evaluate_at(&clean, GateProfile::OAuth, 1, now).is_allowed());
        }
    }

    #[tokio::test]
    async fn test_gate_discovery_skips_shield() {
        let gate = SecurityGate::new(&SecurityConfig::default());
        let facts = RequestFacts::new("192.0.2.3", "/.well-known/x").with_query("a=../../");
        assert!(gate.evaluate(&facts, GateProfile::Discovery, 1).is_allowed());
    }

    #[tokio::test]
    async fn test_gate_dry_run_never_denies() {
        let config = SecurityConfig {
            mode: GateMode::DryRun,
            ..tight_config()
        };
        let gate = SecurityGate::new(&config);
        let now = Instant::now();

        let bot = RequestFacts::new("192.0.2.4", "/mcp").with_user_agent("nikto");
        for _ in 0..20 {
            assert!(gate.evaluate_at(&bot, GateProfile::Protected, 1, now).is_allowed());
        }
    }

    #[test]
    fn test_client_ip_ignores_headers_from_untrusted_peer() {
        let peer: SocketAddr = "198.51.100.7:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5".parse().unwrap());
        headers.insert("x-real-ip", "203.0.113.6".parse().unwrap());

        assert_eq!(client_ip(&headers, Some(peer), &[]), "198.51.100.7");
        assert_eq!(client_ip(&headers, None, &[]), "unknown");

        let other_proxy: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer), &[other_proxy]), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_behind_trusted_proxy() {
        let proxy: SocketAddr = "10.1.1.1:4000".parse().unwrap();
        let trusted = [proxy.ip()];

        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(proxy), &trusted), "10.1.1.1");

        headers.insert("x-real-ip", "198.51.100.20".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(proxy), &trusted), "198.51.100.20");

        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(proxy), &trusted), "203.0.113.5");

        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(proxy), &trusted), "198.51.100.20");
    }

    #[test]
    fn test_client_ip_matches_mapped_peer() {
        let mapped: SocketAddr = "[::ffff:10.1.1.1]:4000".parse().unwrap();
        let trusted: [IpAddr; 1] = ["10.1.1.1".parse().unwrap()];
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(mapped), &trusted), "203.0.113.5");
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_shares_one_bucket() {
        let gate = SecurityGate::new(&tight_config());
        let now = Instant::now();
        let mut limited = 0;

        for i in 0..20 {
            let request = http::Request::builder()
                .uri("/.well-known/oauth-protected-resource")
                .header("x-forwarded-for", format!("203.0.113.{i}"))
                .extension(ConnectInfo("198.51.100.50:5000".parse::<SocketAddr>().unwrap()))
                .body(())
                .unwrap();
            let (parts, ()) = request.into_parts();
            let facts = gate.facts(&parts);
            assert_eq!(facts.client_ip, "198.51.100.50");
            if !gate.evaluate_at(&facts, GateProfile::Discovery, 1, now).is_allowed() {
                limited += 1;
            }
        }
        assert_eq!(limited, 19);
    }

    #[test]
    fn test_request_facts_from_parts() {
        let request = http::Request::builder()
            .uri("/authorize?client_id=abc")
            .header("user-agent", "cli/1.0")
            .header("x-real-ip", "192.0.2.44")
            .extension(ConnectInfo("10.0.0.2:8080".parse::<SocketAddr>().unwrap()))
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();

        let trusted: [IpAddr; 1] = ["10.0.0.2".parse().unwrap()];
        let facts = RequestFacts::from_parts(&parts, &trusted);
        assert_eq!(facts.client_ip, "192.0.2.44");
        assert_eq!(facts.path, "/authorize");
        assert_eq!(facts.query.as_deref(), Some("client_id=abc"));
        assert_eq!(facts.user_agent.as_deref(), Some("cli/1.0"));
    }
}
