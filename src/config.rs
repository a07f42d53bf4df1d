//! Configuration module for environment variables and safety tables

use std::collections::HashSet;
use std::{env, time::Duration};

use ipnet::{Ipv4Net, Ipv6Net};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 8080)
    pub port: u16,
    /// Log level (default: info)
    pub log_level: String,
    /// Path prefix the admission gate applies to (default: /api)
    pub api_prefix: String,
    /// Maximum concurrent outbound relay fetches (default: 100)
    pub max_concurrent: usize,
    /// Maximum relay request body size in bytes (default: 2MB)
    pub max_request_body_size: usize,
    /// Maximum upstream response body size in bytes (default: 5MB)
    pub max_response_body_size: usize,
    /// Outbound fetch timeout in seconds (default: 15)
    pub fetch_timeout: u64,
    /// Redirect-probe timeout in seconds (default: 5)
    pub probe_timeout: u64,
    /// Maximum redirect hops chased by the probe (default: 5)
    pub max_redirects: usize,
    /// Server-side request timeout in seconds (default: 60)
    pub server_timeout: u64,

    /// Default per-identity request cap per window (default: 60/min)
    pub rate_limit_default: u32,
    /// Cap for upload-tier paths (default: 10/min)
    pub rate_limit_upload: u32,
    /// Multiplier applied to the default cap for high-volume paths (default: 3)
    pub high_volume_multiplier: u32,
    /// Rate window (default: 60s)
    pub rate_window: Duration,
    /// Path prefixes that get the strict upload tier
    pub upload_prefixes: Vec<String>,
    /// Path prefixes that get the relaxed high-volume tier
    pub high_volume_prefixes: Vec<String>,

    /// Relay's own per-identity cap per minute (default: 20)
    pub relay_rate_limit: u32,

    /// Anomaly count within the suspicion window that triggers blacklisting
    pub suspicion_threshold: u32,
    /// Suspicion accumulation window (default: 10 minutes)
    pub suspicion_window: Duration,
    /// How long a blacklisted identity stays blocked (default: 30 minutes)
    pub blacklist_duration: Duration,
    /// Client token lifetime (default: 2 hours)
    pub token_lifetime: Duration,
    /// Accepted clock skew for the advisory signature timestamp (default: 300s)
    pub signature_max_skew: Duration,

    /// Operator-configured header/value pairs every API request must carry
    pub required_headers: Vec<(String, String)>,

    /// Safety tables for the SSRF predicate
    pub blocklist: Blocklist,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8080),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_prefix: env::var("API_PREFIX").unwrap_or_else(|_| "/api".to_string()),
            max_concurrent: env_parse("MAX_CONCURRENT", 100),
            max_request_body_size: env_parse("MAX_REQUEST_BODY_SIZE", 2 * 1024 * 1024),
            max_response_body_size: env_parse("MAX_RESPONSE_BODY_SIZE", 5 * 1024 * 1024),
            fetch_timeout: env_parse("FETCH_TIMEOUT", 15),
            probe_timeout: env_parse("PROBE_TIMEOUT", 5),
            max_redirects: env_parse("MAX_REDIRECTS", 5),
            server_timeout: env_parse("SERVER_TIMEOUT", 60),
            rate_limit_default: env_parse("RATE_LIMIT_DEFAULT", 60),
            rate_limit_upload: env_parse("RATE_LIMIT_UPLOAD", 10),
            high_volume_multiplier: env_parse("HIGH_VOLUME_MULTIPLIER", 3),
            rate_window: Duration::from_secs(env_parse("RATE_WINDOW_SECS", 60)),
            upload_prefixes: env_list("UPLOAD_PREFIXES", &["/api/upload"]),
            high_volume_prefixes: env_list("HIGH_VOLUME_PREFIXES", &["/api/lookup"]),
            relay_rate_limit: env_parse("RELAY_RATE_LIMIT", 20),
            suspicion_threshold: env_parse("SUSPICION_THRESHOLD", 10),
            suspicion_window: Duration::from_secs(env_parse("SUSPICION_WINDOW_SECS", 600)),
            blacklist_duration: Duration::from_secs(env_parse("BLACKLIST_DURATION_SECS", 1800)),
            token_lifetime: Duration::from_secs(env_parse("TOKEN_LIFETIME_SECS", 7200)),
            signature_max_skew: Duration::from_secs(env_parse("SIGNATURE_MAX_SKEW_SECS", 300)),
            required_headers: parse_required_headers(
                &env::var("REQUIRED_HEADERS").unwrap_or_default(),
            ),
            blocklist: Blocklist::builtin(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Parse `Name=value,Other=value` pairs; malformed entries are skipped
fn parse_required_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Safety tables the SSRF predicate is evaluated against.
///
/// Kept as data rather than inline checks so the predicate can be
/// unit-tested against a fixed table and the lists updated without
/// touching the validation logic.
#[derive(Debug, Clone)]
pub struct Blocklist {
    /// IPv4 ranges outbound requests must never reach
    pub nets_v4: Vec<Ipv4Net>,
    /// IPv6 ranges outbound requests must never reach
    pub nets_v6: Vec<Ipv6Net>,
    /// Exact hostnames (lowercase)
    pub hostnames: HashSet<&'static str>,
    /// Internal-sounding domain suffixes (lowercase, leading dot)
    pub host_suffixes: Vec<&'static str>,
    /// DNS rebinding services that resolve arbitrary names to caller-chosen IPs
    pub rebind_domains: Vec<&'static str>,
    /// Ports of databases, management planes, and internal middleware
    pub ports: HashSet<u16>,
}

impl Blocklist {
    pub fn builtin() -> Self {
        Self {
            nets_v4: BLOCKED_NETS_V4
                .iter()
                .map(|n| n.parse().expect("builtin v4 net"))
                .collect(),
            nets_v6: BLOCKED_NETS_V6
                .iter()
                .map(|n| n.parse().expect("builtin v6 net"))
                .collect(),
            hostnames: BLOCKED_HOSTNAMES.iter().copied().collect(),
            host_suffixes: BLOCKED_HOST_SUFFIXES.to_vec(),
            rebind_domains: REBIND_DOMAINS.to_vec(),
            ports: BLOCKED_PORTS.iter().copied().collect(),
        }
    }
}

/// Loopback, RFC 1918, link-local, CGNAT, unspecified, multicast/reserved
const BLOCKED_NETS_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/3",
];

const BLOCKED_NETS_V6: &[&str] = &["::/128", "::1/128", "fc00::/7", "fe80::/10", "ff00::/8"];

/// Blocked hostnames (case-insensitive)
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata.google.internal", // GCP metadata
    "metadata.google.com",      // GCP metadata alt
    "instance-data",            // AWS metadata hostname
];

const BLOCKED_HOST_SUFFIXES: &[&str] = &[".local", ".internal", ".localhost", ".localdomain"];

/// Wildcard DNS services commonly used to dodge hostname blocklists
const REBIND_DOMAINS: &[&str] = &["nip.io", "sslip.io", "xip.io", "lvh.me", "localtest.me"];

/// Sensitive service ports: mail, DNS, RPC and management planes,
/// databases, container daemons, message brokers, internal middleware.
const BLOCKED_PORTS: &[u16] = &[
    1, 7, 9, 11, 13, 15, 17, 19, 20, 21, 22, 23, 25, 37, 42, 43, 53, 69, 77, 79, 87, 95, 101, 102,
    103, 104, 109, 110, 111, 113, 115, 117, 119, 123, 135, 137, 138, 139, 143, 161, 162, 179, 389,
    427, 445, 465, 512, 513, 514, 515, 526, 530, 531, 532, 540, 548, 554, 556, 563, 587, 601, 636,
    873, 990, 993, 995, 1433, 1521, 2049, 2181, 2375, 2376, 2379, 2380, 3128, 3306, 3389, 4369,
    4444, 5432, 5672, 5900, 5984, 6379, 6667, 7001, 8020, 8086, 9042, 9092, 9200, 9300, 11211,
    15672, 27017, 27018, 50070,
];
