use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::honeypot::sanitize_segment;
use crate::ip_extraction::IpExtractionConfig;

/// Trap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// What the server does when a backing store fails mid-request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through to the upstream
    Open,
    /// Answer 503
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Origin that allowed requests are proxied to
    pub upstream: String,
    /// Header set by a fronting auth layer for signed-in visitors. Requests carrying
    /// a non-empty value are treated as authenticated and skip every check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated_header: Option<String>,
    pub fail_mode: FailMode,
    /// Largest challenge submission body read, in bytes
    pub max_form_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            upstream: "http://127.0.0.1:8081".to_string(),
            authenticated_header: None,
            fail_mode: FailMode::Open,
            max_form_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_backend: CacheBackend,
    pub redis_url: String,
    /// SQLite database for the ban log; `:memory:` keeps it in process
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            sqlite_path: "stealth-trap.db".to_string(),
        }
    }
}

/// How a blocked visitor is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Minimal denial page
    Static,
    /// Arithmetic challenge that lets the visitor unlock themselves
    Challenge,
}

/// Detection settings. Read-only once the trap is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub ban_hours: u64,
    pub rate_per_minute: u64,
    /// Log would-be bans without enforcing them
    pub test_mode: bool,
    pub enable_js_check: bool,
    pub enable_rate_limit: bool,
    pub enable_honeypot: bool,
    pub enable_outdated_browser_check: bool,
    pub block_mode: BlockMode,
    /// User-Agent substrings that skip the JS check
    pub whitelisted_browsers: Vec<String>,
    pub enable_geo_challenge: bool,
    /// ISO alpha-2 codes that must pass the challenge
    pub geo_gated_countries: Vec<String>,
    pub geo_ban_on_unknown: bool,
    pub geo_timeout_secs: u64,
    pub honeypot_path_segment: String,
    /// Exact IPs or CIDR ranges, one per line; `#` starts a comment
    pub ip_whitelist: String,
    /// Crawler tokens exempted in addition to the built-in list
    pub whitelisted_bot_tokens: Vec<String>,
    /// Path fragments that mark a POST as a payment webhook
    pub webhook_path_allowlist: Vec<String>,
    pub js_cookie_name: String,
    pub js_protected_marker: String,
    pub js_exempt_segment: String,
    /// Key for the JS cookie and CSRF tokens. Defaults to a random per-process key, so
    /// set it explicitly to keep tokens valid across restarts and nodes.
    pub secret: String,
}

pub const DEFAULT_IP_WHITELIST: &str = "# PayPal webhook and IPN ranges
64.4.240.0/21
64.4.248.0/22
66.211.168.0/22
91.243.72.0/23
173.0.80.0/20
185.177.52.0/22
192.160.215.0/24
198.54.216.0/23

# Stripe webhook IPs (these can change; verify signatures upstream)
54.187.174.169
54.187.205.235
54.187.216.72
";

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ban_hours: 6,
            rate_per_minute: 80,
            test_mode: false,
            enable_js_check: true,
            enable_rate_limit: true,
            enable_honeypot: true,
            enable_outdated_browser_check: true,
            block_mode: BlockMode::Static,
            whitelisted_browsers: vec!["brave".to_string(), "firefox".to_string()],
            enable_geo_challenge: false,
            geo_gated_countries: Vec::new(),
            geo_ban_on_unknown: true,
            geo_timeout_secs: 3,
            honeypot_path_segment: "bot-trap".to_string(),
            ip_whitelist: DEFAULT_IP_WHITELIST.to_string(),
            whitelisted_bot_tokens: Vec::new(),
            webhook_path_allowlist: vec![
                "/wc-api/wc_gateway_paypal".to_string(),
                "/wc-api/wc_stripe".to_string(),
                "/wp-json/wc-stripe/".to_string(),
                "/wp-json/paypal/".to_string(),
            ],
            js_cookie_name: "st_verified".to_string(),
            js_protected_marker: "/wp-json/".to_string(),
            js_exempt_segment: "/wp/v2/".to_string(),
            secret: generate_secret(),
        }
    }
}

/// Shortest accepted `secret`
pub const MIN_SECRET_LEN: usize = 16;

/// Well-known placeholders that must never key production tokens
const PLACEHOLDER_SECRETS: &[&str] = &["change-me", "changeme", "secret", "default"];

/// 32 random bytes, hex encoded
pub fn generate_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

impl DetectionConfig {
    pub fn ban_secs(&self) -> u64 {
        self.ban_hours * 3_600
    }

    /// Geo gate applies only in challenge mode with at least one gated country
    pub fn geo_gate_active(&self) -> bool {
        self.block_mode == BlockMode::Challenge
            && self.enable_geo_challenge
            && !self.geo_gated_countries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between durable-log sweeps
    pub sweep_interval_secs: u64,
    /// Interval between TTL cache GC passes
    pub cache_gc_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 12 * 3_600,
            cache_gc_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Bearer token required on `/__trap/admin/*`
    pub token: String,
    pub page_size: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            page_size: 20,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let detection = &self.detection;

        if detection.ban_hours == 0 {
            anyhow::bail!("Invalid ban_hours: must be > 0");
        }

        if detection.rate_per_minute == 0 {
            anyhow::bail!("Invalid rate_per_minute: must be > 0");
        }

        if detection.geo_timeout_secs == 0 {
            anyhow::bail!("Invalid geo_timeout_secs: must be > 0");
        }

        if sanitize_segment(&detection.honeypot_path_segment).is_empty() {
            anyhow::bail!(
                "Invalid honeypot_path_segment '{}': empty after sanitizing",
                detection.honeypot_path_segment
            );
        }

        for code in &detection.geo_gated_countries {
            let code = code.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                anyhow::bail!("Invalid country code '{}': expected two letters", code);
            }
        }

        let secret = detection.secret.trim();
        if PLACEHOLDER_SECRETS
            .iter()
            .any(|placeholder| secret.eq_ignore_ascii_case(placeholder))
        {
            anyhow::bail!("Invalid secret: placeholder value, generate a random key");
        }
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!("Invalid secret: must be at least {} characters", MIN_SECRET_LEN);
        }

        if detection.js_cookie_name.is_empty()
            || detection
                .js_cookie_name
                .chars()
                .any(|c| c.is_whitespace() || c == '=' || c == ';')
        {
            anyhow::bail!("Invalid js_cookie_name '{}'", detection.js_cookie_name);
        }

        if self.admin.enabled && self.admin.token.is_empty() {
            anyhow::bail!("Admin API enabled without a token");
        }

        if self.maintenance.sweep_interval_secs == 0 || self.maintenance.cache_gc_interval_secs == 0
        {
            anyhow::bail!("Maintenance intervals must be > 0");
        }

        Ok(())
    }
}
