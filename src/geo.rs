//! IP-to-country resolution through a chain of external providers, with results
//! cached so each IP costs at most one lookup per day.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{cache_key, get_or_none, TtlCache};

/// Sentinel cached when no provider could resolve the IP
pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

const COUNTRY_TTL: Duration = Duration::from_secs(24 * 3_600);
const UNKNOWN_TTL: Duration = Duration::from_secs(30 * 60);

const USER_AGENT: &str = concat!("stealth-trap/", env!("CARGO_PKG_VERSION"));

/// One external geolocation source
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// ISO alpha-2 code, or `None` on any failure
    async fn country_code(&self, ip: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct CountryResponse {
    country_code: Option<String>,
}

/// Provider answering `GET <url>` with a JSON body containing `country_code`
pub struct JsonCountryProvider {
    name: String,
    /// URL with `{ip}` placeholder
    url_template: String,
    client: reqwest::Client,
}

impl JsonCountryProvider {
    pub fn new(name: &str, url_template: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            client,
        })
    }

    /// ipapi.co, free tier without a key
    pub fn ipapi_co(timeout: Duration) -> reqwest::Result<Self> {
        Self::new("ipapi.co", "https://ipapi.co/{ip}/json/", timeout)
    }

    /// ip2location.io with the public demo key
    pub fn ip2location(timeout: Duration) -> reqwest::Result<Self> {
        Self::new("ip2location.io", "https://ip2location.io/?ip={ip}&key=demo", timeout)
    }
}

#[async_trait]
impl GeoProvider for JsonCountryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn country_code(&self, ip: &str) -> Option<String> {
        let url = self.url_template.replace("{ip}", ip);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Geo provider {} failed for {}: {}", self.name, ip, e);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(
                "Geo provider {} returned {} for {}",
                self.name,
                response.status(),
                ip
            );
            return None;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Geo provider {} body read failed for {}: {}", self.name, ip, e);
                return None;
            }
        };

        match serde_json::from_slice::<CountryResponse>(&bytes) {
            Ok(body) => body.country_code.and_then(|code| normalize_country(&code)),
            Err(e) => {
                debug!("Geo provider {} sent unreadable body for {}: {}", self.name, ip, e);
                None
            }
        }
    }
}

/// Uppercase two-letter code, or `None` for anything else
pub fn normalize_country(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Cache-first resolver walking the provider chain in order
pub struct GeoResolver {
    cache: Arc<dyn TtlCache>,
    providers: Vec<Arc<dyn GeoProvider>>,
    timeout: Duration,
}

impl GeoResolver {
    pub fn new(
        cache: Arc<dyn TtlCache>,
        providers: Vec<Arc<dyn GeoProvider>>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            providers,
            timeout,
        }
    }

    /// Country for the IP, `UNKNOWN` when every provider fails. Never errors.
    pub async fn resolve(&self, ip: &str) -> String {
        let key = cache_key("geo", ip);

        if let Some(cached) = get_or_none(self.cache.as_ref(), &key).await {
            if let Ok(country) = String::from_utf8(cached) {
                debug!("Using cached country for {}: {}", ip, country);
                return country;
            }
        }

        for provider in &self.providers {
            match tokio::time::timeout(self.timeout, provider.country_code(ip)).await {
                Ok(Some(country)) => {
                    debug!("Resolved {} to {} via {}", ip, country, provider.name());
                    self.store(&key, &country, COUNTRY_TTL).await;
                    return country;
                }
                Ok(None) => {}
                Err(_) => warn!("Geo provider {} timed out for {}", provider.name(), ip),
            }
        }

        warn!("All geo providers failed for {}", ip);
        self.store(&key, UNKNOWN_COUNTRY, UNKNOWN_TTL).await;
        UNKNOWN_COUNTRY.to_string()
    }

    async fn store(&self, key: &str, country: &str, ttl: Duration) {
        if let Err(e) = self.cache.set(key, country.as_bytes(), ttl).await {
            warn!("Failed to cache country for {}: {}", key, e);
        }
    }
}
