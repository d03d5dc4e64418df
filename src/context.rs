use std::sync::Arc;
use std::time::Duration;

use crate::ban_log::DurableLog;
use crate::ban_store::BanStore;
use crate::cache::TtlCache;
use crate::challenge::CsrfGuard;
use crate::config::DetectionConfig;
use crate::exemption::{ExemptionEvaluator, WebhookPredicate};
use crate::fingerprint::FingerprintRecorder;
use crate::geo::{normalize_country, GeoProvider, GeoResolver};
use crate::honeypot::Honeypot;
use crate::js_check::JsCheck;
use crate::keyed_hash::KeyedHasher;
use crate::rate_limit::RateLimiter;

/// Store handles plus the settings snapshot, shared by every stage.
///
/// Built once at startup and passed explicitly; nothing in the trap reads global state.
pub struct TrapContext {
    pub settings: DetectionConfig,
    pub bans: BanStore,
    pub rate: RateLimiter,
    pub fingerprints: FingerprintRecorder,
    pub exemptions: ExemptionEvaluator,
    pub honeypot: Honeypot,
    pub js: JsCheck,
    pub geo: GeoResolver,
    pub csrf: CsrfGuard,
    gated_countries: Vec<String>,
    cache: Arc<dyn TtlCache>,
}

impl TrapContext {
    pub fn new(
        settings: DetectionConfig,
        cache: Arc<dyn TtlCache>,
        log: Arc<dyn DurableLog>,
        geo_providers: Vec<Arc<dyn GeoProvider>>,
    ) -> Self {
        let hasher = Arc::new(KeyedHasher::new(&settings.secret));
        let gated_countries = settings
            .geo_gated_countries
            .iter()
            .filter_map(|code| normalize_country(code))
            .collect();

        Self {
            bans: BanStore::new(cache.clone(), log.clone(), &settings),
            rate: RateLimiter::new(cache.clone(), settings.rate_per_minute),
            fingerprints: FingerprintRecorder::new(log),
            exemptions: ExemptionEvaluator::new(&settings),
            honeypot: Honeypot::new(&settings.honeypot_path_segment),
            js: JsCheck::new(&settings, hasher.clone()),
            geo: GeoResolver::new(
                cache.clone(),
                geo_providers,
                Duration::from_secs(settings.geo_timeout_secs),
            ),
            csrf: CsrfGuard::new(hasher),
            gated_countries,
            cache,
            settings,
        }
    }

    /// Install a host-specific webhook recognizer
    pub fn with_webhook_predicate(mut self, predicate: WebhookPredicate) -> Self {
        self.exemptions = self.exemptions.with_webhook_predicate(predicate);
        self
    }

    pub fn cache(&self) -> &Arc<dyn TtlCache> {
        &self.cache
    }

    pub fn is_gated_country(&self, country: &str) -> bool {
        let country = country.trim().to_ascii_uppercase();
        self.gated_countries.iter().any(|gated| *gated == country)
    }
}
