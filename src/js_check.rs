use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::DetectionConfig;
use crate::keyed_hash::KeyedHasher;
use crate::request::RequestInfo;

/// Proof that the visitor ran the cookie-setting script during the current UTC hour
pub struct JsCheck {
    hasher: Arc<KeyedHasher>,
    cookie_name: String,
    protected_marker: String,
    exempt_segment: String,
    whitelisted_browsers: Vec<String>,
}

/// Hour bucket the cookie is bound to, e.g. `2024-06-01 13`
pub fn hour_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H").to_string()
}

impl JsCheck {
    pub fn new(config: &DetectionConfig, hasher: Arc<KeyedHasher>) -> Self {
        Self {
            hasher,
            cookie_name: config.js_cookie_name.clone(),
            protected_marker: config.js_protected_marker.clone(),
            exempt_segment: config.js_exempt_segment.clone(),
            whitelisted_browsers: config
                .whitelisted_browsers
                .iter()
                .map(|b| b.trim().to_lowercase())
                .filter(|b| !b.is_empty())
                .collect(),
        }
    }

    /// Only API paths under the protected marker are checked
    pub fn applies_to(&self, uri: &str) -> bool {
        uri.contains(self.protected_marker.as_str())
            && (self.exempt_segment.is_empty() || !uri.contains(self.exempt_segment.as_str()))
    }

    pub fn is_whitelisted_browser(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.whitelisted_browsers
            .iter()
            .any(|browser| ua.contains(browser.as_str()))
    }

    pub fn expected_cookie(&self, now: DateTime<Utc>) -> String {
        self.hasher.hex(&["js", &hour_bucket(now)])
    }

    pub fn has_valid_cookie(&self, req: &RequestInfo, now: DateTime<Utc>) -> bool {
        match req.cookie(&self.cookie_name) {
            Some(value) => self.hasher.verify_hex(&["js", &hour_bucket(now)], value),
            None => false,
        }
    }

    /// True when this request must be banned for lacking the cookie
    pub fn is_violation(&self, req: &RequestInfo, now: DateTime<Utc>) -> bool {
        self.applies_to(&req.uri)
            && !self.is_whitelisted_browser(req.user_agent())
            && !self.has_valid_cookie(req, now)
    }

    /// Script that sets the verification cookie for one hour
    pub fn script_html(&self, now: DateTime<Utc>) -> String {
        format!(
            "<script>document.cookie=\"{}={}; path=/; max-age=3600; SameSite=Lax\";</script>",
            self.cookie_name,
            self.expected_cookie(now)
        )
    }
}
