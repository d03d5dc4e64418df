use hyper::Method;
use std::fmt;
use std::sync::Arc;

use crate::cidr::IpRangeList;
use crate::config::DetectionConfig;
use crate::request::RequestInfo;

/// Crawlers that are never checked
pub const KNOWN_BOT_TOKENS: &[&str] = &[
    "googlebot",
    "bingbot",
    "yandexbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "sogou",
    "exabot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "whatsapp",
];

/// Host-supplied webhook recognizer
pub type WebhookPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Why a request bypassed every detection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExemptReason {
    Authenticated,
    KnownBot,
    Webhook,
    WhitelistedIp,
}

impl fmt::Display for ExemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExemptReason::Authenticated => "authenticated",
            ExemptReason::KnownBot => "known bot",
            ExemptReason::Webhook => "webhook",
            ExemptReason::WhitelistedIp => "whitelisted ip",
        };
        f.write_str(label)
    }
}

/// Decides whether a request skips detection entirely. Has no side effects.
pub struct ExemptionEvaluator {
    bot_tokens: Vec<String>,
    webhook_fragments: Vec<String>,
    webhook_predicate: Option<WebhookPredicate>,
    ip_whitelist: IpRangeList,
}

impl ExemptionEvaluator {
    pub fn new(config: &DetectionConfig) -> Self {
        let bot_tokens = KNOWN_BOT_TOKENS
            .iter()
            .map(|token| token.to_string())
            .chain(config.whitelisted_bot_tokens.iter().map(|t| t.trim().to_lowercase()))
            .filter(|token| !token.is_empty())
            .collect();

        Self {
            bot_tokens,
            webhook_fragments: config
                .webhook_path_allowlist
                .iter()
                .filter(|fragment| !fragment.is_empty())
                .cloned()
                .collect(),
            webhook_predicate: None,
            ip_whitelist: IpRangeList::parse_lines(&config.ip_whitelist),
        }
    }

    /// Add a custom webhook recognizer, consulted after the path allowlist
    pub fn with_webhook_predicate(mut self, predicate: WebhookPredicate) -> Self {
        self.webhook_predicate = Some(predicate);
        self
    }

    pub fn evaluate(&self, req: &RequestInfo) -> Option<ExemptReason> {
        if req.authenticated {
            return Some(ExemptReason::Authenticated);
        }
        if self.is_known_bot(req.user_agent()) {
            return Some(ExemptReason::KnownBot);
        }
        if self.is_webhook(req) {
            return Some(ExemptReason::Webhook);
        }
        if self.ip_whitelist.contains(&req.ip) {
            return Some(ExemptReason::WhitelistedIp);
        }
        None
    }

    pub fn is_exempt(&self, req: &RequestInfo) -> bool {
        self.evaluate(req).is_some()
    }

    /// Case-insensitive crawler token match on the User-Agent
    pub fn is_known_bot(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.bot_tokens.iter().any(|token| ua.contains(token.as_str()))
    }

    fn is_webhook(&self, req: &RequestInfo) -> bool {
        if req.method == Method::POST
            && self
                .webhook_fragments
                .iter()
                .any(|fragment| req.uri.contains(fragment.as_str()))
        {
            return true;
        }

        self.webhook_predicate
            .as_ref()
            .map(|predicate| predicate(req))
            .unwrap_or(false)
    }
}
