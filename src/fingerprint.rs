use std::sync::Arc;
use tracing::debug;

use crate::ban_log::DurableLog;
use crate::error::TrapResult;
use crate::request::RequestInfo;

/// Fallback stored when the request carried no User-Agent
const UNKNOWN_USER_AGENT: &str = "unknown";

/// Longest User-Agent kept in the fingerprint table
const MAX_USER_AGENT_LEN: usize = 500;

/// Hash identifying a request's shape: ip + method + uri + auxiliary datum
pub fn request_fingerprint(req: &RequestInfo, extra: &str) -> String {
    let input = format!("{}{}{}{}", req.ip, req.method, req.uri, extra);
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Counts per-IP request shapes for forensics. Never influences a decision.
pub struct FingerprintRecorder {
    log: Arc<dyn DurableLog>,
}

impl FingerprintRecorder {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    pub fn record(&self, req: &RequestInfo, extra: &str, now: i64) -> TrapResult<String> {
        let fingerprint = request_fingerprint(req, extra);
        let user_agent: String = req
            .user_agent
            .as_deref()
            .unwrap_or(UNKNOWN_USER_AGENT)
            .chars()
            .take(MAX_USER_AGENT_LEN)
            .collect();

        self.log
            .upsert_fingerprint(&req.ip, &fingerprint, &user_agent, now)?;
        debug!("Recorded fingerprint {} for {}", fingerprint, req.ip);
        Ok(fingerprint)
    }
}
