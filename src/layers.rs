//! Detection stages. Each one inspects the request and either passes it on, lets it
//! through outright, or bans the IP and blocks.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::ban_log::unix_now;
use crate::browser::{browser_label, is_outdated};
use crate::context::TrapContext;
use crate::error::TrapResult;
use crate::exemption::ExemptReason;
use crate::geo::UNKNOWN_COUNTRY;
use crate::rate_limit::RateLimiter;
use crate::request::RequestInfo;

/// How a blocked request is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// 403
    Banned,
    /// 429
    RateLimited,
    /// 403 with the challenge form regardless of block mode
    Challenge,
}

/// Why a stage let a request through without running the rest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    Exempt(ExemptReason),
    /// First request after solving a challenge
    Grace,
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Allow(AllowReason),
    Block { kind: BlockKind, reason: String },
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision>;
}

/// Ban the client and produce the matching block decision
async fn ban_and_block(
    ctx: &TrapContext,
    req: &RequestInfo,
    kind: BlockKind,
    reason: String,
) -> TrapResult<Decision> {
    ctx.bans.ban(&req.ip, &reason).await?;
    Ok(Decision::Block { kind, reason })
}

/// Authenticated visitors, known crawlers, webhooks and whitelisted IPs skip everything
pub struct ExemptionStage;

#[async_trait]
impl Stage for ExemptionStage {
    fn name(&self) -> &'static str {
        "exemption"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        Ok(match ctx.exemptions.evaluate(req) {
            Some(reason) => Decision::Allow(AllowReason::Exempt(reason)),
            None => Decision::Continue,
        })
    }
}

/// Grace pass, outdated browsers, then existing bans
pub struct BanCheckStage;

#[async_trait]
impl Stage for BanCheckStage {
    fn name(&self) -> &'static str {
        "ban_check"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        if ctx.bans.take_grace(&req.ip).await? {
            debug!("Allowing {} through on grace after solved challenge", req.ip);
            return Ok(Decision::Allow(AllowReason::Grace));
        }

        if ctx.settings.enable_outdated_browser_check && is_outdated(req.user_agent()) {
            let label = browser_label(req.user_agent.as_deref(), req.sec_ch_ua.as_deref());
            let reason = format!("Outdated browser detected ({})", label);
            return ban_and_block(ctx, req, BlockKind::Banned, reason).await;
        }

        if ctx.bans.is_banned(&req.ip).await? {
            return Ok(Decision::Block {
                kind: BlockKind::Banned,
                reason: "Active ban".to_string(),
            });
        }

        Ok(Decision::Continue)
    }
}

pub struct HoneypotStage;

#[async_trait]
impl Stage for HoneypotStage {
    fn name(&self) -> &'static str {
        "honeypot"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        if !ctx.settings.enable_honeypot || !ctx.honeypot.is_triggered(&req.uri) {
            return Ok(Decision::Continue);
        }
        ban_and_block(ctx, req, BlockKind::Banned, ctx.honeypot.ban_reason()).await
    }
}

/// Counts the request, records its fingerprint and bans past the per-minute limit
pub struct RateLimitStage;

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        if !ctx.settings.enable_rate_limit {
            return Ok(Decision::Continue);
        }

        let count = ctx.rate.increment(&req.ip).await?;

        // Forensics only: a failed write never changes the decision
        if let Err(e) = ctx.fingerprints.record(req, &count.to_string(), unix_now()) {
            warn!("Failed to record fingerprint for {}: {}", req.ip, e);
        }

        if ctx.rate.is_exceeded(count) {
            let reason = RateLimiter::ban_reason(count);
            return ban_and_block(ctx, req, BlockKind::RateLimited, reason).await;
        }

        Ok(Decision::Continue)
    }
}

/// API paths require the hourly verification cookie
pub struct JsCapabilityStage;

#[async_trait]
impl Stage for JsCapabilityStage {
    fn name(&self) -> &'static str {
        "js_capability"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        if !ctx.settings.enable_js_check || !ctx.js.is_violation(req, Utc::now()) {
            return Ok(Decision::Continue);
        }

        let label = browser_label(req.user_agent.as_deref(), req.sec_ch_ua.as_deref());
        let reason = format!("No valid JS verification ({})", label);
        ban_and_block(ctx, req, BlockKind::Banned, reason).await
    }
}

/// Visitors from gated countries must solve the challenge. Runs last: it is the only
/// stage that may call out to the network.
pub struct GeoChallengeStage;

#[async_trait]
impl Stage for GeoChallengeStage {
    fn name(&self) -> &'static str {
        "geo_challenge"
    }

    async fn evaluate(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Decision> {
        if !ctx.settings.geo_gate_active() {
            return Ok(Decision::Continue);
        }

        if ctx.bans.has_geo_pass(&req.ip).await? {
            debug!("Geo gate skipped for {}: challenge already passed", req.ip);
            return Ok(Decision::Continue);
        }

        if ctx.bans.is_banned(&req.ip).await? {
            return Ok(Decision::Continue);
        }

        let country = ctx.geo.resolve(&req.ip).await;
        let gated = ctx.is_gated_country(&country)
            || (country == UNKNOWN_COUNTRY && ctx.settings.geo_ban_on_unknown);

        if !gated {
            return Ok(Decision::Continue);
        }

        let reason = format!("Geo-based challenge required (Country: {})", country);
        ban_and_block(ctx, req, BlockKind::Challenge, reason).await
    }
}

/// Stages in evaluation order
pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(ExemptionStage),
        Box::new(BanCheckStage),
        Box::new(HoneypotStage),
        Box::new(RateLimitStage),
        Box::new(JsCapabilityStage),
        Box::new(GeoChallengeStage),
    ]
}
