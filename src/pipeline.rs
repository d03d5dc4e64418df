use hyper::StatusCode;
use tracing::{debug, info};

use crate::context::TrapContext;
use crate::error::TrapResult;
use crate::layers::{standard_stages, BlockKind, Decision, Stage};
use crate::request::RequestInfo;

/// Final answer for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { kind: BlockKind, reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl BlockKind {
    pub fn status(&self) -> StatusCode {
        match self {
            BlockKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BlockKind::Banned | BlockKind::Challenge => StatusCode::FORBIDDEN,
        }
    }
}

/// Ordered detection stages. The first stage to allow or block ends evaluation.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    test_mode: bool,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>, test_mode: bool) -> Self {
        Self { stages, test_mode }
    }

    /// Exemption, ban check, honeypot, rate limit, JS capability, geo gate
    pub fn standard(test_mode: bool) -> Self {
        Self::new(standard_stages(), test_mode)
    }

    pub async fn run(&self, req: &RequestInfo, ctx: &TrapContext) -> TrapResult<Verdict> {
        for stage in &self.stages {
            match stage.evaluate(req, ctx).await? {
                Decision::Continue => continue,
                Decision::Allow(reason) => {
                    debug!("{} allowed {} ({:?})", stage.name(), req.ip, reason);
                    return Ok(Verdict::Allow);
                }
                Decision::Block { kind, reason } => {
                    if self.test_mode {
                        info!(
                            "[TEST MODE] {} would block {} {}: {}",
                            stage.name(),
                            req.ip,
                            req.uri,
                            reason
                        );
                        return Ok(Verdict::Allow);
                    }
                    info!("{} blocked {} {}: {}", stage.name(), req.ip, req.uri, reason);
                    return Ok(Verdict::Block { kind, reason });
                }
            }
        }
        Ok(Verdict::Allow)
    }
}
