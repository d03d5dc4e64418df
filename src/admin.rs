//! Admin HTTP API
//!
//! JSON endpoints for inspecting and lifting bans, behind a bearer token:
//! - `GET    /__trap/admin/bans?page=N`  active bans, newest first
//! - `GET    /__trap/admin/count`        number of active bans
//! - `DELETE /__trap/admin/bans/{ip}`    unban one IP
//! - `POST   /__trap/admin/unblock-all`  lift every active ban
//! - `POST   /__trap/admin/clear-logs`   truncate bans and fingerprints
//! - `GET    /__trap/admin/stats`        ban statistics
//! - `GET    /__trap/admin/preview?mode=static|rate_limit|challenge`  render a block page

use anyhow::Result;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::ban_log::unix_now;
use crate::block_page::{html_response, BlockPage};
use crate::challenge::{Challenge, SOLVE_ACTION};
use crate::context::TrapContext;

pub const ADMIN_PREFIX: &str = "/__trap/admin/";

/// Standard API response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
        }
    }
}

fn query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

pub struct AdminApi {
    ctx: Arc<TrapContext>,
    token: String,
    page_size: u32,
}

impl AdminApi {
    pub fn new(ctx: Arc<TrapContext>, token: &str, page_size: u32) -> Self {
        Self {
            ctx,
            token: token.to_string(),
            page_size: page_size.max(1),
        }
    }

    pub fn handles(path: &str) -> bool {
        path.starts_with(ADMIN_PREFIX)
    }

    fn is_authorized(&self, header: Option<&HeaderValue>) -> bool {
        if self.token.is_empty() {
            return false;
        }
        let Some(presented) = header
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        presented.trim().as_bytes().ct_eq(self.token.as_bytes()).into()
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let method = req.method().clone();

        if !self.is_authorized(req.headers().get(AUTHORIZATION)) {
            warn!("Rejected unauthorized admin request: {} {}", method, path);
            return self.error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }

        debug!("Admin request: {} {}", method, path);
        let route = path.trim_start_matches(ADMIN_PREFIX);

        match (method, route) {
            (Method::GET, "bans") => self.handle_list(&query),
            (Method::GET, "count") => self.handle_count(),
            (Method::DELETE, r) if r.starts_with("bans/") => {
                self.handle_remove(r.trim_start_matches("bans/")).await
            }
            (Method::POST, "unblock-all") => self.handle_unblock_all().await,
            (Method::POST, "clear-logs") => self.handle_clear_logs().await,
            (Method::GET, "stats") => self.handle_stats(),
            (Method::GET, "preview") => Ok(self.handle_preview(&query)),
            _ => self.error_response(StatusCode::NOT_FOUND, "Endpoint not found"),
        }
    }

    fn handle_list(&self, query: &str) -> Result<Response<Body>> {
        let page: u32 = query_params(query)
            .get("page")
            .and_then(|p| p.parse().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let offset = (page - 1).saturating_mul(self.page_size);

        let bans = self.ctx.bans.list_active(self.page_size, offset)?;
        let total = self.ctx.bans.count_active()?;

        self.json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({
                "total": total,
                "page": page,
                "page_size": self.page_size,
                "bans": bans,
            })),
        )
    }

    fn handle_count(&self) -> Result<Response<Body>> {
        let total = self.ctx.bans.count_active()?;
        self.json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({ "active_bans": total })),
        )
    }

    async fn handle_remove(&self, raw_ip: &str) -> Result<Response<Body>> {
        let Ok(ip) = raw_ip.parse::<IpAddr>() else {
            return self.error_response(StatusCode::BAD_REQUEST, "Invalid IP address");
        };

        let ip = ip.to_string();
        self.ctx.bans.unban(&ip).await?;
        info!("Admin removed ban for {}", ip);
        self.json_response(
            StatusCode::OK,
            &ApiResponse::success_message(&format!("IP {} unbanned", ip)),
        )
    }

    async fn handle_unblock_all(&self) -> Result<Response<Body>> {
        let released = self.ctx.bans.unblock_all().await?;
        self.json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({ "released": released })),
        )
    }

    async fn handle_clear_logs(&self) -> Result<Response<Body>> {
        let released = self.ctx.bans.clear_logs().await?;
        self.json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({ "released": released })),
        )
    }

    fn handle_stats(&self) -> Result<Response<Body>> {
        let stats = self.ctx.bans.stats()?;
        self.json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::to_value(&stats)?),
        )
    }

    /// Renders without storing a challenge or touching any ban
    fn handle_preview(&self, query: &str) -> Response<Body> {
        let page = match query_params(query).get("mode").map(String::as_str) {
            Some("challenge") => BlockPage::Challenge {
                question: Challenge::random().question,
                csrf_token: self.ctx.csrf.token("preview", SOLVE_ACTION, unix_now()),
            },
            Some("rate_limit") => BlockPage::TooManyRequests,
            _ => BlockPage::AccessDenied,
        };
        html_response(StatusCode::OK, page.render())
    }

    fn json_response(&self, status: StatusCode, body: &ApiResponse) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_string_pretty(body)?))?)
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Body>> {
        self.json_response(status, &ApiResponse::error(message))
    }
}
