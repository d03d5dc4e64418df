//! HTTP front: classifies each request, answers blocked ones itself and proxies the
//! rest to the upstream origin.

use chrono::Utc;
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    LOCATION, USER_AGENT,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode, Uri};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admin::AdminApi;
use crate::ban_log::unix_now;
use crate::block_page::{html_response, inject_before_body_close, set_no_cache, BlockPage};
use crate::body::{form_field, read_body_limited};
use crate::challenge::{submit_answer, SOLVE_ACTION};
use crate::config::{BlockMode, Config, FailMode};
use crate::context::TrapContext;
use crate::ip_extraction::{ClientIpStrategy, ProxyHeaderStrategy};
use crate::layers::BlockKind;
use crate::pipeline::{Pipeline, Verdict};
use crate::request::RequestInfo;

pub const HEALTH_PATH: &str = "/__trap/health";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub struct TrapServer {
    ctx: Arc<TrapContext>,
    pipeline: Pipeline,
    ip_strategy: Box<dyn ClientIpStrategy>,
    admin: Option<AdminApi>,
    client: Client<HttpConnector>,
    upstream: String,
    authenticated_header: Option<String>,
    fail_mode: FailMode,
    max_form_bytes: usize,
}

impl TrapServer {
    pub fn new(config: &Config, ctx: Arc<TrapContext>) -> Self {
        let admin = config
            .admin
            .enabled
            .then(|| AdminApi::new(ctx.clone(), &config.admin.token, config.admin.page_size));

        Self {
            pipeline: Pipeline::standard(ctx.settings.test_mode),
            ip_strategy: Box::new(ProxyHeaderStrategy::new(config.ip_extraction.clone())),
            admin,
            client: Client::new(),
            upstream: config.server.upstream.trim_end_matches('/').to_string(),
            authenticated_header: config
                .server
                .authenticated_header
                .clone()
                .filter(|h| !h.trim().is_empty()),
            fail_mode: config.server.fail_mode,
            max_form_bytes: config.server.max_form_bytes,
            ctx,
        }
    }

    /// Replace how the client IP is derived from the connection
    pub fn with_ip_strategy(mut self, strategy: Box<dyn ClientIpStrategy>) -> Self {
        self.ip_strategy = strategy;
        self
    }

    pub fn context(&self) -> &Arc<TrapContext> {
        &self.ctx
    }

    /// Serve until the shutdown future resolves
    pub async fn run_until<F>(self: Arc<Self>, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting stealth trap on {}", addr);
        info!("Proxying allowed requests to: {}", self.upstream);

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let server = self.clone();
            let remote_addr = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, remote_addr).await) }
                }))
            }
        });

        Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == HEALTH_PATH {
            return self.handle_health().await;
        }

        if AdminApi::handles(&path) {
            if let Some(admin) = &self.admin {
                return match admin.handle_request(req).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("Admin request failed: {}", e);
                        plain_response(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
                    }
                };
            }
        }

        let info = self.request_info(&req, remote_addr);

        let req = if method == Method::POST {
            match self.take_challenge_submission(req, &info).await {
                Submission::Handled(response) => return response,
                Submission::NotASubmission(req) => req,
            }
        } else {
            req
        };

        let response = match self.pipeline.run(&info, &self.ctx).await {
            Ok(Verdict::Allow) => self.proxy(req, &info).await,
            Ok(Verdict::Block { kind, reason }) => {
                debug!("Serving block page to {}: {}", info.ip, reason);
                self.block_response(&info, kind).await
            }
            Err(e) => {
                error!("Detection failed for {} {}: {}", info.ip, info.uri, e);
                match self.fail_mode {
                    FailMode::Open => self.proxy(req, &info).await,
                    FailMode::Closed => {
                        plain_response(StatusCode::SERVICE_UNAVAILABLE, "503 Service Unavailable")
                    }
                }
            }
        };

        info!(
            "{} {} {} {} {}ms",
            info.ip,
            method,
            path,
            response.status().as_u16(),
            start_time.elapsed().as_millis()
        );
        response
    }

    fn request_info(&self, req: &Request<Body>, remote_addr: SocketAddr) -> RequestInfo {
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let ip = self
            .ip_strategy
            .client_ip(&remote_addr.ip().to_string(), &headers);
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let authenticated = self
            .authenticated_header
            .as_deref()
            .and_then(|name| header(name))
            .map_or(false, |v| !v.trim().is_empty());

        let mut info = RequestInfo::new(ip, req.method().clone(), uri).authenticated(authenticated);
        info.user_agent = header(USER_AGENT.as_str());
        info.sec_ch_ua = header("sec-ch-ua");
        info.cookie_header = header(COOKIE.as_str());
        info
    }

    /// Buffers small urlencoded POST bodies to look for an `answer` + `csrf_token` pair.
    /// Anything else is handed back with its body intact.
    async fn take_challenge_submission(&self, req: Request<Body>, info: &RequestInfo) -> Submission {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with(FORM_CONTENT_TYPE));
        let declared_len = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        if !is_form || !declared_len.map_or(false, |len| len <= self.max_form_bytes) {
            return Submission::NotASubmission(req);
        }

        let (parts, body) = req.into_parts();
        let bytes = match read_body_limited(body, self.max_form_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Unreadable form body from {}: {}", info.ip, e);
                return Submission::Handled(plain_response(StatusCode::BAD_REQUEST, "400 Bad Request"));
            }
        };

        let (Some(answer), Some(token)) = (form_field(&bytes, "answer"), form_field(&bytes, "csrf_token"))
        else {
            return Submission::NotASubmission(Request::from_parts(parts, Body::from(bytes)));
        };

        match submit_answer(&self.ctx.bans, &self.ctx.csrf, &info.ip, &answer, &token, unix_now()).await {
            Ok(outcome) => debug!("Challenge submission from {}: {:?}", info.ip, outcome),
            Err(e) => error!("Challenge submission from {} failed: {}", info.ip, e),
        }

        Submission::Handled(redirect_response(&info.uri))
    }

    async fn block_response(&self, info: &RequestInfo, kind: BlockKind) -> Response<Body> {
        let wants_challenge =
            kind == BlockKind::Challenge || self.ctx.settings.block_mode == BlockMode::Challenge;

        let page = if wants_challenge {
            match self.ctx.bans.challenges().get_or_create(&info.ip).await {
                Ok(challenge) => BlockPage::Challenge {
                    question: challenge.question,
                    csrf_token: self.ctx.csrf.token(&info.ip, SOLVE_ACTION, unix_now()),
                },
                Err(e) => {
                    error!("Could not issue challenge for {}: {}", info.ip, e);
                    BlockPage::AccessDenied
                }
            }
        } else if kind == BlockKind::RateLimited {
            BlockPage::TooManyRequests
        } else {
            BlockPage::AccessDenied
        };

        html_response(kind.status(), page.render())
    }

    async fn proxy(&self, req: Request<Body>, info: &RequestInfo) -> Response<Body> {
        let upstream_uri = format!("{}{}", self.upstream, info.uri);
        let uri = match upstream_uri.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Invalid upstream URI {}: {}", upstream_uri, e);
                return plain_response(StatusCode::BAD_REQUEST, "400 Bad Request");
            }
        };

        let inject = self.should_inject(info);

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.headers.remove("X-Real-IP");
        parts.headers.remove("X-Forwarded-For");
        if let Ok(value) = HeaderValue::from_str(&info.ip) {
            parts.headers.insert("X-Forwarded-For", value.clone());
            parts.headers.insert("X-Real-IP", value);
        }
        if inject {
            // Injection needs an uncompressed body
            parts.headers.remove(ACCEPT_ENCODING);
        }

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) if inject && is_plain_html(&response) => self.inject_snippets(response).await,
            Ok(response) => response,
            Err(e) => {
                error!("Upstream error: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "502 Bad Gateway - Upstream Error")
            }
        }
    }

    fn should_inject(&self, info: &RequestInfo) -> bool {
        let settings = &self.ctx.settings;
        (settings.enable_js_check || settings.enable_honeypot)
            && !info.authenticated
            && !self.ctx.exemptions.is_known_bot(info.user_agent())
    }

    async fn inject_snippets(&self, response: Response<Body>) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        let bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed reading upstream body: {}", e);
                return plain_response(StatusCode::BAD_GATEWAY, "502 Bad Gateway - Upstream Error");
            }
        };

        let html = match String::from_utf8(bytes.to_vec()) {
            Ok(html) => html,
            Err(_) => return Response::from_parts(parts, Body::from(bytes)),
        };

        let mut snippet = String::new();
        if self.ctx.settings.enable_js_check {
            snippet.push_str(&self.ctx.js.script_html(Utc::now()));
        }
        if self.ctx.settings.enable_honeypot {
            snippet.push_str(&self.ctx.honeypot.link_html());
        }

        parts.headers.remove(CONTENT_LENGTH);
        Response::from_parts(parts, Body::from(inject_before_body_close(&html, &snippet)))
    }

    async fn handle_health(&self) -> Response<Body> {
        let cache_ok = self.ctx.cache().get("stealthtrap:health").await.is_ok();
        let log_ok = self.ctx.bans.log().ping().is_ok();
        let healthy = cache_ok && log_ok;

        let body = serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "cache": cache_ok,
            "ban_log": log_ok,
            "test_mode": self.ctx.settings.test_mode,
        });

        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

enum Submission {
    Handled(Response<Body>),
    NotASubmission(Request<Body>),
}

fn is_plain_html(response: &Response<Body>) -> bool {
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("text/html"));
    is_html && !response.headers().contains_key(CONTENT_ENCODING)
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// 303 back to where the form was posted
fn redirect_response(uri: &str) -> Response<Body> {
    let location = HeaderValue::from_str(uri).unwrap_or_else(|_| HeaderValue::from_static("/"));
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SEE_OTHER;
    response.headers_mut().insert(LOCATION, location);
    set_no_cache(&mut response);
    response
}
