//! HTML served to blocked visitors, and injection of the trap snippets into
//! upstream pages.

use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use hyper::{Body, Response, StatusCode};

/// Which page a blocked visitor sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPage {
    AccessDenied,
    TooManyRequests,
    Challenge { question: String, csrf_token: String },
}

impl BlockPage {
    pub fn title(&self) -> &'static str {
        match self {
            BlockPage::AccessDenied => "Access Denied",
            BlockPage::TooManyRequests => "Too Many Requests",
            BlockPage::Challenge { .. } => "Are you human?",
        }
    }

    pub fn render(&self) -> String {
        let body = match self {
            BlockPage::AccessDenied => concat!(
                "<h1>Access Denied</h1>\n",
                "<p>Your access has been restricted for security reasons.</p>\n",
                "<p>Please come back later.</p>\n"
            )
            .to_string(),
            BlockPage::TooManyRequests => concat!(
                "<h1>Too Many Requests</h1>\n",
                "<p>You've made too many requests in a short period of time.</p>\n",
                "<p>Please come back later.</p>\n"
            )
            .to_string(),
            BlockPage::Challenge {
                question,
                csrf_token,
            } => format!(
                concat!(
                    "<h1>Are you human?</h1>\n",
                    "<p>Please solve this simple math problem to prove you are not a bot.</p>\n",
                    "<form method=\"POST\" action=\"\">\n",
                    "<input type=\"hidden\" name=\"csrf_token\" value=\"{token}\">\n",
                    "<div class=\"question\">{question}</div>\n",
                    "<input type=\"number\" name=\"answer\" required autofocus>\n",
                    "<button type=\"submit\">Submit</button>\n",
                    "</form>\n"
                ),
                token = escape_html(csrf_token),
                question = escape_html(question),
            ),
        };

        format!(
            concat!(
                "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n",
                "<meta charset=\"utf-8\">\n",
                "<meta name=\"viewport\" content=\"width=device-width, initial-scale=0.85\">\n",
                "<title>{title}</title>\n",
                "<style>{style}</style>\n",
                "</head>\n<body>\n<div class=\"box\">\n{body}</div>\n</body>\n</html>\n"
            ),
            title = self.title(),
            style = STYLE,
            body = body,
        )
    }
}

const STYLE: &str = "body{font-family:system-ui,sans-serif;background:#0c0909;color:#dadada;\
margin:0;display:flex;align-items:center;justify-content:center;height:100vh;text-align:center}\
.box{max-width:520px;padding:20px 40px;margin:0 20px;border:1px solid #dadada}\
h1{font-size:28px;font-weight:normal;margin-top:0}p{opacity:.85;line-height:1.6}\
.question{font-size:28px;margin:20px 0 28px}\
input,button{background:transparent;color:#dadada;border:1px solid #dadada;font-size:18px;padding:10px}\
input{width:80px;text-align:center;margin-right:10px}button{cursor:pointer}";

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Attach headers that keep browsers and intermediaries from storing the response
pub fn set_no_cache<B>(response: &mut Response<B>) {
    let headers = response.headers_mut();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

/// Uncacheable HTML response
pub fn html_response(status: StatusCode, html: String) -> Response<Body> {
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    set_no_cache(&mut response);
    response
}

/// Insert the snippet before the last `</body>`, or append it when there is none
pub fn inject_before_body_close(html: &str, snippet: &str) -> String {
    match html.rfind("</body>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + snippet.len());
            out.push_str(&html[..pos]);
            out.push_str(snippet);
            out.push_str(&html[pos..]);
            out
        }
        None => format!("{}{}", html, snippet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_pages() {
        assert!(BlockPage::AccessDenied.render().contains("<h1>Access Denied</h1>"));
        let rate = BlockPage::TooManyRequests.render();
        assert!(rate.contains("<title>Too Many Requests</title>"));
        assert!(!rate.contains("<form"));
    }

    #[test]
    fn test_challenge_page_has_form_fields() {
        let html = BlockPage::Challenge {
            question: "3 × 4 = ?".to_string(),
            csrf_token: "abc123".to_string(),
        }
        .render();

        assert!(html.contains("3 × 4 = ?"));
        assert!(html.contains("name=\"answer\""));
        assert!(html.contains("name=\"csrf_token\" value=\"abc123\""));
        assert!(html.contains("method=\"POST\""));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<a href=\"x\">&'"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }

    #[test]
    fn test_html_response_is_uncacheable() {
        let response = html_response(StatusCode::FORBIDDEN, "x".to_string());
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[PRAGMA], "no-cache");
        assert!(response.headers()[CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("no-store"));
    }

    #[test]
    fn test_inject_before_body_close() {
        assert_eq!(
            inject_before_body_close("<html><body>hi</body></html>", "<x>"),
            "<html><body>hi<x></body></html>"
        );
        assert_eq!(inject_before_body_close("fragment", "<x>"), "fragment<x>");
    }
}
