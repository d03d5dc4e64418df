use hyper::Method;

/// The parts of an incoming request the detection layers look at
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Resolved client IP, always parseable (`0.0.0.0` when unknown)
    pub ip: String,
    pub method: Method,
    /// Path plus query string, as requested
    pub uri: String,
    pub user_agent: Option<String>,
    /// Raw `Sec-CH-UA` client hint
    pub sec_ch_ua: Option<String>,
    /// Raw `Cookie` header
    pub cookie_header: Option<String>,
    /// Signed-in visitor, as reported by the host
    pub authenticated: bool,
}

impl RequestInfo {
    pub fn new(ip: impl Into<String>, method: Method, uri: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            method,
            uri: uri.into(),
            user_agent: None,
            sec_ch_ua: None,
            cookie_header: None,
            authenticated: false,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_sec_ch_ua(mut self, hint: impl Into<String>) -> Self {
        self.sec_ch_ua = Some(hint.into());
        self
    }

    pub fn with_cookie_header(mut self, cookies: impl Into<String>) -> Self {
        self.cookie_header = Some(cookies.into());
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("")
    }

    /// Path component without the query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    /// Value of the named cookie, if sent
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookie_header.as_deref()?.split(';').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key.trim() == name {
                Some(value.trim())
            } else {
                None
            }
        })
    }
}
