//! User-Agent classification: outdated-browser detection and a best-effort label
//! used in ban reasons.

use once_cell::sync::Lazy;
use regex::Regex;

static CHROME_MAJOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"Chrome/(\d+)").expect("static regex"));
static FIREFOX_MAJOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Firefox/(\d+)").expect("static regex"));
static VERSION_MAJOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Version/(\d+)").expect("static regex"));

static BRAVE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""Brave";v="([^"]+)""#).expect("static regex"));
static EDGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Edge/([\d.]+)").expect("static regex"));
static CHROME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Chrome/([\d.]+)").expect("static regex"));
static FIREFOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Firefox/([\d.]+)").expect("static regex"));
static SAFARI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Version/([\d.]+).*Safari").expect("static regex"));

/// Minimum supported major versions
pub const MIN_CHROME: u32 = 120;
pub const MIN_FIREFOX: u32 = 115;
pub const MIN_SAFARI_VERSION: u32 = 15;

fn major(re: &Regex, ua: &str) -> Option<u32> {
    re.captures(ua)?.get(1)?.as_str().parse().ok()
}

/// Any of the three thresholds matching marks the browser outdated
pub fn is_outdated(user_agent: &str) -> bool {
    let below = |re: &Regex, min: u32| major(re, user_agent).map_or(false, |v| v < min);

    below(&CHROME_MAJOR, MIN_CHROME)
        || below(&FIREFOX_MAJOR, MIN_FIREFOX)
        || below(&VERSION_MAJOR, MIN_SAFARI_VERSION)
}

/// `"<name> <version>"` for logs and ban reasons.
///
/// The `Sec-CH-UA` brand wins over UA tokens since Chromium forks all claim Chrome.
pub fn browser_label(user_agent: Option<&str>, sec_ch_ua: Option<&str>) -> String {
    let mut name = "Unknown".to_string();
    let mut version = "N/A".to_string();

    let hint = sec_ch_ua.unwrap_or("");
    let ua = user_agent.unwrap_or("");

    let captured = |re: &Regex| -> Option<String> {
        re.captures(ua)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };

    if !hint.is_empty() && hint.contains("Brave") {
        name = "Brave".to_string();
        if let Some(v) = BRAVE_HINT.captures(hint).and_then(|caps| caps.get(1)) {
            version = v.as_str().to_string();
        }
    } else if let Some(v) = captured(&EDGE) {
        name = "Edge".to_string();
        version = v;
    } else if let Some(v) = captured(&CHROME) {
        name = "Chrome".to_string();
        version = v;
    } else if let Some(v) = captured(&FIREFOX) {
        name = "Firefox".to_string();
        version = v;
    } else if let Some(v) = captured(&SAFARI) {
        name = "Safari".to_string();
        version = v;
    } else if user_agent.is_some() {
        name = ua.split(' ').next().unwrap_or("").to_string();
    }

    format!("{} {}", name, version).trim().to_string()
}
