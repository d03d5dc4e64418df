//! Hidden trap path. Humans never follow the invisible link; scanners do.

/// Reduce a configured segment to lowercase letters, digits and single hyphens.
///
/// Whitespace and underscores become hyphens, everything else outside the allowed set
/// is dropped, and leading/trailing hyphens are trimmed.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());

    for c in raw.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if (c == '-' || c == '_' || c.is_whitespace()) && !out.ends_with('-') {
            out.push('-');
        }
    }

    out.trim_matches('-').to_string()
}

/// Detects access to the hidden path
#[derive(Debug, Clone)]
pub struct Honeypot {
    segment: String,
}

impl Honeypot {
    pub fn new(raw_segment: &str) -> Self {
        Self {
            segment: sanitize_segment(raw_segment),
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Path the injected link points at
    pub fn trap_path(&self) -> String {
        format!("/.{}", self.segment)
    }

    /// True when the request URI contains `/.<segment>` or `/<segment>`
    pub fn is_triggered(&self, uri: &str) -> bool {
        if self.segment.is_empty() {
            return false;
        }
        uri.contains(&self.trap_path()) || uri.contains(&format!("/{}", self.segment))
    }

    pub fn ban_reason(&self) -> String {
        format!("Hidden trap URL accessed ({})", self.segment)
    }

    /// Invisible link placed in pages served to anonymous visitors
    pub fn link_html(&self) -> String {
        format!(
            "<!-- Honeypot --><a href=\"{}\" style=\"display:none;\" tabindex=\"-1\" aria-hidden=\"true\"></a>",
            self.trap_path()
        )
    }
}
