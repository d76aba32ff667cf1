use serde::{Deserialize, Serialize};

/// One cookie as reported by the browser context (Playwright's cookie shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Seconds since the epoch; absent (or negative) for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: default_path(),
            expires: None,
            http_only: false,
            secure: true,
            same_site: None,
        }
    }
}

/// The last successful vendor session, persisted as one whole record.
///
/// `expires_at_ms` is always `login time + configured max age`; vendor cookie expiry is
/// never consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "access_token")]
    pub session_material: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(rename = "expiresAt")]
    pub expires_at_ms: u64,
}

impl SessionRecord {
    pub fn new(cookies: Vec<Cookie>, now_ms: u64, max_age_ms: u64) -> Self {
        Self {
            session_material: cookie_header(&cookies),
            cookies,
            expires_at_ms: now_ms.saturating_add(max_age_ms),
        }
    }

    /// True while `now < expiresAt - buffer`.
    pub fn is_fresh(&self, now_ms: u64, buffer_ms: u64) -> bool {
        now_ms < self.expires_at_ms.saturating_sub(buffer_ms)
    }
}

/// Serialize a cookie jar as a `Cookie:` header value (`a=1; b=2`).
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Best-effort inverse of [`cookie_header`]. Domain/path information is not part of the
/// header, so every cookie is scoped to `domain` and `/`.
pub fn parse_cookie_header(material: &str, domain: &str) -> Vec<Cookie> {
    let mut out = Vec::new();
    for part in material.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        out.push(Cookie::new(name, value.trim(), domain));
    }
    out
}
