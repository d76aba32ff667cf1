//! Environment-driven configuration.
//!
//! `SAPNOTES_*` names win; the un-prefixed names used by older deployments are accepted as
//! fallbacks. Blank values are treated as unset.

use std::path::PathBuf;
use std::time::Duration;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_any(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env(k))
}

pub(crate) fn env_truthy(keys: &[&str]) -> bool {
    matches!(
        env_any(keys).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(keys: &[&str], default: u64, min: u64, max: u64) -> u64 {
    env_any(keys)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Split a comma/whitespace-separated list, dropping duplicates but keeping order.
fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env(key)?;
    let mut out: Vec<String> = Vec::new();
    for part in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let s = part.trim();
        if s.is_empty() {
            continue;
        }
        let s = s.to_string();
        if !out.contains(&s) {
            out.push(s);
        }
    }
    (!out.is_empty()).then_some(out)
}

pub const BROWSER_ENGINES: [&str; 3] = ["chromium", "firefox", "webkit"];

/// Vendor URLs. `{id}` in a template is replaced with the note identifier.
#[derive(Debug, Clone)]
pub struct VendorEndpoints {
    pub auth_origin: String,
    pub home_url: String,
    /// Neutral authenticated page used to check that a session is still accepted.
    pub session_check_url: String,
    /// Search page whose client-side code requests the bearer token.
    pub token_search_url: String,
    /// Host (or host suffix) the bearer token is sent to.
    pub token_host: String,
    pub search_api_url: String,
    /// Advanced-query filter restricting hits to notes.
    pub search_filter: String,
    pub raw_detail_url: String,
    pub legacy_detail_urls: Vec<String>,
    pub note_url: String,
    pub cookie_domain: String,
    pub login_markers: Vec<String>,
}

impl Default for VendorEndpoints {
    fn default() -> Self {
        Self {
            auth_origin: "https://accounts.sap.com".to_string(),
            home_url: "https://me.sap.com/home".to_string(),
            session_check_url: "https://me.sap.com/home".to_string(),
            token_search_url: "https://me.sap.com/search?q=SAP%20Note&tab=Knowledge".to_string(),
            token_host: "coveo.com".to_string(),
            search_api_url: "https://sapamericaproductiontyfzmfz0.org.coveo.com/rest/search/v2?organizationId=sapamericaproductiontyfzmfz0".to_string(),
            search_filter: "@mh_document_type==\"SAP Note\"".to_string(),
            raw_detail_url: "https://me.sap.com/backend/raw/sapnotes/Detail?q={id}&t=E&isVTEnabled=false".to_string(),
            legacy_detail_urls: vec![
                "https://launchpad.support.sap.com/services/odata/svt/snogwscorr/TrunkSet(SapNotesNumber='{id}',Version='0',Language='E')?$format=json".to_string(),
                "https://launchpad.support.sap.com/services/odata/svt/snogwscorr/TrunkSet(SapNotesNumber='{id}',Version='0',Language='D')?$format=json".to_string(),
            ],
            note_url: "https://me.sap.com/notes/{id}".to_string(),
            cookie_domain: ".sap.com".to_string(),
            login_markers: vec![
                "accounts.sap.com".to_string(),
                "/saml2/".to_string(),
                "/oauth2/".to_string(),
                "/login".to_string(),
                "/auth/".to_string(),
            ],
        }
    }
}

impl VendorEndpoints {
    pub fn from_env() -> Self {
        let mut e = Self::default();
        let overrides: [(&str, &mut String); 10] = [
            ("SAPNOTES_AUTH_ORIGIN_URL", &mut e.auth_origin),
            ("SAPNOTES_HOME_URL", &mut e.home_url),
            ("SAPNOTES_SESSION_CHECK_URL", &mut e.session_check_url),
            ("SAPNOTES_TOKEN_SEARCH_URL", &mut e.token_search_url),
            ("SAPNOTES_TOKEN_HOST", &mut e.token_host),
            ("SAPNOTES_SEARCH_API_URL", &mut e.search_api_url),
            ("SAPNOTES_SEARCH_FILTER", &mut e.search_filter),
            ("SAPNOTES_RAW_DETAIL_URL", &mut e.raw_detail_url),
            ("SAPNOTES_NOTE_URL", &mut e.note_url),
            ("SAPNOTES_COOKIE_DOMAIN", &mut e.cookie_domain),
        ];
        for (k, slot) in overrides {
            if let Some(v) = env(k) {
                *slot = v;
            }
        }
        if let Some(v) = env_list("SAPNOTES_LEGACY_DETAIL_URLS") {
            e.legacy_detail_urls = v;
        }
        if let Some(v) = env_list("SAPNOTES_LOGIN_MARKERS") {
            e.login_markers = v;
        }
        e
    }

    pub fn note_url_for(&self, note_id: &str) -> String {
        fill_id(&self.note_url, note_id)
    }

    pub fn raw_detail_url_for(&self, note_id: &str) -> String {
        fill_id(&self.raw_detail_url, note_id)
    }

    /// True when `url` points at a login/authentication surface.
    pub fn is_login_url(&self, url: &str) -> bool {
        let lc = url.to_ascii_lowercase();
        self.login_markers
            .iter()
            .any(|m| !m.is_empty() && lc.contains(&m.to_ascii_lowercase()))
    }
}

pub fn fill_id(template: &str, note_id: &str) -> String {
    template.replace("{id}", note_id)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pfx_path: Option<PathBuf>,
    pub pfx_passphrase: String,
    pub max_session_age: Duration,
    /// Cached sessions closer than this to expiry are treated as stale.
    pub session_buffer: Duration,
    pub headful: bool,
    pub browser: String,
    pub token_cache_path: PathBuf,
    pub node_bin: String,
    pub nav_timeout: Duration,
    pub http_timeout: Duration,
    pub browser_idle_timeout: Duration,
    pub bearer_ttl: Duration,
    pub endpoints: VendorEndpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pfx_path: None,
            pfx_passphrase: String::new(),
            max_session_age: Duration::from_secs(12 * 3600),
            session_buffer: Duration::from_secs(5 * 60),
            headful: false,
            browser: "chromium".to_string(),
            token_cache_path: default_token_cache_path(),
            node_bin: "node".to_string(),
            nav_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(20),
            browser_idle_timeout: Duration::from_secs(5 * 60),
            bearer_ttl: Duration::from_secs(4 * 60),
            endpoints: VendorEndpoints::default(),
        }
    }
}

pub fn default_token_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sapnotes")
        .join("token-cache.json")
}

impl Config {
    pub fn from_env() -> Self {
        let hours = env_u64(&["SAPNOTES_MAX_SESSION_AGE_H", "MAX_JWT_AGE_H"], 12, 1, 168);
        Self {
            pfx_path: env_any(&["SAPNOTES_PFX_PATH", "PFX_PATH"]).map(PathBuf::from),
            pfx_passphrase: std::env::var("SAPNOTES_PFX_PASSPHRASE")
                .or_else(|_| std::env::var("PFX_PASSPHRASE"))
                .unwrap_or_default(),
            max_session_age: Duration::from_secs(hours * 3600),
            session_buffer: Duration::from_secs(5 * 60),
            headful: env_truthy(&["SAPNOTES_HEADFUL", "HEADFUL"]),
            browser: env("SAPNOTES_BROWSER")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "chromium".to_string()),
            token_cache_path: env("SAPNOTES_TOKEN_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(default_token_cache_path),
            node_bin: env("SAPNOTES_NODE").unwrap_or_else(|| "node".to_string()),
            nav_timeout: Duration::from_millis(env_u64(
                &["SAPNOTES_NAV_TIMEOUT_MS"],
                30_000,
                1_000,
                120_000,
            )),
            http_timeout: Duration::from_millis(env_u64(
                &["SAPNOTES_HTTP_TIMEOUT_MS"],
                20_000,
                1_000,
                60_000,
            )),
            browser_idle_timeout: Duration::from_millis(env_u64(
                &["SAPNOTES_BROWSER_IDLE_MS"],
                300_000,
                1_000,
                3_600_000,
            )),
            bearer_ttl: Duration::from_millis(env_u64(
                &["SAPNOTES_BEARER_TTL_MS"],
                240_000,
                0,
                3_600_000,
            )),
            endpoints: VendorEndpoints::from_env(),
        }
    }

    pub fn engine_is_known(&self) -> bool {
        BROWSER_ENGINES.contains(&self.browser.as_str())
    }
}
