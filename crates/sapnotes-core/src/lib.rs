use std::time::Duration;

pub mod note;
pub mod session;

pub use note::{CanonicalNote, CanonicalSearchResult, Field};
pub use session::{cookie_header, parse_cookie_header, Cookie, SessionRecord};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
    #[error("authentication timed out: {0}")]
    AuthTimeout(String),
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("token extraction failed: {0}")]
    TokenExtraction(String),
    /// An HTTP request outlived its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("credential store error: {0}")]
    Store(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Taxonomy name surfaced to callers next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Certificate(_) => "CertificateError",
            Self::BrowserUnavailable(_) => "BrowserUnavailableError",
            Self::AuthTimeout(_) => "AuthTimeoutError",
            Self::SessionExpired(_) => "SessionExpiredError",
            Self::AuthenticationFailed(_) => "AuthenticationFailedError",
            Self::TokenExtraction(_) => "TokenExtractionError",
            Self::Timeout(_) => "TimeoutError",
            Self::InvalidParams(_) => "InvalidParamsError",
            Self::Search(_) => "SearchError",
            Self::Fetch(_) => "FetchError",
            Self::Store(_) => "CredentialStoreError",
            Self::NotConfigured(_) => "NotConfiguredError",
        }
    }

    /// Whether a caller may retry the same operation without changing configuration.
    ///
    /// Certificate and browser-availability problems are misconfiguration and must reach
    /// the operator. `SessionExpired` is retryable only after a forced re-authentication.
    pub fn retryable(&self) -> bool {
        match self {
            Self::AuthTimeout(_)
            | Self::AuthenticationFailed(_)
            | Self::SessionExpired(_)
            | Self::TokenExtraction(_)
            | Self::Timeout(_)
            | Self::Search(_)
            | Self::Fetch(_) => true,
            Self::Certificate(_)
            | Self::BrowserUnavailable(_)
            | Self::InvalidParams(_)
            | Self::Store(_)
            | Self::NotConfigured(_) => false,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the login browser needs to perform one certificate login.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub pfx_path: std::path::PathBuf,
    pub passphrase: String,
    /// Origin the client certificate is presented to.
    pub auth_origin: String,
    /// Authenticated landing page; reaching it (off any login path) means success.
    pub home_url: String,
    pub engine: String,
    pub headful: bool,
    pub timeout: Duration,
    /// Substrings of a URL that mark it as a login/authentication surface.
    pub login_markers: Vec<String>,
}

/// Performs the certificate-based browser login and returns the resulting cookie jar.
///
/// Implementations own the browser they launch for the duration of one call and must
/// release it before returning, on success and on failure.
#[async_trait::async_trait]
pub trait LoginBrowser: Send + Sync {
    async fn login(&self, req: &LoginRequest) -> Result<Vec<Cookie>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageVisit {
    pub final_url: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub html: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Authorization header observed on an outbound request to the token host.
    Network,
    /// Read from the page's storage after no request was observed.
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedToken {
    pub token: String,
    pub source: TokenSource,
}

/// A live, stateful browser context seeded with a vendor session.
///
/// Every call opens its own page and closes it before returning; the context itself
/// stays up until [`BrowserSession::close`].
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Navigate to `url` and report where the browser ended up.
    async fn visit(&self, url: &str, timeout: Duration) -> Result<PageVisit>;

    /// Navigate to `url` while watching outbound requests addressed to `token_host` for a
    /// bearer `Authorization` header, falling back to page storage.
    async fn capture_bearer(
        &self,
        url: &str,
        token_host: &str,
        timeout: Duration,
    ) -> Result<Option<CapturedToken>>;

    /// Navigate to `url` and return the rendered markup.
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, cookies: &[Cookie]) -> Result<Box<dyn BrowserSession>>;
}

/// One way of retrieving a note's detail.
///
/// `Ok(None)` means "this strategy found nothing"; errors are reported but never stop
/// the next strategy from running.
#[async_trait::async_trait]
pub trait DetailStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self, note_id: &str, session_material: &str) -> Result<Option<CanonicalNote>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(Error::Certificate("x".into()).kind(), "CertificateError");
        assert_eq!(
            Error::SessionExpired("x".into()).kind(),
            "SessionExpiredError"
        );
        assert_eq!(
            Error::AuthenticationFailed("x".into()).kind(),
            "AuthenticationFailedError"
        );
    }

    #[test]
    fn misconfiguration_is_not_retryable() {
        assert!(!Error::Certificate("missing".into()).retryable());
        assert!(!Error::BrowserUnavailable("no node".into()).retryable());
        assert!(Error::AuthTimeout("30s".into()).retryable());
        assert!(Error::AuthenticationFailed("boom".into()).retryable());
        assert!(Error::Timeout("20000ms".into()).retryable());
    }

    #[test]
    fn display_keeps_underlying_message() {
        let e = Error::AuthTimeout("navigation exceeded 30000ms".into());
        assert_eq!(
            e.to_string(),
            "authentication timed out: navigation exceeded 30000ms"
        );
    }
}
