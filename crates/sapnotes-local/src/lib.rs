//! Local implementations for sapnotes: environment config, the credential file, the
//! single-flight Authenticator, Playwright shell-outs, the pooled token deriver and the
//! retrieval pipeline. [`service::NoteService`] wires them together.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod auth;
pub mod config;
pub mod deriver;
pub mod detail;
pub mod driver;
pub mod normalize;
pub mod playwright;
pub mod search;
pub mod service;
pub mod store;

pub use auth::{AuthStatus, Authenticator};
pub use config::{Config, VendorEndpoints};
pub use deriver::{DeriverSettings, SessionTokenDeriver};
pub use detail::{DetailAttempt, DetailLookup};
pub use search::SearchApi;
pub use service::NoteService;
pub use store::CredentialStore;

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared HTTP client for the search API and plain detail requests.
pub fn http_client(timeout: std::time::Duration) -> sapnotes_core::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("sapnotes/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .map_err(|e| sapnotes_core::Error::NotConfigured(format!("http client: {e}")))
}

/// Deadlines become `Timeout`; every other transport failure goes through `wrap`.
pub(crate) fn http_error(
    e: reqwest::Error,
    wrap: fn(String) -> sapnotes_core::Error,
) -> sapnotes_core::Error {
    if e.is_timeout() {
        sapnotes_core::Error::Timeout(e.to_string())
    } else {
        wrap(e.to_string())
    }
}
