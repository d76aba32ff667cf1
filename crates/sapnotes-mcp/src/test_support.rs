//! Fakes for the browser seams so tests never spawn Node.

use sapnotes_core::{
    BrowserLauncher, BrowserSession, Cookie, Error, LoginBrowser, LoginRequest, Result,
};
use sapnotes_local::{Config, NoteService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct CountingLogin {
    pub(crate) calls: AtomicUsize,
}

impl CountingLogin {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LoginBrowser for CountingLogin {
    async fn login(&self, _req: &LoginRequest) -> Result<Vec<Cookie>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Cookie::new("JSESSIONID", &format!("s{n}"), ".sap.com")])
    }
}

pub(crate) struct NoBrowser;

#[async_trait::async_trait]
impl BrowserLauncher for NoBrowser {
    async fn launch(&self, _cookies: &[Cookie]) -> Result<Box<dyn BrowserSession>> {
        Err(Error::BrowserUnavailable("no browser in tests".into()))
    }
}

/// Config rooted in `tmp` with a placeholder certificate file.
pub(crate) fn config(tmp: &tempfile::TempDir) -> Config {
    let pfx = tmp.path().join("client.pfx");
    std::fs::write(&pfx, b"pfx").unwrap();
    Config {
        pfx_path: Some(pfx),
        token_cache_path: tmp.path().join("token-cache.json"),
        ..Config::default()
    }
}

pub(crate) fn service(config: Config, login: Arc<CountingLogin>) -> NoteService {
    NoteService::with_parts(config, login, Arc::new(NoBrowser)).unwrap()
}
