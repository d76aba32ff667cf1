//! `NoteService`: the surface handed to the tool dispatcher.
//!
//! Owns the Authenticator, the Session Token Deriver and the retrieval pipeline; no
//! process-wide state.

use crate::auth::{AuthStatus, Authenticator};
use crate::config::Config;
use crate::deriver::{DeriverSettings, SessionTokenDeriver};
use crate::detail::{
    first_success, BrowserDetailStrategy, DetailLookup, HttpDetailStrategy, LegacyDetailStrategy,
};
use crate::driver::PlaywrightLauncher;
use crate::normalize::normalize_note_id;
use crate::playwright::PlaywrightLogin;
use crate::search::{clamp_max_results, validate_query, SearchApi};
use crate::store::CredentialStore;
use sapnotes_core::{
    BrowserLauncher, CanonicalSearchResult, DetailStrategy, Error, LoginBrowser, Result,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub authenticated: bool,
    pub expires_at_ms: Option<u64>,
    pub login_in_flight: bool,
    pub logins_started: u64,
    pub browser_pooled: bool,
    pub browser_launches: u64,
}

pub struct NoteService {
    config: Config,
    auth: Authenticator,
    deriver: Arc<SessionTokenDeriver>,
    search_api: SearchApi,
    strategies: Vec<Arc<dyn DetailStrategy>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl NoteService {
    /// Wire the Playwright-backed login and pooled browser.
    pub fn from_config(config: Config) -> Result<Self> {
        let login = Arc::new(PlaywrightLogin::new(&config.node_bin));
        let launcher = Arc::new(PlaywrightLauncher {
            node_bin: config.node_bin.clone(),
            engine: config.browser.clone(),
            headful: config.headful,
            launch_timeout: config.nav_timeout,
            settle: Duration::from_millis(1_500),
        });
        Self::with_parts(config, login, launcher)
    }

    pub fn with_parts(
        config: Config,
        login: Arc<dyn LoginBrowser>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let store = CredentialStore::new(config.token_cache_path.clone());
        let client = crate::http_client(config.http_timeout)?;
        let deriver = Arc::new(SessionTokenDeriver::new(
            launcher,
            store.clone(),
            config.endpoints.clone(),
            DeriverSettings {
                nav_timeout: config.nav_timeout,
                idle_timeout: config.browser_idle_timeout,
                bearer_ttl: config.bearer_ttl,
            },
        ));
        let search_api = SearchApi::new(client.clone(), &config.endpoints, config.http_timeout);
        let strategies: Vec<Arc<dyn DetailStrategy>> = vec![
            Arc::new(BrowserDetailStrategy::new(
                deriver.clone(),
                config.endpoints.clone(),
            )),
            Arc::new(HttpDetailStrategy::new(
                client.clone(),
                config.endpoints.clone(),
                config.http_timeout,
            )),
            Arc::new(LegacyDetailStrategy::new(
                client,
                config.endpoints.clone(),
                config.http_timeout,
            )),
        ];
        let auth = Authenticator::new(config.clone(), store, login);
        Ok(Self {
            config,
            auth,
            deriver,
            search_api,
            strategies,
            reaper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Replace the detail fallback chain.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn DetailStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub async fn ensure_authenticated(&self) -> Result<String> {
        self.auth.ensure_authenticated().await
    }

    pub async fn force_login(&self) -> Result<String> {
        self.auth.force_login().await
    }

    /// Search notes. The query is validated before any login, browser or network work.
    pub async fn search(
        &self,
        query: &str,
        max_results: Option<usize>,
    ) -> Result<Vec<CanonicalSearchResult>> {
        validate_query(query)?;
        let material = self.auth.ensure_authenticated().await?;
        self.search_with_session(&material, query, max_results).await
    }

    /// `search` with session material the caller already obtained.
    pub async fn search_with_session(
        &self,
        session_material: &str,
        query: &str,
        max_results: Option<usize>,
    ) -> Result<Vec<CanonicalSearchResult>> {
        let q = validate_query(query)?;
        let n = clamp_max_results(max_results);
        let bearer = self.deriver.get_bearer_token(session_material).await?;
        match self.search_api.search(&q, &bearer, n).await {
            Err(e) if e.is_session_expired() => {
                self.deriver.invalidate_bearer().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Look up one note through the detail fallback chain.
    pub async fn get_detail(&self, note_id: &str) -> Result<DetailLookup> {
        let id = checked_note_id(note_id)?;
        let material = self.auth.ensure_authenticated().await?;
        Ok(first_success(&self.strategies, &id, &material).await)
    }

    /// `get_detail` with session material the caller already obtained.
    pub async fn get_detail_with_session(
        &self,
        session_material: &str,
        note_id: &str,
    ) -> Result<DetailLookup> {
        let id = checked_note_id(note_id)?;
        Ok(first_success(&self.strategies, &id, session_material).await)
    }

    /// Drop the cached session and the pooled browser holding it.
    pub async fn invalidate_session(&self) {
        self.auth.invalidate();
        self.deriver.shutdown().await;
    }

    /// Drop `rejected` and its pooled browser, unless they were already replaced.
    pub async fn invalidate_session_for(&self, rejected: &str) {
        let dropped = self.auth.invalidate_if(rejected).await;
        let closed = self.deriver.shutdown_if_seeded_with(rejected).await;
        tracing::debug!(dropped, closed, "invalidated rejected session");
    }

    /// Periodically evict the pooled browser once idle. Requires a tokio runtime.
    pub fn spawn_idle_reaper(&self) {
        let mut slot = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() || self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let deriver = self.deriver.clone();
        let every = (self.config.browser_idle_timeout / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(60));
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                deriver.evict_idle().await;
            }
        }));
    }

    pub async fn status(&self) -> ServiceStatus {
        let AuthStatus {
            authenticated,
            expires_at_ms,
            login_in_flight,
            logins_started,
        } = self.auth.status();
        ServiceStatus {
            authenticated,
            expires_at_ms,
            login_in_flight,
            logins_started,
            browser_pooled: self.deriver.is_pooled().await,
            browser_launches: self.deriver.launches(),
        }
    }

    /// Release the pooled browser and stop the reaper. Safe to call more than once.
    pub async fn shutdown(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = reaper {
            h.abort();
        }
        self.deriver.shutdown().await;
        if first {
            tracing::info!("note service shut down");
        }
    }
}

fn checked_note_id(raw: &str) -> Result<String> {
    normalize_note_id(raw)
        .ok_or_else(|| Error::InvalidParams("note id must be 1 to 10 digits".to_string()))
}
