//! Session Token Deriver: mints the search API's short-lived bearer token from a cookie
//! session by driving a pooled, idle-evicted browser context.
//!
//! The pooled browser lives behind a mutex, so derivations (and raw detail renders) that
//! share it run one at a time.

use crate::config::VendorEndpoints;
use crate::store::CredentialStore;
use sapnotes_core::{
    parse_cookie_header, BrowserLauncher, BrowserSession, Cookie, Error, RenderedPage, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PooledBrowserSession {
    session: Box<dyn BrowserSession>,
    /// Session material the context was seeded with.
    material: String,
    last_used: Instant,
    bearer: Option<(String, Instant)>,
}

#[derive(Debug, Clone)]
pub struct DeriverSettings {
    pub nav_timeout: Duration,
    pub idle_timeout: Duration,
    /// How long a minted bearer token is reused; zero disables reuse.
    pub bearer_ttl: Duration,
}

pub struct SessionTokenDeriver {
    launcher: Arc<dyn BrowserLauncher>,
    store: CredentialStore,
    endpoints: VendorEndpoints,
    settings: DeriverSettings,
    pool: tokio::sync::Mutex<Option<PooledBrowserSession>>,
    launches: AtomicU64,
}

impl SessionTokenDeriver {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        store: CredentialStore,
        endpoints: VendorEndpoints,
        settings: DeriverSettings,
    ) -> Self {
        Self {
            launcher,
            store,
            endpoints,
            settings,
            pool: tokio::sync::Mutex::new(None),
            launches: AtomicU64::new(0),
        }
    }

    /// Number of browser contexts created so far.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub async fn is_pooled(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    pub async fn get_bearer_token(&self, session_material: &str) -> Result<String> {
        let mut pool = self.pool.lock().await;
        self.checkout(&mut pool, session_material).await?;
        let Some(pooled) = pool.as_mut() else {
            return Err(Error::BrowserUnavailable("pooled browser missing".to_string()));
        };

        if let Some((token, minted)) = pooled.bearer.as_ref() {
            if minted.elapsed() < self.settings.bearer_ttl {
                pooled.last_used = Instant::now();
                return Ok(token.clone());
            }
        }

        let out = self.derive(pooled.session.as_ref()).await;
        pooled.last_used = Instant::now();
        match out {
            Ok(token) => {
                pooled.bearer = Some((token.clone(), Instant::now()));
                Ok(token)
            }
            Err(e) => {
                let dead = e.is_session_expired() || !pooled.session.is_connected();
                if dead {
                    tracing::info!(kind = e.kind(), "tearing down pooled browser");
                    teardown(&mut pool).await;
                }
                Err(e)
            }
        }
    }

    /// Render `url` in the pooled context (used for raw detail pages).
    pub async fn render(&self, session_material: &str, url: &str) -> Result<RenderedPage> {
        let mut pool = self.pool.lock().await;
        self.checkout(&mut pool, session_material).await?;
        let Some(pooled) = pool.as_mut() else {
            return Err(Error::BrowserUnavailable("pooled browser missing".to_string()));
        };
        let out = pooled
            .session
            .render(url, self.settings.nav_timeout)
            .await;
        pooled.last_used = Instant::now();
        let connected = pooled.session.is_connected();
        match out {
            Ok(page) if self.endpoints.is_login_url(&page.final_url) => {
                teardown(&mut pool).await;
                Err(Error::SessionExpired(
                    "detail page redirected to login".to_string(),
                ))
            }
            Ok(page) => Ok(page),
            Err(e) => {
                if !connected {
                    teardown(&mut pool).await;
                }
                Err(e)
            }
        }
    }

    pub async fn invalidate_bearer(&self) {
        if let Some(p) = self.pool.lock().await.as_mut() {
            p.bearer = None;
        }
    }

    /// Close the pooled browser if it has been idle for the configured timeout.
    pub async fn evict_idle(&self) -> bool {
        let mut pool = self.pool.lock().await;
        let idle = pool
            .as_ref()
            .is_some_and(|p| p.last_used.elapsed() >= self.settings.idle_timeout);
        if idle {
            tracing::info!("evicting idle pooled browser");
            teardown(&mut pool).await;
        }
        idle
    }

    /// Close the pooled browser only if it was seeded with `rejected`.
    pub async fn shutdown_if_seeded_with(&self, rejected: &str) -> bool {
        let mut pool = self.pool.lock().await;
        let matches = pool.as_ref().is_some_and(|p| p.material == rejected);
        if matches {
            tracing::info!("closing pooled browser holding a rejected session");
            teardown(&mut pool).await;
        }
        matches
    }

    /// Close the pooled browser. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        teardown(&mut *self.pool.lock().await).await;
    }

    async fn checkout(
        &self,
        pool: &mut Option<PooledBrowserSession>,
        session_material: &str,
    ) -> Result<()> {
        if let Some(p) = pool.as_ref() {
            let stale = if !p.session.is_connected() {
                Some("disconnected")
            } else if p.last_used.elapsed() >= self.settings.idle_timeout {
                Some("idle")
            } else if p.material != session_material {
                Some("session changed")
            } else {
                None
            };
            match stale {
                None => {
                    tracing::debug!("reusing pooled browser");
                    return Ok(());
                }
                Some(reason) => {
                    tracing::info!(reason, "replacing pooled browser");
                    teardown(pool).await;
                }
            }
        }

        let cookies = self.seed_cookies(session_material).await;
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(cookies = cookies.len(), "launching pooled browser");
        let session = self.launcher.launch(&cookies).await?;
        *pool = Some(PooledBrowserSession {
            session,
            material: session_material.to_string(),
            last_used: Instant::now(),
            bearer: None,
        });
        Ok(())
    }

    /// The structured cookie list cached with this session, else the parsed cookie header.
    async fn seed_cookies(&self, session_material: &str) -> Vec<Cookie> {
        match self.store.load_async().await {
            Ok(Some(r)) if r.session_material == session_material && !r.cookies.is_empty() => {
                r.cookies
            }
            _ => parse_cookie_header(session_material, &self.endpoints.cookie_domain),
        }
    }

    async fn derive(&self, session: &dyn BrowserSession) -> Result<String> {
        let nav = self.settings.nav_timeout;
        let visit = session
            .visit(&self.endpoints.session_check_url, nav)
            .await
            .map_err(token_error)?;
        if self.endpoints.is_login_url(&visit.final_url) || matches!(visit.status, Some(401)) {
            return Err(Error::SessionExpired(
                "vendor redirected the session check to its login page".to_string(),
            ));
        }

        let captured = session
            .capture_bearer(
                &self.endpoints.token_search_url,
                &self.endpoints.token_host,
                nav,
            )
            .await
            .map_err(token_error)?;
        match captured {
            Some(c) => {
                let token = strip_bearer(&c.token);
                if token.is_empty() {
                    return Err(Error::TokenExtraction("captured an empty token".to_string()));
                }
                tracing::debug!(source = ?c.source, "bearer token captured");
                Ok(token)
            }
            None => Err(Error::TokenExtraction(format!(
                "no bearer token for {} observed on the search page",
                self.endpoints.token_host
            ))),
        }
    }
}

async fn teardown(pool: &mut Option<PooledBrowserSession>) {
    if let Some(p) = pool.take() {
        p.session.close().await;
    }
}

fn token_error(e: Error) -> Error {
    match e {
        Error::SessionExpired(_) | Error::AuthTimeout(_) | Error::BrowserUnavailable(_) => e,
        other => Error::TokenExtraction(other.to_string()),
    }
}

fn strip_bearer(raw: &str) -> String {
    let t = raw.trim();
    match t.get(..7) {
        Some(p) if p.eq_ignore_ascii_case("bearer ") => t[7..].trim().to_string(),
        _ => t.to_string(),
    }
}
