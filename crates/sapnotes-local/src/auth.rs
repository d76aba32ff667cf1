//! Single-flight certificate authentication with an on-disk session cache.
//!
//! `Idle -> Authenticating -> {Authenticated | Failed}`. At most one login runs per
//! process; callers arriving while it runs await the same shared future and observe the
//! same outcome.

use crate::config::Config;
use crate::now_epoch_ms;
use crate::store::CredentialStore;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use sapnotes_core::{Error, LoginBrowser, LoginRequest, Result, SessionRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type LoginFuture = Shared<BoxFuture<'static, Result<String>>>;

#[derive(Default)]
struct AuthState {
    record: Option<SessionRecord>,
    in_flight: Option<LoginFuture>,
}

/// Snapshot for diagnostics; carries no secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub expires_at_ms: Option<u64>,
    pub login_in_flight: bool,
    pub logins_started: u64,
}

struct Inner {
    config: Config,
    store: CredentialStore,
    login: Arc<dyn LoginBrowser>,
    state: Mutex<AuthState>,
    logins_started: AtomicU64,
}

#[derive(Clone)]
pub struct Authenticator {
    inner: Arc<Inner>,
}

impl Authenticator {
    pub fn new(config: Config, store: CredentialStore, login: Arc<dyn LoginBrowser>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                login,
                state: Mutex::new(AuthState::default()),
                logins_started: AtomicU64::new(0),
            }),
        }
    }

    /// Return valid session material, logging in only when no fresh session is cached.
    pub async fn ensure_authenticated(&self) -> Result<String> {
        let joined = {
            let st = self.inner.lock_state();
            match st.in_flight.as_ref() {
                Some(f) => Some(f.clone()),
                None => match self.inner.fresh_in_memory(&st) {
                    Some(material) => return Ok(material),
                    None => None,
                },
            }
        };
        if let Some(f) = joined {
            tracing::debug!("joining in-flight login");
            return f.await;
        }

        // Another process may have refreshed the credential file.
        let on_disk = self.inner.store.load_async().await;

        let fut = {
            let mut st = self.inner.lock_state();
            if let Some(f) = st.in_flight.as_ref() {
                f.clone()
            } else if let Some(material) = self.inner.fresh_in_memory(&st) {
                return Ok(material);
            } else if let Some(material) = self.inner.adopt_from_disk(&mut st, on_disk) {
                return Ok(material);
            } else {
                Inner::start_login(&self.inner, &mut st)
            }
        };
        fut.await
    }

    /// Log in even when a cached session looks fresh. Joins a login already in flight.
    pub async fn force_login(&self) -> Result<String> {
        let fut = {
            let mut st = self.inner.lock_state();
            match st.in_flight.as_ref() {
                Some(f) => f.clone(),
                None => Inner::start_login(&self.inner, &mut st),
            }
        };
        fut.await
    }

    /// Forget the current session, in memory and on disk.
    pub fn invalidate(&self) {
        let mut st = self.inner.lock_state();
        st.record = None;
        if let Err(e) = self.inner.store.clear() {
            tracing::warn!(error = %e, "failed to remove credential file");
        }
        tracing::info!("session invalidated");
    }

    /// Forget the session only if it is still the one the vendor rejected.
    ///
    /// Callers that saw the same rejection concurrently must not discard a session another
    /// caller already re-established. Returns whether anything was dropped.
    pub async fn invalidate_if(&self, rejected: &str) -> bool {
        let dropped = {
            let mut st = self.inner.lock_state();
            if st.in_flight.is_some() {
                tracing::debug!("login already in flight; keeping state");
                return false;
            }
            match st.record.as_ref().map(|r| r.session_material == rejected) {
                Some(false) => {
                    tracing::debug!("rejected session already replaced");
                    return false;
                }
                Some(true) => {
                    st.record = None;
                    true
                }
                None => false,
            }
        };

        let on_disk = self.inner.store.load_async().await;
        let st = self.inner.lock_state();
        // A login that started or finished meanwhile owns the file now.
        if st.in_flight.is_some() || st.record.is_some() {
            return dropped;
        }
        let cleared = match on_disk {
            Ok(Some(r)) if r.session_material == rejected => match self.inner.store.clear() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to remove credential file");
                    false
                }
            },
            _ => false,
        };
        if dropped || cleared {
            tracing::info!("rejected session invalidated");
        }
        dropped || cleared
    }

    pub fn status(&self) -> AuthStatus {
        let now = now_epoch_ms();
        let buffer = self.inner.buffer_ms();
        let st = self.inner.lock_state();
        let fresh = st.record.as_ref().filter(|r| r.is_fresh(now, buffer));
        AuthStatus {
            authenticated: fresh.is_some(),
            expires_at_ms: fresh.map(|r| r.expires_at_ms),
            login_in_flight: st.in_flight.is_some(),
            logins_started: self.inner.logins_started.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer_ms(&self) -> u64 {
        self.config.session_buffer.as_millis() as u64
    }

    fn fresh_in_memory(&self, st: &AuthState) -> Option<String> {
        st.record
            .as_ref()
            .filter(|r| r.is_fresh(now_epoch_ms(), self.buffer_ms()))
            .map(|r| r.session_material.clone())
    }

    fn adopt_from_disk(
        &self,
        st: &mut AuthState,
        on_disk: Result<Option<SessionRecord>>,
    ) -> Option<String> {
        match on_disk {
            Ok(Some(r)) if r.is_fresh(now_epoch_ms(), self.buffer_ms()) => {
                tracing::info!(expires_at_ms = r.expires_at_ms, "reusing cached session");
                let material = r.session_material.clone();
                st.record = Some(r);
                Some(material)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "credential store unreadable; logging in");
                None
            }
        }
    }

    fn start_login(this: &Arc<Self>, st: &mut AuthState) -> LoginFuture {
        let inner = Arc::clone(this);
        let fut = async move { inner.run_login().await }.boxed().shared();
        st.in_flight = Some(fut.clone());
        fut
    }

    async fn run_login(self: Arc<Self>) -> Result<String> {
        self.logins_started.fetch_add(1, Ordering::Relaxed);
        let t0 = Instant::now();
        tracing::info!(engine = %self.config.browser, "starting certificate login");

        let out = self.login_sequence().await;

        let mut st = self.lock_state();
        st.in_flight = None;
        match out {
            Ok(record) => {
                tracing::info!(
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    cookies = record.cookies.len(),
                    expires_at_ms = record.expires_at_ms,
                    "certificate login succeeded"
                );
                let material = record.session_material.clone();
                st.record = Some(record);
                Ok(material)
            }
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "certificate login failed");
                st.record = None;
                Err(e)
            }
        }
    }

    async fn login_sequence(&self) -> Result<SessionRecord> {
        let pfx_path = self.check_certificate().await?;
        if !self.config.engine_is_known() {
            return Err(Error::BrowserUnavailable(format!(
                "unknown browser engine {:?} (expected chromium, firefox or webkit)",
                self.config.browser
            )));
        }

        let req = LoginRequest {
            pfx_path,
            passphrase: self.config.pfx_passphrase.clone(),
            auth_origin: self.config.endpoints.auth_origin.clone(),
            home_url: self.config.endpoints.home_url.clone(),
            engine: self.config.browser.clone(),
            headful: self.config.headful,
            timeout: self.config.nav_timeout,
            login_markers: self.config.endpoints.login_markers.clone(),
        };

        // Navigation plus the bounded wait away from the login page, plus browser startup.
        let hard = self
            .config
            .nav_timeout
            .saturating_mul(2)
            .saturating_add(Duration::from_secs(15));
        let cookies = match tokio::time::timeout(hard, self.login.login(&req)).await {
            Ok(r) => r.map_err(classify_login_error)?,
            Err(_) => {
                return Err(Error::AuthTimeout(format!(
                    "certificate login exceeded {}ms",
                    hard.as_millis()
                )))
            }
        };
        if cookies.is_empty() {
            return Err(Error::AuthenticationFailed(
                "login finished without any session cookies".to_string(),
            ));
        }

        let record = SessionRecord::new(
            cookies,
            now_epoch_ms(),
            self.config.max_session_age.as_millis() as u64,
        );
        if let Err(e) = self.store.save(&record) {
            tracing::warn!(error = %e, "session established but could not be persisted");
        }
        Ok(record)
    }

    async fn check_certificate(&self) -> Result<std::path::PathBuf> {
        let Some(path) = self.config.pfx_path.clone() else {
            return Err(Error::Certificate(
                "no client certificate configured (set SAPNOTES_PFX_PATH)".to_string(),
            ));
        };
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            Error::Certificate(format!("certificate {} not accessible: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(Error::Certificate(format!(
                "certificate {} is not a file",
                path.display()
            )));
        }
        if meta.len() == 0 {
            return Err(Error::Certificate(format!(
                "certificate {} is empty",
                path.display()
            )));
        }
        tokio::fs::File::open(&path).await.map_err(|e| {
            Error::Certificate(format!("certificate {} not readable: {e}", path.display()))
        })?;
        Ok(path)
    }
}

fn classify_login_error(e: Error) -> Error {
    match e {
        Error::Certificate(_)
        | Error::BrowserUnavailable(_)
        | Error::AuthTimeout(_)
        | Error::AuthenticationFailed(_) => e,
        other => Error::AuthenticationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapnotes_core::Cookie;
    use std::sync::atomic::AtomicUsize;

    struct FakeLogin {
        calls: AtomicUsize,
        delay: Duration,
        fail_with: Option<Error>,
    }

    impl FakeLogin {
        fn ok(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                fail_with: None,
            })
        }

        fn failing(e: Error) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                fail_with: Some(e),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl LoginBrowser for FakeLogin {
        async fn login(&self, _req: &LoginRequest) -> Result<Vec<Cookie>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            Ok(vec![
                Cookie::new("JSESSIONID", &format!("s{n}"), ".sap.com"),
                Cookie::new("MYSAPSSO2", "sso", ".sap.com"),
            ])
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: Config,
        store: CredentialStore,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let pfx = tmp.path().join("client.pfx");
        std::fs::write(&pfx, b"not-really-a-pfx").unwrap();
        let cache = tmp.path().join("token-cache.json");
        let config = Config {
            pfx_path: Some(pfx),
            token_cache_path: cache.clone(),
            ..Config::default()
        };
        Fixture {
            _tmp: tmp,
            config,
            store: CredentialStore::new(cache),
        }
    }

    fn cached(store: &CredentialStore, material: &str, expires_in_ms: u64) {
        let now = now_epoch_ms();
        store
            .save(&SessionRecord {
                session_material: material.to_string(),
                cookies: vec![],
                expires_at_ms: now + expires_in_ms,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let f = fixture();
        let login = FakeLogin::ok(100);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let calls = (0..16).map(|_| {
            let a = auth.clone();
            async move { a.ensure_authenticated().await }
        });
        let outs = futures_util::future::join_all(calls).await;

        assert_eq!(login.calls(), 1);
        let first = outs[0].as_ref().unwrap().clone();
        assert!(first.contains("JSESSIONID=s0"));
        for o in &outs {
            assert_eq!(o.as_ref().unwrap(), &first);
        }
        assert!(!auth.status().login_in_flight);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let f = fixture();
        let login = FakeLogin::failing(Error::AuthTimeout("home page".into()));
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let calls = (0..8).map(|_| {
            let a = auth.clone();
            async move { a.ensure_authenticated().await }
        });
        let outs = futures_util::future::join_all(calls).await;

        assert_eq!(login.calls(), 1);
        for o in outs {
            assert_eq!(o.unwrap_err(), Error::AuthTimeout("home page".into()));
        }
        let st = auth.status();
        assert!(!st.authenticated);
        assert!(!st.login_in_flight);
    }

    #[tokio::test]
    async fn failure_is_not_retried_automatically_but_next_call_logs_in_again() {
        let f = fixture();
        let login = FakeLogin::failing(Error::AuthenticationFailed("idp said no".into()));
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        assert!(auth.ensure_authenticated().await.is_err());
        assert_eq!(login.calls(), 1);
        assert!(auth.ensure_authenticated().await.is_err());
        assert_eq!(login.calls(), 2);
    }

    #[tokio::test]
    async fn fresh_cached_session_skips_login() {
        let f = fixture();
        cached(&f.store, "JSESSIONID=cached", 60 * 60 * 1000);
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let m = auth.ensure_authenticated().await.unwrap();
        assert_eq!(m, "JSESSIONID=cached");
        assert_eq!(login.calls(), 0);
        assert!(auth.status().authenticated);
    }

    #[tokio::test]
    async fn session_inside_expiry_buffer_triggers_login() {
        let f = fixture();
        cached(&f.store, "JSESSIONID=stale", 3 * 60 * 1000);
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let m = auth.ensure_authenticated().await.unwrap();
        assert_eq!(login.calls(), 1);
        assert_ne!(m, "JSESSIONID=stale");
    }

    #[tokio::test]
    async fn successful_login_is_persisted_with_configured_max_age() {
        let f = fixture();
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let before = now_epoch_ms();
        let m = auth.ensure_authenticated().await.unwrap();
        let after = now_epoch_ms();

        let rec = f.store.load().unwrap().expect("persisted");
        assert_eq!(rec.session_material, m);
        assert_eq!(rec.cookies.len(), 2);
        let max_age = f.config.max_session_age.as_millis() as u64;
        assert!(rec.expires_at_ms >= before + max_age);
        assert!(rec.expires_at_ms <= after + max_age);
    }

    #[tokio::test]
    async fn missing_certificate_fails_before_browser() {
        let f = fixture();
        let config = Config {
            pfx_path: Some(f.config.token_cache_path.with_file_name("nope.pfx")),
            ..f.config.clone()
        };
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(config, f.store.clone(), login.clone());

        let e = auth.ensure_authenticated().await.unwrap_err();
        assert_eq!(e.kind(), "CertificateError");
        assert_eq!(login.calls(), 0);
    }

    #[tokio::test]
    async fn empty_certificate_is_rejected() {
        let f = fixture();
        let pfx = f.config.pfx_path.clone().unwrap();
        std::fs::write(&pfx, b"").unwrap();
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let e = auth.ensure_authenticated().await.unwrap_err();
        assert!(matches!(e, Error::Certificate(ref m) if m.contains("empty")));
        assert_eq!(login.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_engine_is_browser_unavailable() {
        let f = fixture();
        let config = Config {
            browser: "netscape".to_string(),
            ..f.config.clone()
        };
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(config, f.store.clone(), login.clone());

        let e = auth.ensure_authenticated().await.unwrap_err();
        assert_eq!(e.kind(), "BrowserUnavailableError");
        assert_eq!(login.calls(), 0);
    }

    #[tokio::test]
    async fn unexpected_login_errors_are_wrapped() {
        let f = fixture();
        let login = FakeLogin::failing(Error::Fetch("socket closed".into()));
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let e = auth.ensure_authenticated().await.unwrap_err();
        assert_eq!(e.kind(), "AuthenticationFailedError");
        assert!(e.to_string().contains("socket closed"));
    }

    #[tokio::test]
    async fn invalidate_forces_next_login_and_removes_file() {
        let f = fixture();
        cached(&f.store, "JSESSIONID=cached", 60 * 60 * 1000);
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        auth.ensure_authenticated().await.unwrap();
        auth.invalidate();
        assert_eq!(f.store.load().unwrap(), None);

        auth.ensure_authenticated().await.unwrap();
        assert_eq!(login.calls(), 1);
    }

    #[tokio::test]
    async fn force_login_ignores_fresh_cache() {
        let f = fixture();
        cached(&f.store, "JSESSIONID=cached", 60 * 60 * 1000);
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let m = auth.force_login().await.unwrap();
        assert_eq!(login.calls(), 1);
        assert_ne!(m, "JSESSIONID=cached");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_login_times_out_and_clears_the_in_flight_handle() {
        let f = fixture();
        let login = FakeLogin::ok(10 * 60 * 1000);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let e = auth.ensure_authenticated().await.unwrap_err();
        assert_eq!(e.kind(), "AuthTimeoutError");
        assert!(e.to_string().contains("exceeded"));
        let st = auth.status();
        assert!(!st.login_in_flight);
        assert!(!st.authenticated);
        assert_eq!(f.store.load().unwrap(), None);

        assert!(auth.ensure_authenticated().await.is_err());
        assert_eq!(login.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_if_drops_only_the_rejected_session() {
        let f = fixture();
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let old = auth.ensure_authenticated().await.unwrap();
        assert!(auth.invalidate_if(&old).await);
        assert_eq!(f.store.load().unwrap(), None);

        let new = auth.ensure_authenticated().await.unwrap();
        assert_ne!(new, old);
        assert!(!auth.invalidate_if(&old).await);
        assert!(auth.status().authenticated);
        assert_eq!(f.store.load().unwrap().unwrap().session_material, new);
        assert_eq!(auth.ensure_authenticated().await.unwrap(), new);
        assert_eq!(login.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_if_leaves_a_login_in_flight_alone() {
        let f = fixture();
        let login = FakeLogin::ok(100);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        let a = auth.clone();
        let pending = tokio::spawn(async move { a.ensure_authenticated().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(auth.status().login_in_flight);
        assert!(!auth.invalidate_if("JSESSIONID=gone").await);

        let m = pending.await.unwrap().unwrap();
        assert_eq!(auth.ensure_authenticated().await.unwrap(), m);
        assert_eq!(login.calls(), 1);
    }

    #[tokio::test]
    async fn invalidate_if_clears_a_rejected_file_another_process_wrote() {
        let f = fixture();
        cached(&f.store, "JSESSIONID=cached", 60 * 60 * 1000);
        let login = FakeLogin::ok(0);
        let auth = Authenticator::new(f.config.clone(), f.store.clone(), login.clone());

        assert!(auth.invalidate_if("JSESSIONID=cached").await);
        assert_eq!(f.store.load().unwrap(), None);
        assert_ne!(auth.ensure_authenticated().await.unwrap(), "JSESSIONID=cached");
        assert_eq!(login.calls(), 1);
    }
}
