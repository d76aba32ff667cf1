//! Session-expiry handling shared by the MCP tools and the CLI.

use sapnotes_core::Result;
use sapnotes_local::NoteService;
use std::future::Future;

/// Run `op` with the current session; if the vendor rejected it, invalidate that session,
/// authenticate again and retry exactly once. Returns whether the retry happened.
pub(crate) async fn with_session_retry<T, F, Fut>(svc: &NoteService, op: F) -> (Result<T>, bool)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_session_retry_when(svc, op, |out| matches!(out, Err(e) if e.is_session_expired())).await
}

/// Like `with_session_retry`, with the caller deciding which outcomes mean "session
/// rejected". Only the rejected material is invalidated, so concurrent callers that saw
/// the same rejection share one login instead of undoing each other's.
pub(crate) async fn with_session_retry_when<T, F, Fut, E>(
    svc: &NoteService,
    mut op: F,
    expired: E,
) -> (Result<T>, bool)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
    E: Fn(&Result<T>) -> bool,
{
    let material = match svc.ensure_authenticated().await {
        Ok(m) => m,
        Err(e) => return (Err(e), false),
    };
    let out = op(material.clone()).await;
    if !expired(&out) {
        return (out, false);
    }

    tracing::info!("session rejected; re-authenticating and retrying once");
    svc.invalidate_session_for(&material).await;
    match svc.ensure_authenticated().await {
        Ok(fresh) => (op(fresh).await, true),
        Err(e) => (Err(e), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, service, CountingLogin};
    use sapnotes_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn expired_session_forces_login_and_retries_once() {
        let tmp = tempfile::tempdir().unwrap();
        let login = Arc::new(CountingLogin::default());
        let svc = service(config(&tmp), login.clone());
        let first = svc.ensure_authenticated().await.unwrap();

        let attempts = AtomicUsize::new(0);
        let (out, retried) = with_session_retry(&svc, |m| {
            attempts.fetch_add(1, Ordering::SeqCst);
            let stale = m == first;
            async move {
                if stale {
                    Err(Error::SessionExpired("redirected to login".into()))
                } else {
                    Ok(m)
                }
            }
        })
        .await;

        assert_ne!(out.unwrap(), first);
        assert!(retried);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(login.calls(), 2);
    }

    #[tokio::test]
    async fn second_expiry_is_surfaced_not_retried_again() {
        let tmp = tempfile::tempdir().unwrap();
        let login = Arc::new(CountingLogin::default());
        let svc = service(config(&tmp), login);

        let attempts = AtomicUsize::new(0);
        let (out, retried) = with_session_retry(&svc, |_m| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::SessionExpired("still rejected".into())) }
        })
        .await;

        assert!(out.unwrap_err().is_session_expired());
        assert!(retried);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_pass_through_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let login = Arc::new(CountingLogin::default());
        let svc = service(config(&tmp), login.clone());

        let (out, retried) = with_session_retry(&svc, |_m| async {
            Err::<(), _>(Error::Search("502".into()))
        })
        .await;
        assert_eq!(out.unwrap_err().kind(), "SearchError");
        assert!(!retried);
        assert_eq!(login.calls(), 1);
    }

    #[tokio::test]
    async fn callers_rejected_by_the_same_expiry_share_one_login() {
        let tmp = tempfile::tempdir().unwrap();
        let login = Arc::new(CountingLogin::default());
        let svc = Arc::new(service(config(&tmp), login.clone()));
        let dead = svc.ensure_authenticated().await.unwrap();
        assert_eq!(login.calls(), 1);

        let caller = |delay_ms: u64| {
            let svc = svc.clone();
            let dead = dead.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                with_session_retry(&svc, |m| {
                    let dead = dead.clone();
                    async move {
                        // The vendor answers slowly, then rejects the old session.
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        if m == dead {
                            Err(Error::SessionExpired("redirected to login".into()))
                        } else {
                            Ok(m)
                        }
                    }
                })
                .await
            }
        };
        let (a, b) = tokio::join!(caller(0), caller(10));

        let (a, b) = (a.0.unwrap(), b.0.unwrap());
        assert_eq!(a, b);
        assert_ne!(a, dead);
        assert_eq!(login.calls(), 2);
        let on_disk = svc.authenticator().store().load().unwrap().unwrap();
        assert_eq!(on_disk.session_material, a);
    }
}
