//! JSON payloads for the three tools. The MCP server and the CLI print the same shapes.

use crate::dispatch::{with_session_retry, with_session_retry_when};
use crate::envelope::{add_envelope_fields, error_from};
use sapnotes_core::Error;
use sapnotes_local::detail::DetailLookup;
use sapnotes_local::normalize::normalize_note_id;
use sapnotes_local::playwright::{playwright_visible, which};
use sapnotes_local::search::{clamp_max_results, validate_query};
use sapnotes_local::{CredentialStore, NoteService};
use serde_json::json;
use std::time::Instant;

pub(crate) async fn search(
    svc: &NoteService,
    query: &str,
    max_results: Option<usize>,
) -> serde_json::Value {
    let t0 = Instant::now();
    let n = clamp_max_results(max_results);
    let request = json!({ "query": query, "max_results": n });

    let mut payload = match validate_query(query) {
        Err(e) => json!({
            "ok": false,
            "query": query,
            "request": request,
            "error": error_from(&e),
        }),
        Ok(q) => {
            let qs = q.as_str();
            let (out, retried) = with_session_retry(svc, |m| async move {
                svc.search_with_session(&m, qs, Some(n)).await
            })
            .await;
            match out {
                Ok(results) => json!({
                    "ok": true,
                    "query": q,
                    "count": results.len(),
                    "results": results,
                    "retried": retried,
                    "request": request,
                }),
                Err(e) => json!({
                    "ok": false,
                    "query": q,
                    "retried": retried,
                    "request": request,
                    "error": error_from(&e),
                }),
            }
        }
    };
    add_envelope_fields(&mut payload, "sap_note_search", t0.elapsed().as_millis());
    payload
}

/// Detail strategies swallow their errors, so session expiry shows up as attempt records.
fn saw_session_expiry(lookup: &DetailLookup) -> bool {
    lookup.note.is_none()
        && lookup
            .attempts
            .iter()
            .any(|a| a.error_kind == Some("SessionExpiredError"))
}

pub(crate) async fn get(svc: &NoteService, id: &str) -> serde_json::Value {
    let t0 = Instant::now();
    let request = json!({ "id": id });

    let mut payload = match normalize_note_id(id) {
        None => {
            let e = Error::InvalidParams("note id must be 1 to 10 digits".to_string());
            json!({ "ok": false, "id": id, "request": request, "error": error_from(&e) })
        }
        Some(nid) => {
            let id = nid.as_str();
            let (out, retried) = with_session_retry_when(
                svc,
                |m| async move { svc.get_detail_with_session(&m, id).await },
                |out| match out {
                    Ok(lookup) => saw_session_expiry(lookup),
                    Err(e) => e.is_session_expired(),
                },
            )
            .await;
            match out {
                Ok(lookup) => json!({
                    "ok": true,
                    "id": nid,
                    "found": lookup.note.is_some(),
                    "note": lookup.note,
                    "attempts": lookup.attempts,
                    "retried": retried,
                    "request": request,
                }),
                Err(e) => json!({
                    "ok": false,
                    "id": nid,
                    "retried": retried,
                    "request": request,
                    "error": error_from(&e),
                }),
            }
        }
    };
    add_envelope_fields(&mut payload, "sap_note_get", t0.elapsed().as_millis());
    payload
}

/// Configuration summary. Booleans and non-secret values only.
pub(crate) async fn meta(svc: &NoteService) -> serde_json::Value {
    let t0 = Instant::now();
    let cfg = svc.config();
    let status = svc.status().await;
    let mut payload = json!({
        "ok": true,
        "name": "sapnotes",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": {
            "pfx_path_set": cfg.pfx_path.is_some(),
            "pfx_exists": cfg.pfx_path.as_ref().is_some_and(|p| p.is_file()),
            "passphrase_set": !cfg.pfx_passphrase.is_empty(),
            "browser": cfg.browser,
            "browser_known": cfg.engine_is_known(),
            "headful": cfg.headful,
            "node_found": which(&cfg.node_bin).is_some(),
            "playwright_visible": playwright_visible(),
            "token_cache_path": cfg.token_cache_path.display().to_string(),
            "max_session_age_h": cfg.max_session_age.as_secs() / 3600,
            "nav_timeout_ms": cfg.nav_timeout.as_millis() as u64,
            "http_timeout_ms": cfg.http_timeout.as_millis() as u64,
            "browser_idle_ms": cfg.browser_idle_timeout.as_millis() as u64,
            "bearer_ttl_ms": cfg.bearer_ttl.as_millis() as u64,
        },
        "endpoints": {
            "home_url": cfg.endpoints.home_url,
            "search_api_url": cfg.endpoints.search_api_url,
            "raw_detail_url": cfg.endpoints.raw_detail_url,
            "legacy_detail_urls": cfg.endpoints.legacy_detail_urls,
        },
        "session": status,
    });
    add_envelope_fields(&mut payload, "sapnotes_meta", t0.elapsed().as_millis());
    payload
}

/// Offline readiness checks for `sapnotes doctor`; never starts a browser.
pub(crate) fn doctor(cfg: &sapnotes_local::Config) -> serde_json::Value {
    let t0 = Instant::now();
    let store = CredentialStore::new(cfg.token_cache_path.clone());
    let cached = store.load().ok().flatten();
    let now = sapnotes_local::now_epoch_ms();
    let buffer = cfg.session_buffer.as_millis() as u64;

    let checks = vec![
        json!({"name": "pfx_path_set", "ok": cfg.pfx_path.is_some()}),
        json!({"name": "pfx_readable", "ok": cfg.pfx_path.as_ref().is_some_and(|p| p.is_file())}),
        json!({"name": "browser_known", "ok": cfg.engine_is_known(), "value": cfg.browser}),
        json!({"name": "node_found", "ok": which(&cfg.node_bin).is_some()}),
        json!({"name": "playwright_visible", "ok": playwright_visible()}),
    ];
    let ok = checks.iter().all(|c| c["ok"] == true);
    let mut payload = json!({
        "ok": ok,
        "name": "sapnotes",
        "version": env!("CARGO_PKG_VERSION"),
        "checks": checks,
        "passphrase_set": !cfg.pfx_passphrase.is_empty(),
        "cached_session": {
            "present": cached.is_some(),
            "fresh": cached.as_ref().is_some_and(|r| r.is_fresh(now, buffer)),
            "expires_at_ms": cached.as_ref().map(|r| r.expires_at_ms),
        },
    });
    add_envelope_fields(&mut payload, "doctor", t0.elapsed().as_millis());
    payload
}
