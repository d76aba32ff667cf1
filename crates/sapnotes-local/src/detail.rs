//! Detail retrieval: an ordered strategy list consumed by [`first_success`].
//!
//! Strategy errors are logged and recorded as attempts, never propagated; the lookup is
//! absent only when every strategy failed or found nothing.

use crate::config::VendorEndpoints;
use crate::deriver::SessionTokenDeriver;
use crate::http_error;
use crate::normalize::{self, RawDetail};
use sapnotes_core::{CanonicalNote, DetailStrategy, Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailAttempt {
    pub strategy: &'static str,
    /// `found`, `absent` or `error`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailLookup {
    pub note: Option<CanonicalNote>,
    pub attempts: Vec<DetailAttempt>,
}

/// Try each strategy in order; the first one that yields a note wins.
pub async fn first_success(
    strategies: &[Arc<dyn DetailStrategy>],
    note_id: &str,
    session_material: &str,
) -> DetailLookup {
    let mut attempts = Vec::with_capacity(strategies.len());
    for s in strategies {
        let t0 = Instant::now();
        let out = s.fetch(note_id, session_material).await;
        let elapsed_ms = t0.elapsed().as_millis() as u64;
        match out {
            Ok(Some(note)) => {
                tracing::info!(strategy = s.name(), elapsed_ms, "note detail found");
                attempts.push(DetailAttempt {
                    strategy: s.name(),
                    outcome: "found",
                    error_kind: None,
                    message: None,
                    elapsed_ms,
                });
                return DetailLookup {
                    note: Some(note),
                    attempts,
                };
            }
            Ok(None) => {
                tracing::debug!(strategy = s.name(), "detail strategy found nothing");
                attempts.push(DetailAttempt {
                    strategy: s.name(),
                    outcome: "absent",
                    error_kind: None,
                    message: None,
                    elapsed_ms,
                });
            }
            Err(e) => {
                tracing::warn!(
                    strategy = s.name(),
                    kind = e.kind(),
                    error = %e,
                    "detail strategy failed"
                );
                attempts.push(DetailAttempt {
                    strategy: s.name(),
                    outcome: "error",
                    error_kind: Some(e.kind()),
                    message: Some(e.to_string()),
                    elapsed_ms,
                });
            }
        }
    }
    DetailLookup {
        note: None,
        attempts,
    }
}

/// Strategy 1: open the raw detail endpoint in the pooled, session-seeded browser.
pub struct BrowserDetailStrategy {
    deriver: Arc<SessionTokenDeriver>,
    endpoints: VendorEndpoints,
}

impl BrowserDetailStrategy {
    pub fn new(deriver: Arc<SessionTokenDeriver>, endpoints: VendorEndpoints) -> Self {
        Self { deriver, endpoints }
    }
}

#[async_trait::async_trait]
impl DetailStrategy for BrowserDetailStrategy {
    fn name(&self) -> &'static str {
        "browser_raw"
    }

    async fn fetch(&self, note_id: &str, session_material: &str) -> Result<Option<CanonicalNote>> {
        let url = self.endpoints.raw_detail_url_for(note_id);
        let page = self.deriver.render(session_material, &url).await?;
        match page.status {
            Some(404) => return Ok(None),
            Some(s) if s >= 400 => return Err(Error::Fetch(format!("raw detail HTTP {s}"))),
            _ => {}
        }
        let note_url = self.endpoints.note_url_for(note_id);
        let raw = RawDetail {
            note_id,
            note_url: &note_url,
            body: &page.html,
            content_type: page.content_type.as_deref(),
        };
        Ok(normalize::parse_note(&raw).map(|(parser, note)| {
            tracing::debug!(parser, "parsed rendered detail");
            note
        }))
    }
}

/// Strategy 2: plain HTTP GET of the raw detail endpoint with the session cookies.
pub struct HttpDetailStrategy {
    client: reqwest::Client,
    endpoints: VendorEndpoints,
    timeout: Duration,
}

impl HttpDetailStrategy {
    pub fn new(client: reqwest::Client, endpoints: VendorEndpoints, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl DetailStrategy for HttpDetailStrategy {
    fn name(&self) -> &'static str {
        "http_raw"
    }

    async fn fetch(&self, note_id: &str, session_material: &str) -> Result<Option<CanonicalNote>> {
        let url = self.endpoints.raw_detail_url_for(note_id);
        let fetched = get_with_session(
            &self.client,
            &self.endpoints,
            &url,
            session_material,
            self.timeout,
        )
        .await?;
        let Some(body) = fetched else {
            return Ok(None);
        };
        Ok(parse_structured(&self.endpoints, note_id, &body))
    }
}

/// Strategy 3: the legacy query-style endpoints, in configured order.
pub struct LegacyDetailStrategy {
    client: reqwest::Client,
    endpoints: VendorEndpoints,
    timeout: Duration,
}

impl LegacyDetailStrategy {
    pub fn new(client: reqwest::Client, endpoints: VendorEndpoints, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl DetailStrategy for LegacyDetailStrategy {
    fn name(&self) -> &'static str {
        "legacy_odata"
    }

    async fn fetch(&self, note_id: &str, session_material: &str) -> Result<Option<CanonicalNote>> {
        let mut last_err: Option<Error> = None;
        for template in &self.endpoints.legacy_detail_urls {
            let url = crate::config::fill_id(template, note_id);
            let fetched = get_with_session(
                &self.client,
                &self.endpoints,
                &url,
                session_material,
                self.timeout,
            )
            .await;
            match fetched {
                Ok(Some(body)) => {
                    if let Some(note) = parse_structured(&self.endpoints, note_id, &body) {
                        return Ok(Some(note));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "legacy endpoint failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

struct Body {
    text: String,
    content_type: Option<String>,
}

fn parse_structured(
    endpoints: &VendorEndpoints,
    note_id: &str,
    body: &Body,
) -> Option<CanonicalNote> {
    let note_url = endpoints.note_url_for(note_id);
    let raw = RawDetail {
        note_id,
        note_url: &note_url,
        body: &body.text,
        content_type: body.content_type.as_deref(),
    };
    normalize::parse_structured(&raw).map(|(_, note)| note)
}

/// `Ok(None)` for 404. Rejections and login redirects are `SessionExpired`.
async fn get_with_session(
    client: &reqwest::Client,
    endpoints: &VendorEndpoints,
    url: &str,
    session_material: &str,
    timeout: Duration,
) -> Result<Option<Body>> {
    let resp = client
        .get(url)
        .header(reqwest::header::COOKIE, session_material)
        .header(reqwest::header::ACCEPT, "application/json, text/html;q=0.8")
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| http_error(e, Error::Fetch))?;
    let status = resp.status();
    if status.as_u16() == 404 {
        return Ok(None);
    }
    let rejected = status.as_u16() == 401 || status.as_u16() == 403;
    if rejected || endpoints.is_login_url(resp.url().as_str()) {
        return Err(Error::SessionExpired(format!(
            "detail request rejected (HTTP {status})"
        )));
    }
    if !status.is_success() {
        return Err(Error::Fetch(format!("detail HTTP {status}")));
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = resp.text().await.map_err(|e| http_error(e, Error::Fetch))?;
    Ok(Some(Body { text, content_type }))
}
