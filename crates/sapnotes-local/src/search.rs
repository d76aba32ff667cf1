use crate::config::VendorEndpoints;
use crate::http_error;
use crate::normalize;
use sapnotes_core::{CanonicalSearchResult, Error, Result};
use std::time::{Duration, Instant};

pub const MIN_QUERY_CHARS: usize = 2;
pub const MAX_QUERY_CHARS: usize = 500;
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const MAX_RESULTS_CAP: usize = 50;

/// Trim and bounds-check a query. Runs before any IO.
pub fn validate_query(query: &str) -> Result<String> {
    let q = query.trim();
    let n = q.chars().count();
    if n < MIN_QUERY_CHARS {
        return Err(Error::InvalidParams(format!(
            "query must be at least {MIN_QUERY_CHARS} characters"
        )));
    }
    if n > MAX_QUERY_CHARS {
        return Err(Error::InvalidParams(format!(
            "query must be at most {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(q.to_string())
}

pub fn clamp_max_results(n: Option<usize>) -> usize {
    n.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, MAX_RESULTS_CAP)
}

/// Client for the vendor's structured search API (the single authoritative search strategy).
#[derive(Debug, Clone)]
pub struct SearchApi {
    client: reqwest::Client,
    url: String,
    filter: String,
    note_url: String,
    timeout: Duration,
}

impl SearchApi {
    pub fn new(client: reqwest::Client, endpoints: &VendorEndpoints, timeout: Duration) -> Self {
        Self {
            client,
            url: endpoints.search_api_url.clone(),
            filter: endpoints.search_filter.clone(),
            note_url: endpoints.note_url.clone(),
            timeout,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        bearer_token: &str,
        max_results: usize,
    ) -> Result<Vec<CanonicalSearchResult>> {
        let q = validate_query(query)?;
        let t0 = Instant::now();
        let body = serde_json::json!({
            "q": q,
            "aq": self.filter,
            "numberOfResults": max_results.clamp(1, MAX_RESULTS_CAP),
            "firstResult": 0,
            "sortCriteria": "relevancy",
        });

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(bearer_token)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| http_error(e, Error::Search))?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::SessionExpired(format!(
                "search API rejected the bearer token (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(Error::Search(format!("search API HTTP {status}")));
        }

        let bytes = resp.bytes().await.map_err(|e| http_error(e, Error::Search))?;
        let parsed: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "search API returned a non-JSON body");
                return Ok(Vec::new());
            }
        };
        let out = normalize::search_results(&parsed, &self.note_url);
        tracing::info!(
            hits = out.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(out)
    }
}
