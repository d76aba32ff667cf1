//! Long-lived Playwright driver process backing the pooled browser context.
//!
//! The Node side keeps one browser and one context alive and answers newline-delimited
//! JSON commands (`{id, op, ...}` -> `{id, ok, result | error}`). Every command opens its
//! own page and closes it before answering.

use crate::playwright::{error_from_payload, node_command, spawn_error, which};
use sapnotes_core::{
    BrowserLauncher, BrowserSession, CapturedToken, Cookie, Error, PageVisit, RenderedPage,
    Result, TokenSource,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

const DRIVER_JS: &str = r#"
const readline = require('readline');

function send(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }
function msgOf(e) { return String(e && e.message ? e.message : e); }
function coded(code, message) { const e = new Error(message); e.code = code; return e; }

let pw = null;
try { pw = require('playwright'); } catch (_) {}

let browser = null;
let context = null;

async function init(req) {
  if (!pw) throw coded('browser_unavailable', 'Playwright is not installed for Node.js (require("playwright") failed)');
  const engine = pw[req.engine];
  if (!engine) throw coded('browser_unavailable', 'unknown browser engine ' + req.engine);
  try { browser = await engine.launch({ headless: !req.headful }); }
  catch (e) { throw coded('browser_unavailable', msgOf(e)); }
  context = await browser.newContext();
  if (Array.isArray(req.cookies) && req.cookies.length > 0) await context.addCookies(req.cookies);
  return {};
}

async function withPage(fn) {
  if (!context) throw coded('browser_unavailable', 'driver not initialised');
  const page = await context.newPage();
  try { return await fn(page); } finally { try { await page.close(); } catch (_) {} }
}

async function visit(req) {
  return withPage(async (page) => {
    const resp = await page.goto(req.url, { waitUntil: 'domcontentloaded', timeout: req.timeout_ms });
    return { final_url: page.url(), status: resp ? resp.status() : null };
  });
}

function hostMatches(url, host) {
  try {
    const h = new URL(url).hostname.toLowerCase();
    return h === host || h.endsWith('.' + host);
  } catch (_) { return false; }
}

async function captureBearer(req) {
  const host = String(req.token_host || '').toLowerCase();
  return withPage(async (page) => {
    let token = null;
    let done;
    const seen = new Promise((resolve) => { done = resolve; });
    page.on('request', (r) => {
      if (token || !hostMatches(r.url(), host)) return;
      const auth = r.headers()['authorization'] || '';
      const m = /^bearer\s+(.+)$/i.exec(auth.trim());
      if (m) { token = m[1].trim(); done(); }
    });
    await page.goto(req.url, { waitUntil: 'domcontentloaded', timeout: req.timeout_ms });
    await Promise.race([seen, page.waitForTimeout(req.settle_ms)]);
    if (token) return { final_url: page.url(), token, source: 'network' };

    const stored = await page.evaluate(() => {
      const jwt = /^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$/;
      const scan = (store) => {
        try {
          for (let i = 0; i < store.length; i++) {
            const k = store.key(i) || '';
            if (!/token/i.test(k)) continue;
            let v = store.getItem(k) || '';
            try { const o = JSON.parse(v); v = (o && (o.token || o.accessToken || o.access_token)) || v; } catch (_) {}
            if (typeof v === 'string' && (jwt.test(v) || /^x[0-9a-f-]{30,}$/i.test(v))) return v;
          }
        } catch (_) {}
        return null;
      };
      return scan(window.sessionStorage) || scan(window.localStorage) || null;
    });
    return { final_url: page.url(), token: stored, source: stored ? 'storage' : null };
  });
}

async function render(req) {
  return withPage(async (page) => {
    const resp = await page.goto(req.url, { waitUntil: 'domcontentloaded', timeout: req.timeout_ms });
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, req.timeout_ms) }); } catch (_) {}
    const headers = resp ? resp.headers() : {};
    return {
      final_url: page.url(),
      status: resp ? resp.status() : null,
      content_type: headers['content-type'] || null,
      html: await page.content(),
    };
  });
}

async function shutdown() {
  try { if (browser) await browser.close(); } catch (_) {}
  browser = null;
  context = null;
}

const ops = { init, visit, capture_bearer: captureBearer, render };

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', async (line) => {
  let req;
  try { req = JSON.parse(line); } catch (_) { return; }
  if (req.op === 'close') {
    await shutdown();
    send({ id: req.id, ok: true, result: {} });
    process.exit(0);
  }
  const fn = ops[req.op];
  if (!fn) return send({ id: req.id, ok: false, error: { code: 'invalid_params', message: 'unknown op ' + req.op } });
  try {
    send({ id: req.id, ok: true, result: await fn(req) });
  } catch (e) {
    const code = e && e.code ? e.code : (e && e.name === 'TimeoutError' ? 'timeout' : 'failed');
    send({ id: req.id, ok: false, error: { code, message: msgOf(e) } });
  }
});
rl.on('close', async () => { await shutdown(); process.exit(0); });
"#;

struct DriverIo {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

pub struct PlaywrightSession {
    io: tokio::sync::Mutex<DriverIo>,
    child: std::sync::Mutex<Child>,
    next_id: AtomicU64,
    closed: AtomicBool,
    settle: Duration,
}

impl PlaywrightSession {
    fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let _ = child.start_kill();
    }

    async fn call(
        &self,
        op: &str,
        mut payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BrowserUnavailable(
                "pooled browser is closed".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        payload["id"] = serde_json::json!(id);
        payload["op"] = serde_json::json!(op);
        let mut line = payload.to_string();
        line.push('\n');

        // Driver-side navigation timeouts are `timeout`; leave room for it to answer.
        let hard = timeout.saturating_add(Duration::from_secs(5));
        let mut io = self.io.lock().await;
        match tokio::time::timeout(hard, roundtrip(&mut io, &line, id)).await {
            Ok(Ok(v)) => {
                if v.get("ok").and_then(|x| x.as_bool()) == Some(true) {
                    Ok(v.get("result").cloned().unwrap_or(serde_json::Value::Null))
                } else {
                    Err(error_from_payload(&v, Error::Fetch))
                }
            }
            Ok(Err(e)) => {
                self.kill();
                Err(e)
            }
            Err(_) => {
                self.kill();
                Err(Error::AuthTimeout(format!(
                    "browser step {op:?} exceeded {}ms",
                    hard.as_millis()
                )))
            }
        }
    }
}

async fn roundtrip(io: &mut DriverIo, line: &str, id: u64) -> Result<serde_json::Value> {
    let gone = |e: std::io::Error| Error::BrowserUnavailable(format!("browser driver gone: {e}"));
    io.stdin.write_all(line.as_bytes()).await.map_err(gone)?;
    io.stdin.flush().await.map_err(gone)?;
    loop {
        let Some(reply) = io.lines.next_line().await.map_err(gone)? else {
            return Err(Error::BrowserUnavailable(
                "browser driver exited".to_string(),
            ));
        };
        let Ok(v) = serde_json::from_str::<serde_json::Value>(&reply) else {
            continue;
        };
        // Replies to commands abandoned after a timeout are skipped.
        if v.get("id").and_then(|x| x.as_u64()) == Some(id) {
            return Ok(v);
        }
    }
}

fn str_field(v: &serde_json::Value, k: &str) -> Option<String> {
    v.get(k).and_then(|x| x.as_str()).map(|s| s.to_string())
}

fn status_field(v: &serde_json::Value) -> Option<u16> {
    v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16)
}

#[async_trait::async_trait]
impl BrowserSession for PlaywrightSession {
    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        matches!(child.try_wait(), Ok(None))
    }

    async fn visit(&self, url: &str, timeout: Duration) -> Result<PageVisit> {
        let v = self
            .call(
                "visit",
                serde_json::json!({ "url": url, "timeout_ms": timeout.as_millis() as u64 }),
                timeout,
            )
            .await?;
        Ok(PageVisit {
            final_url: str_field(&v, "final_url").unwrap_or_else(|| url.to_string()),
            status: status_field(&v),
        })
    }

    async fn capture_bearer(
        &self,
        url: &str,
        token_host: &str,
        timeout: Duration,
    ) -> Result<Option<CapturedToken>> {
        let v = self
            .call(
                "capture_bearer",
                serde_json::json!({
                    "url": url,
                    "token_host": token_host,
                    "timeout_ms": timeout.as_millis() as u64,
                    "settle_ms": self.settle.min(timeout).as_millis() as u64,
                }),
                timeout.saturating_add(self.settle),
            )
            .await?;
        let Some(token) = str_field(&v, "token").filter(|t| !t.trim().is_empty()) else {
            return Ok(None);
        };
        let source = match v.get("source").and_then(|x| x.as_str()) {
            Some("storage") => TokenSource::Storage,
            _ => TokenSource::Network,
        };
        Ok(Some(CapturedToken { token, source }))
    }

    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage> {
        let v = self
            .call(
                "render",
                serde_json::json!({ "url": url, "timeout_ms": timeout.as_millis() as u64 }),
                timeout,
            )
            .await?;
        Ok(RenderedPage {
            final_url: str_field(&v, "final_url").unwrap_or_else(|| url.to_string()),
            status: status_field(&v),
            content_type: str_field(&v, "content_type"),
            html: str_field(&v, "html").unwrap_or_default(),
        })
    }

    async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .call("close", serde_json::json!({}), Duration::from_secs(5))
            .await;
        self.kill();
    }
}

/// Spawns a driver process per pooled browser.
#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    pub node_bin: String,
    pub engine: String,
    pub headful: bool,
    pub launch_timeout: Duration,
    /// How long to keep watching for the token request after the page loaded.
    pub settle: Duration,
}

#[async_trait::async_trait]
impl BrowserLauncher for PlaywrightLauncher {
    async fn launch(&self, cookies: &[Cookie]) -> Result<Box<dyn BrowserSession>> {
        if which(&self.node_bin).is_none() {
            return Err(Error::BrowserUnavailable(format!(
                "node binary {:?} not found (set SAPNOTES_NODE)",
                self.node_bin
            )));
        }
        let mut child = node_command(&self.node_bin)
            .arg("-e")
            .arg(DRIVER_JS)
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(spawn_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::BrowserUnavailable("driver: missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BrowserUnavailable("driver: missing stdout pipe".to_string()))?;

        let session = PlaywrightSession {
            io: tokio::sync::Mutex::new(DriverIo {
                stdin,
                lines: BufReader::new(stdout).lines(),
            }),
            child: std::sync::Mutex::new(child),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            settle: self.settle,
        };
        let init = session
            .call(
                "init",
                serde_json::json!({
                    "engine": self.engine,
                    "headful": self.headful,
                    "cookies": cookies,
                }),
                self.launch_timeout,
            )
            .await;
        if let Err(e) = init {
            session.close().await;
            return Err(e);
        }
        Ok(Box::new(session))
    }
}
