//! Node + Playwright plumbing.
//!
//! Expected setup:
//! - Node.js present (`node`, or `SAPNOTES_NODE`)
//! - `playwright` npm package resolvable by Node (global, NODE_PATH, or `SAPNOTES_NODE_PATH`)
//! - Browsers installed (e.g. `npx playwright install chromium`)
//!
//! We never auto-install Playwright at runtime. Scripts speak JSON on stdout only.

use crate::config::env;
use sapnotes_core::{Cookie, Error, LoginBrowser, LoginRequest, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub fn which(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|cand| cand.is_file())
}

fn node_path_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".npm-global").join("lib").join("node_modules"));
    }
    out.push(PathBuf::from("/opt/homebrew/lib/node_modules"));
    out.push(PathBuf::from("/usr/local/lib/node_modules"));
    out.push(PathBuf::from("/usr/lib/node_modules"));
    out
}

fn node_path_has_playwright(np: &str) -> bool {
    std::env::split_paths(np).any(|p| p.join("playwright").is_dir())
}

/// NODE_PATH value that makes a globally installed Playwright resolvable, if one is needed.
pub(crate) fn detect_node_path_for_playwright() -> Option<String> {
    if let Some(v) = env("SAPNOTES_NODE_PATH") {
        return Some(v);
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if node_path_has_playwright(&existing) {
        return None;
    }
    let found = node_path_candidates()
        .into_iter()
        .find(|root| root.join("playwright").is_dir())?;
    let found = found.to_string_lossy().to_string();
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

/// Best-effort check (no process spawned) that Node could resolve the `playwright` package.
pub fn playwright_visible() -> bool {
    let np = detect_node_path_for_playwright()
        .unwrap_or_else(|| std::env::var("NODE_PATH").unwrap_or_default());
    node_path_has_playwright(&np) || std::path::Path::new("node_modules/playwright").is_dir()
}

pub(crate) fn node_command(node_bin: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(node_bin);
    if let Some(np) = detect_node_path_for_playwright() {
        cmd.env("NODE_PATH", np);
    }
    cmd.kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

pub(crate) fn spawn_error(e: std::io::Error) -> Error {
    Error::BrowserUnavailable(format!(
        "Playwright requires Node.js (`node`) and the Playwright npm package: {e}"
    ))
}

/// Map a script's `{ ok: false, error: { code, message, hint } }` into the taxonomy.
pub(crate) fn error_from_payload(v: &serde_json::Value, fallback: fn(String) -> Error) -> Error {
    let code = v
        .pointer("/error/code")
        .and_then(|x| x.as_str())
        .unwrap_or("failed");
    let message = v
        .pointer("/error/message")
        .and_then(|x| x.as_str())
        .unwrap_or("Playwright step failed");
    let hint = v
        .pointer("/error/hint")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .trim();
    let msg = if hint.is_empty() {
        message.to_string()
    } else {
        format!("{message}. {hint}")
    };
    match code {
        "browser_unavailable" => Error::BrowserUnavailable(msg),
        "certificate" => Error::Certificate(msg),
        "timeout" => Error::AuthTimeout(msg),
        "session_expired" => Error::SessionExpired(msg),
        "invalid_params" => Error::InvalidParams(msg),
        _ => fallback(msg),
    }
}

/// Run a one-shot script: args go in on stdin, one JSON document comes back on stdout.
///
/// The hard timeout is enforced around the child wait; on expiry the process is killed.
pub(crate) async fn run_node_script(
    node_bin: &str,
    js: &str,
    args: &serde_json::Value,
    hard_timeout: Duration,
) -> Result<serde_json::Value> {
    let mut child = node_command(node_bin)
        .arg("-e")
        .arg(js)
        .spawn()
        .map_err(spawn_error)?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(args.to_string().as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::BrowserUnavailable("Playwright: missing stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::BrowserUnavailable("Playwright: missing stderr pipe".to_string()))?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
        buf
    });

    match tokio::time::timeout(hard_timeout, child.wait()).await {
        Ok(r) => {
            r.map_err(spawn_error)?;
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::AuthTimeout(format!(
                "Playwright script exceeded hard timeout of {}ms",
                hard_timeout.as_millis()
            )));
        }
    }

    let out = stdout_task.await.unwrap_or_default();
    let err = stderr_task.await.unwrap_or_default();
    let stdout = String::from_utf8_lossy(&out).trim().to_string();
    serde_json::from_str(&stdout).map_err(|e| {
        let stderr = String::from_utf8_lossy(&err).trim().to_string();
        if stderr.is_empty() {
            Error::AuthenticationFailed(format!("Playwright returned invalid JSON: {e}"))
        } else {
            Error::AuthenticationFailed(format!(
                "Playwright returned invalid JSON: {e}. stderr: {stderr}"
            ))
        }
    })
}

const LOGIN_JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message, hint) { ok({ ok: false, error: { code, message, hint } }); }
function msgOf(e) { return String(e && e.message ? e.message : e); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args', ''); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('browser_unavailable',
      'Playwright is not installed for Node.js (require("playwright") failed)',
      'Install it with `npm i -g playwright` and `npx playwright install chromium`.');
  }
  const engine = pw[req.engine];
  if (!engine) return bad('browser_unavailable', 'unknown browser engine ' + req.engine, 'Use chromium, firefox or webkit.');

  const timeoutMs = Number(req.timeout_ms || 30000);
  const markers = (req.login_markers || []).map((m) => String(m).toLowerCase()).filter(Boolean);
  const onLogin = (u) => markers.some((m) => String(u).toLowerCase().includes(m));

  let browser;
  try {
    try {
      browser = await engine.launch({ headless: !req.headful });
    } catch (e) {
      return bad('browser_unavailable', msgOf(e), 'Install the browser with `npx playwright install ' + req.engine + '`.');
    }
    let context;
    try {
      const cert = { origin: req.auth_origin, pfxPath: req.pfx_path };
      if (req.passphrase) cert.passphrase = req.passphrase;
      context = await browser.newContext({ clientCertificates: [cert] });
    } catch (e) {
      return bad('certificate', msgOf(e), 'Check the certificate file and its passphrase.');
    }

    const page = await context.newPage();
    await page.goto(req.home_url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
    if (onLogin(page.url())) {
      await page.waitForURL((u) => !onLogin(u.toString()), { timeout: timeoutMs });
    }
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}

    const cookies = await context.cookies();
    ok({ ok: true, final_url: page.url(), cookies });
  } catch (e) {
    const m = msgOf(e);
    if (e && e.name === 'TimeoutError') return bad('timeout', m, 'The vendor did not leave the login page in time.');
    if (/pfx|pkcs12|mac verify|certificate/i.test(m)) return bad('certificate', m, 'Check the certificate file and its passphrase.');
    bad('login_failed', m, '');
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('login_failed', msgOf(e), ''));
"#;

/// Certificate login through a freshly launched browser that is always closed afterwards.
#[derive(Debug, Clone)]
pub struct PlaywrightLogin {
    node_bin: String,
}

impl PlaywrightLogin {
    pub fn new(node_bin: &str) -> Self {
        Self {
            node_bin: node_bin.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LoginBrowser for PlaywrightLogin {
    async fn login(&self, req: &LoginRequest) -> Result<Vec<Cookie>> {
        if which(&self.node_bin).is_none() {
            return Err(Error::BrowserUnavailable(format!(
                "node binary {:?} not found (set SAPNOTES_NODE)",
                self.node_bin
            )));
        }
        let args = serde_json::json!({
            "pfx_path": req.pfx_path.to_string_lossy(),
            "passphrase": req.passphrase,
            "auth_origin": req.auth_origin,
            "home_url": req.home_url,
            "engine": req.engine,
            "headful": req.headful,
            "timeout_ms": req.timeout.as_millis() as u64,
            "login_markers": req.login_markers,
        });
        let hard = req
            .timeout
            .saturating_mul(2)
            .saturating_add(Duration::from_secs(10));
        let v = run_node_script(&self.node_bin, LOGIN_JS, &args, hard).await?;
        parse_login_payload(&v)
    }
}

fn parse_login_payload(v: &serde_json::Value) -> Result<Vec<Cookie>> {
    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        return Err(error_from_payload(v, Error::AuthenticationFailed));
    }
    let cookies = v
        .get("cookies")
        .cloned()
        .unwrap_or_else(|| serde_json::json!([]));
    serde_json::from_value(cookies)
        .map_err(|e| Error::AuthenticationFailed(format!("unexpected cookie shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_payload_yields_cookies() {
        let v = serde_json::json!({
            "ok": true,
            "final_url": "https://me.sap.com/home",
            "cookies": [
                {"name":"JSESSIONID","value":"a","domain":"me.sap.com","path":"/","expires":-1,
                 "httpOnly":true,"secure":true,"sameSite":"Lax"}
            ]
        });
        let cookies = parse_login_payload(&v).unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "JSESSIONID");
    }

    #[test]
    fn error_codes_map_onto_taxonomy() {
        let cases = [
            ("browser_unavailable", "BrowserUnavailableError"),
            ("certificate", "CertificateError"),
            ("timeout", "AuthTimeoutError"),
            ("login_failed", "AuthenticationFailedError"),
        ];
        for (code, kind) in cases {
            let v = serde_json::json!({
                "ok": false,
                "error": {"code": code, "message": "m", "hint": "h"}
            });
            let e = parse_login_payload(&v).unwrap_err();
            assert_eq!(e.kind(), kind, "code {code}");
            assert!(e.to_string().contains("m. h"));
        }
    }

    #[tokio::test]
    async fn missing_node_binary_is_browser_unavailable() {
        let login = PlaywrightLogin::new("/definitely/not/here/node");
        let req = LoginRequest {
            pfx_path: PathBuf::from("/tmp/x.pfx"),
            passphrase: String::new(),
            auth_origin: "https://accounts.example".into(),
            home_url: "https://example/home".into(),
            engine: "chromium".into(),
            headful: false,
            timeout: Duration::from_secs(1),
            login_markers: vec![],
        };
        let e = login.login(&req).await.unwrap_err();
        assert_eq!(e.kind(), "BrowserUnavailableError");
    }
}
