use anyhow::Result;
use clap::{Parser, Subcommand};
use sapnotes_local::{Config, NoteService};

mod dispatch;
#[path = "mcp/envelope.rs"]
mod envelope;
mod payloads;
#[cfg(test)]
mod test_support;

const SCHEMA_VERSION: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "sapnotes")]
#[command(
    about = "SAP Note search and retrieval over a certificate-authenticated session (MCP stdio server)",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server.
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Force a fresh certificate login and cache the session.
    Login(LoginCmd),
    /// Search notes (json).
    Search(SearchCmd),
    /// Retrieve one note through the detail fallback chain (json).
    Get(GetCmd),
    /// Diagnose configuration and tooling (json; no secrets, no browser).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct LoginCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    /// Free-text query (2..=500 characters).
    query: String,
    /// Maximum results (1..=50).
    #[arg(long)]
    max_results: Option<usize>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct GetCmd {
    /// Note number (digits; leading zeros allowed).
    id: String,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[cfg(feature = "stdio")]
mod mcp {
    use crate::payloads;
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, ServiceExt,
    };
    use sapnotes_local::NoteService;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::Arc;

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Structured content for machine consumers plus a text copy for clients that only
        // read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct NoteSearchArgs {
        /// Free-text query or note number (2..=500 characters).
        #[serde(default)]
        pub(crate) query: Option<String>,
        /// Maximum results (default 10, max 50).
        #[serde(default)]
        pub(crate) max_results: Option<usize>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct NoteGetArgs {
        /// Note number (1..=10 digits; leading zeros allowed).
        #[serde(default)]
        pub(crate) id: Option<String>,
    }

    #[derive(Clone)]
    pub(crate) struct SapnotesMcp {
        tool_router: RmcpToolRouter<Self>,
        service: Arc<NoteService>,
    }

    #[tool_router]
    impl SapnotesMcp {
        pub(crate) fn new(service: Arc<NoteService>) -> Self {
            Self {
                tool_router: Self::tool_router(),
                service,
            }
        }

        #[tool(description = "Search SAP Notes by free text or note number (bounded results)")]
        async fn sap_note_search(
            &self,
            params: Parameters<Option<NoteSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let query = args.query.unwrap_or_default();
            let payload = payloads::search(&self.service, &query, args.max_results).await;
            Ok(tool_result(payload))
        }

        #[tool(
            description = "Retrieve one SAP Note by number; reports every retrieval strategy tried"
        )]
        async fn sap_note_get(
            &self,
            params: Parameters<Option<NoteGetArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let id = args.id.unwrap_or_default();
            let payload = payloads::get(&self.service, &id).await;
            Ok(tool_result(payload))
        }

        #[tool(
            description = "Report sapnotes configuration, version and session state (no secrets)"
        )]
        async fn sapnotes_meta(&self) -> Result<CallToolResult, McpError> {
            Ok(tool_result(payloads::meta(&self.service).await))
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for SapnotesMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "SAP Note search and retrieval. Authentication is automatic (client certificate); outputs are JSON and schema-versioned."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio(service: Arc<NoteService>) -> Result<(), McpError> {
        service.spawn_idle_reaper();
        let server = SapnotesMcp::new(service.clone());
        let running = server
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let waited = running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None));
        service.shutdown().await;
        waited?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::test_support::{config, service, CountingLogin};
        use sapnotes_core::{CanonicalNote, DetailStrategy, Error, Field, Result};
        use std::sync::atomic::{AtomicUsize, Ordering};

        fn p<T>(v: T) -> Parameters<Option<T>> {
            Parameters(Some(v))
        }

        fn payload(r: &CallToolResult) -> serde_json::Value {
            r.structured_content.clone().unwrap_or_default()
        }

        /// Reports an expired session on its first call, then finds the note.
        struct ExpiresOnce {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl DetailStrategy for ExpiresOnce {
            fn name(&self) -> &'static str {
                "expires_once"
            }

            async fn fetch(&self, id: &str, _m: &str) -> Result<Option<CanonicalNote>> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::SessionExpired("redirected to login".into()));
                }
                let mut n = CanonicalNote::bare(id, "https://me.sap.com/notes/2744792");
                n.title = Field::value("Performance of HANA views");
                Ok(Some(n))
            }
        }

        #[tokio::test]
        async fn search_rejects_short_query_without_logging_in() {
            let tmp = tempfile::tempdir().unwrap();
            let login = Arc::new(CountingLogin::default());
            let mcp = SapnotesMcp::new(Arc::new(service(config(&tmp), login.clone())));

            let r = mcp
                .sap_note_search(p(NoteSearchArgs {
                    query: Some("a".into()),
                    max_results: None,
                }))
                .await
                .unwrap();
            let v = payload(&r);
            assert_eq!(v["ok"], false);
            assert_eq!(v["kind"], "sap_note_search");
            assert_eq!(v["schema_version"], 1);
            assert_eq!(v["error"]["code"], "InvalidParamsError");
            assert_eq!(v["error"]["retryable"], false);
            assert_eq!(login.calls(), 0);
        }

        #[tokio::test]
        async fn missing_arguments_are_invalid_params() {
            let tmp = tempfile::tempdir().unwrap();
            let mcp = SapnotesMcp::new(Arc::new(service(
                config(&tmp),
                Arc::new(CountingLogin::default()),
            )));
            let r = mcp.sap_note_get(Parameters(None)).await.unwrap();
            assert_eq!(payload(&r)["error"]["code"], "InvalidParamsError");
            let r = mcp.sap_note_search(Parameters(None)).await.unwrap();
            assert_eq!(payload(&r)["error"]["code"], "InvalidParamsError");
        }

        #[tokio::test]
        async fn get_retries_once_after_session_expiry() {
            let tmp = tempfile::tempdir().unwrap();
            let login = Arc::new(CountingLogin::default());
            let strategy = Arc::new(ExpiresOnce {
                calls: AtomicUsize::new(0),
            });
            let strategies: Vec<Arc<dyn DetailStrategy>> = vec![strategy.clone()];
            let svc = service(config(&tmp), login.clone()).with_strategies(strategies);
            let mcp = SapnotesMcp::new(Arc::new(svc));

            let r = mcp
                .sap_note_get(p(NoteGetArgs {
                    id: Some("2744792".into()),
                }))
                .await
                .unwrap();
            let v = payload(&r);
            assert_eq!(v["ok"], true);
            assert_eq!(v["found"], true);
            assert_eq!(v["retried"], true);
            assert_eq!(v["note"]["title"], "Performance of HANA views");
            assert_eq!(v["note"]["component"], "unspecified");
            assert_eq!(login.calls(), 2);
            assert_eq!(strategy.calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn meta_never_leaks_the_passphrase() {
            let tmp = tempfile::tempdir().unwrap();
            let mut cfg = config(&tmp);
            cfg.pfx_passphrase = "hunter2-secret".into();
            let mcp = SapnotesMcp::new(Arc::new(service(cfg, Arc::new(CountingLogin::default()))));

            let r = mcp.sapnotes_meta().await.unwrap();
            let v = payload(&r);
            assert_eq!(v["ok"], true);
            assert_eq!(v["configured"]["passphrase_set"], true);
            assert!(!v.to_string().contains("hunter2-secret"));
            let text = r.content[0].as_text().map(|t| t.text.clone()).unwrap();
            assert!(!text.contains("hunter2-secret"));
        }
    }
}

fn init_tracing() {
    // stdout belongs to the MCP transport and JSON output; logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("SAPNOTES_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Opt-in `KEY=VALUE` file (`SAPNOTES_ENV_FILE`). Never overrides the process environment.
fn load_env_file() {
    let Ok(p) = std::env::var("SAPNOTES_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn print_payload(
    v: &serde_json::Value,
    output: &str,
    text: impl FnOnce(&serde_json::Value) -> String,
) {
    match output.to_ascii_lowercase().as_str() {
        "text" => println!("{}", text(v)),
        _ => println!("{v}"),
    }
}

fn fail_unless_ok(v: &serde_json::Value) -> Result<()> {
    if v["ok"] == true {
        return Ok(());
    }
    anyhow::bail!(
        "{}: {}",
        v["error"]["code"].as_str().unwrap_or("error"),
        v["error"]["message"].as_str().unwrap_or("")
    )
}

fn search_text(v: &serde_json::Value) -> String {
    let Some(rows) = v["results"].as_array() else {
        return format!("error: {}", v["error"]["message"].as_str().unwrap_or(""));
    };
    let mut out = format!("{} result(s)\n", rows.len());
    for r in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\n",
            r["id"].as_str().unwrap_or(""),
            r["releaseDate"].as_str().unwrap_or(""),
            r["title"].as_str().unwrap_or("")
        ));
    }
    out
}

fn note_text(v: &serde_json::Value) -> String {
    if v["found"] != true {
        return format!("note {} not found", v["id"].as_str().unwrap_or(""));
    }
    let n = &v["note"];
    format!(
        "{} - {}\n{}\n\n{}",
        n["id"].as_str().unwrap_or(""),
        n["title"].as_str().unwrap_or(""),
        n["url"].as_str().unwrap_or(""),
        n["content"].as_str().unwrap_or("")
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            let service = std::sync::Arc::new(NoteService::from_config(Config::from_env())?);
            mcp::serve_stdio(service)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Login(args) => {
            let svc = NoteService::from_config(Config::from_env())?;
            let out = svc.force_login().await;
            let status = svc.status().await;
            svc.shutdown().await;
            let mut v = match out {
                Ok(_) => serde_json::json!({
                    "ok": true,
                    "expires_at_ms": status.expires_at_ms,
                    "credential_file": svc.config().token_cache_path.display().to_string(),
                }),
                Err(e) => serde_json::json!({ "ok": false, "error": envelope::error_from(&e) }),
            };
            envelope::add_envelope_fields(&mut v, "login", 0);
            print_payload(&v, &args.output, |v| match v["expires_at_ms"].as_u64() {
                Some(ms) => format!("logged in; session valid until epoch ms {ms}"),
                None => format!("login failed: {}", v["error"]["message"].as_str().unwrap_or("")),
            });
            fail_unless_ok(&v)?;
        }
        Commands::Search(args) => {
            let svc = NoteService::from_config(Config::from_env())?;
            let v = payloads::search(&svc, &args.query, args.max_results).await;
            svc.shutdown().await;
            print_payload(&v, &args.output, search_text);
            fail_unless_ok(&v)?;
        }
        Commands::Get(args) => {
            let svc = NoteService::from_config(Config::from_env())?;
            let v = payloads::get(&svc, &args.id).await;
            svc.shutdown().await;
            print_payload(&v, &args.output, note_text);
            fail_unless_ok(&v)?;
        }
        Commands::Doctor(args) => {
            let v = payloads::doctor(&Config::from_env());
            print_payload(&v, &args.output, |v| {
                let checks = v["checks"].as_array().cloned().unwrap_or_default();
                let passed = checks.iter().filter(|c| c["ok"] == true).count();
                let mut s = format!(
                    "sapnotes {}\nchecks: {passed}/{} ok\n",
                    env!("CARGO_PKG_VERSION"),
                    checks.len()
                );
                for c in &checks {
                    s.push_str(&format!(
                        "  [{}] {}\n",
                        if c["ok"] == true { "ok" } else { "!!" },
                        c["name"].as_str().unwrap_or("")
                    ));
                }
                s
            });
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "sapnotes",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("sapnotes {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
