//! Headless-browser page fetcher (Node.js + Playwright, spawned per page).

use crate::random_user_agent;
use powersearch_core::{Error, FetchedPage, PageFetcher, Result};
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768), (1280, 800)];

/// Extra wall-clock allowance on top of the navigation timeout for browser start/stop.
const HARD_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message) { ok({ ok: false, error: { code, message } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args'); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured',
      'Playwright is not installed for Node.js; run `npm i -g playwright && npx playwright install chromium`');
  }

  const url = String(req.url || '').trim();
  if (!url) return bad('invalid_params', 'url must be non-empty');
  const timeoutMs = Number(req.timeout_ms || 10000);

  let browser;
  try {
    browser = await pw.chromium.launch({ headless: true });
    const context = await browser.newContext({
      serviceWorkers: 'block',
      userAgent: req.user_agent || undefined,
      viewport: { width: Number(req.width || 1366), height: Number(req.height || 768) },
    });
    const page = await context.newPage();
    if (req.block_resources) {
      await page.route('**/*', (route) => {
        const rt = route.request().resourceType();
        if (rt === 'image' || rt === 'media' || rt === 'font') return route.abort();
        return route.continue();
      });
    }
    const resp = await page.goto(url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}
    const html = await page.content();
    ok({ ok: true, status: resp ? resp.status() : null, html });
  } catch (e) {
    bad('fetch_failed', String(e && e.message ? e.message : e));
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('fetch_failed', String(e && e.message ? e.message : e)));
"#;

fn env_nonempty(k: &str) -> Option<String> {
    std::env::var(k)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn random_viewport() -> (u32, u32) {
    let mut rng = rand::thread_rng();
    VIEWPORTS.choose(&mut rng).copied().unwrap_or((1366, 768))
}

/// Global node_modules roots where a `playwright` install is commonly found.
fn node_path_candidates() -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(home.join(".npm-global").join("lib").join("node_modules"));
    }
    out.push("/opt/homebrew/lib/node_modules".into());
    out.push("/usr/local/lib/node_modules".into());
    out.push("/usr/lib/node_modules".into());
    out
}

fn detect_node_path() -> Option<String> {
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    let has_playwright = existing
        .split(':')
        .filter(|p| !p.trim().is_empty())
        .any(|p| std::path::Path::new(p.trim()).join("playwright").is_dir());
    if has_playwright {
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

#[derive(Debug, Clone)]
pub struct BrowserPageFetcher {
    node_bin: String,
    node_path: Option<String>,
    block_resources: bool,
}

impl BrowserPageFetcher {
    pub fn new(node_bin: impl Into<String>, node_path: Option<String>) -> Self {
        Self {
            node_bin: node_bin.into(),
            node_path,
            block_resources: true,
        }
    }

    /// `POWERSEARCH_NODE` picks the node binary; `POWERSEARCH_NODE_PATH` overrides module
    /// discovery; `POWERSEARCH_RENDER_BLOCK_RESOURCES=0` lets images/media/fonts through.
    pub fn from_env() -> Self {
        let node_bin = env_nonempty("POWERSEARCH_NODE").unwrap_or_else(|| "node".to_string());
        let node_path = env_nonempty("POWERSEARCH_NODE_PATH").or_else(detect_node_path);
        let block_resources = env_nonempty("POWERSEARCH_RENDER_BLOCK_RESOURCES")
            .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);
        Self {
            block_resources,
            ..Self::new(node_bin, node_path)
        }
    }

    fn args_json(&self, url: &str, timeout: Duration) -> String {
        let (width, height) = random_viewport();
        serde_json::json!({
            "url": url,
            "timeout_ms": timeout.as_millis() as u64,
            "user_agent": random_user_agent(),
            "width": width,
            "height": height,
            "block_resources": self.block_resources,
        })
        .to_string()
    }
}

fn parse_render_output(stdout: &str, stderr: &str) -> Result<FetchedPage> {
    let v: serde_json::Value = serde_json::from_str(stdout.trim()).map_err(|e| {
        if stderr.trim().is_empty() {
            Error::NotSupported(format!("browser render returned invalid JSON: {e}"))
        } else {
            Error::NotSupported(format!(
                "browser render returned invalid JSON: {e}. stderr: {}",
                stderr.trim()
            ))
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("fetch_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("browser render failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            "invalid_params" => Error::InvalidArgument(message),
            _ => Error::NotSupported(message),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    // A navigation without a response object (same-document, cached) still rendered a page.
    let status_code = match v.get("status").filter(|x| !x.is_null()) {
        None => 200,
        Some(x) => x
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| {
                Error::NotSupported(format!("browser render returned an invalid status: {x}"))
            })?,
    };
    Ok(FetchedPage { status_code, html })
}

#[async_trait::async_trait]
impl PageFetcher for BrowserPageFetcher {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage> {
        let args_json = self.args_json(url, timeout);
        let hard_timeout = timeout.saturating_add(HARD_TIMEOUT_SLACK);

        let mut cmd = tokio::process::Command::new(&self.node_bin);
        if let Some(np) = &self.node_path {
            cmd.env("NODE_PATH", np);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "browser fetch requires Node.js ({}) and the Playwright npm package: {e}",
                    self.node_bin
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let sent = match stdin.write_all(args_json.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                let _ = child.kill().await;
                return Err(Error::NotSupported(format!(
                    "browser render: could not send arguments: {e}"
                )));
            }
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::NotSupported("browser render: missing stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::NotSupported("browser render: missing stderr pipe".to_string()))?;
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
                r.map_err(|e| Error::NotSupported(format!("browser render wait failed: {e}")))?;
            }
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::NotSupported(format!(
                    "browser render hard timeout after {}ms",
                    hard_timeout.as_millis()
                )));
            }
        }

        let out_stdout = stdout_task.await.unwrap_or_default();
        let out_stderr = stderr_task.await.unwrap_or_default();
        parse_render_output(
            &String::from_utf8_lossy(&out_stdout),
            &String::from_utf8_lossy(&out_stderr),
        )
    }
}
