use powersearch_core::{Error, FetchFailureKind, FetchedPage, PageFetcher, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod extract;
pub mod fetch;
pub mod openai_compat;
pub mod render;
pub mod search;
pub mod searxng;
pub mod settings;
pub mod summarize;

pub use search::PowerSearch;
pub use settings::{FetchBackendKind, ServerSettings, Settings};

/// Realistic browser User-Agent strings, rotated per request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
];

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Largest body we read before giving up on the rest of the page.
const MAX_PAGE_BYTES: usize = 5 * 1024 * 1024;

pub fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

/// Plain HTTP page fetcher with browser-like request headers.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpPageFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("page fetch http client: {e}")))?;
        Ok(Self {
            client,
            max_bytes: MAX_PAGE_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }
}

#[async_trait::async_trait]
impl PageFetcher for HttpPageFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::InvalidArgument(format!("invalid url {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidArgument(format!(
                "unsupported url scheme {:?}",
                parsed.scheme()
            )));
        }

        let resp = self
            .client
            .get(parsed)
            .timeout(timeout)
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .header(reqwest::header::ACCEPT, ACCEPT_HTML)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| Error::fetch(url, FetchFailureKind::Transport, e.to_string()))?;
        let status_code = resp.status().as_u16();

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::fetch(url, FetchFailureKind::Transport, e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                let can_take = self.max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                tracing::debug!(url, max_bytes = self.max_bytes, "page body truncated");
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            status_code,
            html: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

/// Build the page fetcher selected by `settings.fetch_backend`.
pub fn page_fetcher_for(cfg: &Settings) -> Result<Arc<dyn PageFetcher>> {
    Ok(match cfg.fetch_backend {
        FetchBackendKind::Http => Arc::new(HttpPageFetcher::new()?),
        FetchBackendKind::Browser => Arc::new(render::BrowserPageFetcher::from_env()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn random_user_agent_comes_from_the_rotation() {
        let ua = random_user_agent();
        assert!(USER_AGENTS.contains(&ua));
        assert!(ua.starts_with("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn http_fetcher_sends_browser_headers_and_reports_status() {
        let app = Router::new()
            .route(
                "/",
                get(|headers: axum::http::HeaderMap| async move {
                    let ua = headers
                        .get(header::USER_AGENT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let accept = headers
                        .get(header::ACCEPT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    (
                        [(header::CONTENT_TYPE, "text/html")],
                        format!("<p>{ua}</p><p>{accept}</p>"),
                    )
                }),
            )
            .route("/gone", get(|| async { (StatusCode::NOT_FOUND, "gone") }));
        let addr = serve(app).await;
        let f = HttpPageFetcher::new().unwrap();

        let page = f
            .fetch_page(&format!("http://{addr}/"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(page.is_success());
        assert!(page.html.contains("Mozilla/5.0"));
        assert!(page.html.contains("text/html"));

        let page = f
            .fetch_page(&format!("http://{addr}/gone"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(page.status_code, 404);
    }

    #[tokio::test]
    async fn http_fetcher_caps_body_size() {
        let app = Router::new().route("/", get(|| async { "x".repeat(10_000) }));
        let addr = serve(app).await;
        let f = HttpPageFetcher::new().unwrap().with_max_bytes(100);
        let page = f
            .fetch_page(&format!("http://{addr}/"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(page.html.len(), 100);
    }

    #[tokio::test]
    async fn http_fetcher_rejects_non_http_urls() {
        let f = HttpPageFetcher::new().unwrap();
        let err = f
            .fetch_page("file:///etc/passwd", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
