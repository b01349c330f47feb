use crate::settings::Settings;
use powersearch_core::{Error, RawResult, Result, UpstreamFailureKind};
use serde::Deserialize;
use std::time::Duration;

/// Thin client for a SearXNG instance's JSON API.
#[derive(Debug, Clone)]
pub struct SearxngClient {
    client: reqwest::Client,
    endpoint: String,
    language: String,
    safe_search: u8,
    max_page: u32,
    engines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<serde_json::Value>,
}

impl SearxngClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut b = reqwest::Client::builder()
            .user_agent(concat!("powersearch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10));
        if !settings.http2 {
            b = b.http1_only();
        }
        if !settings.verify {
            b = b.danger_accept_invalid_certs(true);
        }
        let client = b
            .build()
            .map_err(|e| Error::Config(format!("searxng http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: Self::endpoint_search_for(&settings.base_url),
            language: settings.language.clone(),
            safe_search: settings.safe_search,
            max_page: settings.max_page,
            engines: settings.engines.clone(),
        })
    }

    pub fn endpoint_search_for(base: &str) -> String {
        let b = base.trim().trim_end_matches('/');
        if b.ends_with("/search") {
            b.to_string()
        } else {
            format!("{b}/search")
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn query_params(&self, query: &str, time_range: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("q", query.to_string()),
            ("language", self.language.clone()),
            ("safesearch", self.safe_search.to_string()),
            ("max_page", self.max_page.to_string()),
            ("format", "json".to_string()),
        ];
        if !self.engines.is_empty() {
            params.push(("engines", self.engines.join(",")));
        }
        if let Some(tr) = time_range {
            params.push(("time_range", tr.to_string()));
        }
        params
    }

    /// One GET against `<base>/search`. Results come back undecorated, in engine order.
    pub async fn search(
        &self,
        query: &str,
        time_range: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<RawResult>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&self.query_params(query, time_range))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::upstream(UpstreamFailureKind::Transport, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::upstream(
                UpstreamFailureKind::Status,
                format!(
                    "status={} reason={}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("unknown")
                ),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::upstream(UpstreamFailureKind::Transport, e.to_string()))?;
        parse_search_body(&body)
    }
}

/// Decode a SearXNG JSON body into raw results.
pub fn parse_search_body(body: &str) -> Result<Vec<RawResult>> {
    let parsed: SearxngSearchResponse = serde_json::from_str(body).map_err(|e| {
        Error::upstream(
            UpstreamFailureKind::Decode,
            format!("invalid JSON from SearXNG: {e}"),
        )
    })?;
    let Some(results) = parsed.results else {
        return Err(Error::upstream(
            UpstreamFailureKind::MissingField,
            "'results' not found in SearXNG response",
        ));
    };
    serde_json::from_value::<Vec<RawResult>>(results).map_err(|e| {
        Error::upstream(
            UpstreamFailureKind::Decode,
            format!("unexpected 'results' shape: {e}"),
        )
    })
}
