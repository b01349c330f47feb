//! Search orchestration: validate, query SearXNG, filter, optionally replace snippets with page
//! content.

use crate::extract::ReadabilityExtractor;
use crate::fetch::ContentFetcher;
use crate::searxng::SearxngClient;
use crate::settings::{ContentStrategy, Settings};
use powersearch_core::filter::{filter_by_percentile, filter_by_top_k};
use powersearch_core::{
    truncate_chars, ContentExtractor, Error, MessageSink, PageFetcher, RawResult, Result,
    SearchResultRecord, UpstreamFailureKind, VALID_TIME_RANGES,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upstream timeout used when the whole budget is already spent.
const MIN_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(100);
/// Floor for each content fetch.
const MIN_FETCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Prefix-truncate every record's content to `limit` characters.
fn apply_content_limit(records: &mut [SearchResultRecord], limit: Option<usize>) {
    if let Some(limit) = limit {
        for r in records {
            r.content = truncate_chars(&r.content, limit);
        }
    }
}

pub struct PowerSearch {
    settings: Arc<Settings>,
    upstream: SearxngClient,
    fetcher: ContentFetcher,
}

impl PowerSearch {
    pub fn new(
        settings: Arc<Settings>,
        pages: Arc<dyn PageFetcher>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> Result<Self> {
        settings.validate()?;
        let upstream = SearxngClient::new(&settings)?;
        let fetcher = ContentFetcher::new(
            pages,
            extractor,
            settings.extraction.clone(),
            settings.content_limit,
        );
        Ok(Self {
            settings,
            upstream,
            fetcher,
        })
    }

    /// Wire the configured page-fetch backend and the default extractor.
    pub fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let pages = crate::page_fetcher_for(&settings)?;
        Self::new(settings, pages, Arc::new(ReadabilityExtractor::default()))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn upstream(&self) -> &SearxngClient {
        &self.upstream
    }

    pub fn fetcher(&self) -> &ContentFetcher {
        &self.fetcher
    }

    /// Run a web search and return filtered records.
    ///
    /// Only `InvalidArgument` and `Upstream` errors escape; per-URL fetch failures are reported
    /// to `sink` and the snippet is kept.
    pub async fn search(
        &self,
        sink: &dyn MessageSink,
        query: &str,
        time_range: Option<&str>,
    ) -> Result<Vec<SearchResultRecord>> {
        self.search_started_at(sink, query, time_range, Instant::now())
            .await
    }

    /// Fetch a single URL as markdown.
    pub async fn fetch_url(
        &self,
        sink: &dyn MessageSink,
        url: &str,
        timeout: Duration,
    ) -> Result<String> {
        self.fetcher.fetch_url(sink, url, timeout).await
    }

    fn remaining(&self, started: Instant) -> Duration {
        self.settings.timeout.saturating_sub(started.elapsed())
    }

    pub(crate) async fn search_started_at(
        &self,
        sink: &dyn MessageSink,
        query: &str,
        time_range: Option<&str>,
        started: Instant,
    ) -> Result<Vec<SearchResultRecord>> {
        if let Some(tr) = time_range {
            if !VALID_TIME_RANGES.contains(&tr) {
                let msg = format!(
                    "Invalid time_range '{tr}'. Choose one of ['day', 'month', 'year']."
                );
                sink.error(&msg).await;
                return Err(Error::InvalidArgument(msg));
            }
        }

        let mut upstream_timeout = self.remaining(started);
        if upstream_timeout.is_zero() {
            sink.warning("No remaining timeout budget; using minimal upstream timeout")
                .await;
            upstream_timeout = MIN_UPSTREAM_TIMEOUT;
        }

        let t_up = Instant::now();
        let raw = match self.upstream.search(query, time_range, upstream_timeout).await {
            Ok(r) => r,
            Err(e) => {
                self.report_upstream_failure(sink, &e, t_up.elapsed()).await;
                return Err(e);
            }
        };
        tracing::debug!(
            results = raw.len(),
            elapsed_ms = t_up.elapsed().as_millis() as u64,
            "searxng query finished"
        );

        if raw.is_empty() {
            sink.warning("Search returned zero results").await;
            return Ok(Vec::new());
        }

        let kept = filter_by_percentile(&raw, self.settings.filter_score_percentile);
        let kept = filter_by_top_k(&kept, self.settings.filter_top_k);
        let mut records: Vec<SearchResultRecord> =
            kept.iter().filter_map(RawResult::to_record).collect();
        if records.is_empty() {
            sink.warning("Search returned no results after filtering").await;
            return Ok(Vec::new());
        }

        match &self.settings.content_strategy {
            ContentStrategy::Quick => {}
            ContentStrategy::Fetch => self.populate_content(sink, &mut records, started).await,
            ContentStrategy::Unknown(s) => {
                tracing::warn!(strategy = %s, "unknown content strategy");
                sink.warning("Unknown content strategy, defaulting to 'quick'.")
                    .await;
            }
        }

        apply_content_limit(&mut records, self.settings.content_limit);
        Ok(records)
    }

    async fn report_upstream_failure(&self, sink: &dyn MessageSink, e: &Error, elapsed: Duration) {
        let Error::Upstream { kind, message } = e else {
            sink.error(&format!("Search error: {e}")).await;
            return;
        };
        let msg = match kind {
            UpstreamFailureKind::Status | UpstreamFailureKind::Transport => format!(
                "SearXNG request failed after {:.2}s: {message}",
                elapsed.as_secs_f64()
            ),
            UpstreamFailureKind::MissingField | UpstreamFailureKind::Decode => {
                format!("Search error: {message}")
            }
        };
        tracing::warn!(kind = %kind, error = %message, "searxng query failed");
        sink.error(&msg).await;
    }

    /// Replace each record's snippet with fetched markdown, concurrently, in place.
    async fn populate_content(
        &self,
        sink: &dyn MessageSink,
        records: &mut [SearchResultRecord],
        started: Instant,
    ) {
        let remaining = self.remaining(started);
        if remaining.is_zero() {
            sink.warning("No remaining timeout budget; skipping content fetch")
                .await;
            return;
        }
        let per_fetch = remaining.max(MIN_FETCH_TIMEOUT);

        let t0 = Instant::now();
        let outcomes = futures::future::join_all(
            records
                .iter()
                .map(|r| self.fetcher.acquire(None, &r.url, per_fetch)),
        )
        .await;

        let mut fetched = 0usize;
        for (record, outcome) in records.iter_mut().zip(outcomes) {
            match outcome {
                Ok(Some(md)) => {
                    record.content = md;
                    fetched += 1;
                }
                Ok(None) => {
                    sink.warning(&format!(
                        "No content extracted from {}; returning empty content",
                        record.url
                    ))
                    .await;
                    record.content.clear();
                }
                Err(e) => {
                    sink.error(&format!("Error fetching {}: {}", record.url, e.cause()))
                        .await;
                }
            }
        }
        tracing::debug!(
            fetched,
            total = records.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "content population finished"
        );
    }
}
