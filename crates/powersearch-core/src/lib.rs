use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod filter;

/// Sub-kinds of an upstream search failure.
///
/// Callers see one error surface (`Error::Upstream`); the kind exists for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailureKind {
    Status,
    Transport,
    Decode,
    MissingField,
}

impl UpstreamFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::MissingField => "missing_field",
        }
    }
}

impl fmt::Display for UpstreamFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    /// The page-fetch primitive raised (connect/TLS/timeout/etc).
    Transport,
    /// The page answered outside 200..=299.
    Status(u16),
    /// Extraction produced no usable markdown.
    EmptyExtraction,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("search error: {message}")]
    Upstream {
        kind: UpstreamFailureKind,
        message: String,
    },
    #[error("failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        kind: FetchFailureKind,
        message: String,
    },
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    pub fn upstream(kind: UpstreamFailureKind, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind,
            message: message.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, kind: FetchFailureKind, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn upstream_kind(&self) -> Option<UpstreamFailureKind> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn fetch_kind(&self) -> Option<FetchFailureKind> {
        match self {
            Self::Fetch { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The underlying cause without the variant prefix (used when composing user messages).
    pub fn cause(&self) -> String {
        match self {
            Self::Upstream { message, .. } | Self::Fetch { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-range hints accepted by the upstream engine.
pub const VALID_TIME_RANGES: [&str; 3] = ["day", "month", "year"];

/// One search hit as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultRecord {
    pub title: String,
    pub url: String,
    /// Engine snippet, or fetched-and-cleaned markdown when the fetch strategy succeeded.
    pub content: String,
}

/// Upstream result as decoded from the engine's JSON.
///
/// Unknown fields are ignored; a missing or `null` score counts as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl RawResult {
    pub fn score(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    /// Build the caller-facing record, or `None` if the engine gave no URL.
    pub fn to_record(&self) -> Option<SearchResultRecord> {
        let url = self.url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(SearchResultRecord {
            title: self.title.clone().unwrap_or_default(),
            url: url.to_string(),
            content: self.content.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchSummary {
    pub summary: String,
    /// URLs of the summarized results, in result order (duplicates allowed).
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Fire-and-forget notifications back to whoever invoked the pipeline.
///
/// Implementations must tolerate concurrent calls: the fetch fan-out shares one sink.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    async fn notify(&self, level: MessageLevel, message: &str);

    async fn info(&self, message: &str) {
        self.notify(MessageLevel::Info, message).await
    }

    async fn warning(&self, message: &str) {
        self.notify(MessageLevel::Warning, message).await
    }

    async fn error(&self, message: &str) {
        self.notify(MessageLevel::Error, message).await
    }
}

#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: f64, total: f64, message: Option<&str>);
}

/// Sink that drops every message (library callers that do not care).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl MessageSink for NullSink {
    async fn notify(&self, _level: MessageLevel, _message: &str) {}
}

#[async_trait::async_trait]
impl ProgressSink for NullSink {
    async fn report(&self, _progress: f64, _total: f64, _message: Option<&str>) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub user_prompt: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

/// Client-side LLM connection. Treated as single-connection: callers never issue concurrent
/// requests on one channel.
#[async_trait::async_trait]
pub trait SamplingChannel: Send + Sync {
    async fn sample(&self, req: &SamplingRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status_code: u16,
    pub html: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }
}

/// Raw page acquisition (plain HTTP, headless browser, ...).
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage>;
}

/// Tuning knobs for boilerplate removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOptions {
    /// Output shorter than this (in chars) counts as "nothing extracted".
    pub min_extracted_size: usize,
    /// Paragraphs shorter than this are exempt from deduplication.
    pub min_duplcheck_size: usize,
    /// How many times an identical block may appear before further copies are dropped.
    pub max_repetitions: usize,
    pub include_links: bool,
    pub include_images: bool,
    pub include_tables: bool,
    pub include_comments: bool,
    pub include_formatting: bool,
    pub deduplicate: bool,
    pub favor_precision: bool,
    /// Seconds one extraction may run; `0` disables the limit. Timed-out extractions yield nothing.
    pub extraction_timeout_sec: f64,
    /// Scan the whole document for publication dates, not just metadata. The markdown output
    /// carries no metadata, so this does not change extracted text.
    pub extensive_date_search: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            min_extracted_size: 100,
            min_duplcheck_size: 100,
            max_repetitions: 2,
            include_links: false,
            include_images: false,
            include_tables: true,
            include_comments: false,
            include_formatting: false,
            deduplicate: true,
            favor_precision: true,
            extraction_timeout_sec: 0.0,
            extensive_date_search: true,
        }
    }
}

impl ExtractionOptions {
    pub fn extraction_timeout(&self) -> Option<Duration> {
        (self.extraction_timeout_sec > 0.0)
            .then(|| Duration::from_secs_f64(self.extraction_timeout_sec))
    }
}

/// Readability-style boilerplate removal producing markdown.
pub trait ContentExtractor: Send + Sync {
    fn extract_markdown(&self, html: &str, url: &str, opts: &ExtractionOptions) -> Option<String>;
}

/// Prefix-truncate to `max_chars` characters (not bytes).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}
