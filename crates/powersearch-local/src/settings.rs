//! Process configuration, read once from `POWERSEARCH_*` environment variables.
//!
//! Loading goes through a lookup function so tests can feed a map instead of mutating the
//! process environment.

use powersearch_core::{Error, ExtractionOptions, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "POWERSEARCH_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentStrategy {
    /// Return engine snippets verbatim.
    Quick,
    /// Replace snippets with fetched page markdown.
    Fetch,
    /// Unrecognized value; warned about at search time and treated as `Quick`.
    Unknown(String),
}

impl ContentStrategy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Self::Quick,
            "fetch" => Self::Fetch,
            _ => Self::Unknown(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Quick => "quick",
            Self::Fetch => "fetch",
            Self::Unknown(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBackendKind {
    Http,
    Browser,
}

impl FetchBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Browser => "browser",
        }
    }
}

/// Search pipeline settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub engines: Vec<String>,
    pub language: String,
    pub safe_search: u8,
    pub max_page: u32,
    /// `None` disables the percentile cutoff.
    pub filter_score_percentile: Option<f64>,
    pub filter_top_k: usize,
    pub content_strategy: ContentStrategy,
    /// Character cap applied to every returned record.
    pub content_limit: Option<usize>,
    /// Character cap applied to each record inside summarization prompts.
    pub summary_content_limit: Option<usize>,
    pub summary_chunk_size: usize,
    pub summary_temperature: f64,
    pub summary_max_tokens: Option<u32>,
    /// Total budget for one search call (upstream query plus content fetches).
    pub timeout: Duration,
    pub http2: bool,
    pub verify: bool,
    pub fetch_backend: FetchBackendKind,
    pub extraction: ExtractionOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9876".to_string(),
            engines: Vec::new(),
            language: "en".to_string(),
            safe_search: 1,
            max_page: 1,
            filter_score_percentile: Some(75.0),
            filter_top_k: 10,
            content_strategy: ContentStrategy::Fetch,
            content_limit: None,
            summary_content_limit: None,
            summary_chunk_size: 4,
            summary_temperature: 0.0,
            summary_max_tokens: Some(800),
            timeout: Duration::from_secs(20),
            http2: false,
            verify: true,
            fetch_backend: FetchBackendKind::Http,
            extraction: ExtractionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingFallback {
    /// Use the configured LLM only when the client cannot sample.
    Fallback,
    /// Always use the configured LLM, even when the client can sample.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStorage {
    Memory,
    Null,
    File(PathBuf),
}

/// Settings that only matter to the MCP server wrapper.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub log_level: Option<String>,
    pub cache: Option<CacheStorage>,
    pub cache_ttl_sec: u64,
    pub sampling_fallback: Option<SamplingFallback>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_default_model: Option<String>,
}

/// Seed the process environment from an env file without overriding existing variables.
///
/// `POWERSEARCH_DOTENV=0` disables this; `POWERSEARCH_ENV_FILE` picks the file (default `.env`).
/// Returns the path that was loaded, if any.
pub fn load_env_file() -> Option<PathBuf> {
    let disabled = std::env::var("POWERSEARCH_DOTENV")
        .ok()
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"));
    if disabled {
        return None;
    }
    let path = std::env::var("POWERSEARCH_ENV_FILE")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".env"));
    match dotenvy::from_path(&path) {
        Ok(()) => Some(path),
        Err(e) if e.not_found() => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable env file");
            None
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(s) => s
                .parse::<T>()
                .map_err(|e| Error::Config(format!("{ENV_PREFIX}{key}={s:?}: {e}"))),
        }
    }

    /// Like `parse`, but `none`/`null` map to `None`.
    fn parse_opt<T: std::str::FromStr>(&self, key: &str, default: Option<T>) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(s) if matches!(s.to_ascii_lowercase().as_str(), "none" | "null") => Ok(None),
            Some(s) => s
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::Config(format!("{ENV_PREFIX}{key}={s:?}: {e}"))),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.raw(key) {
            None => Ok(default),
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::Config(format!(
                    "{ENV_PREFIX}{key}={s:?}: expected a boolean"
                ))),
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let d = Self::default();
        let dx = ExtractionOptions::default();

        let timeout_sec: f64 = env.parse("TIMEOUT_SEC", d.timeout.as_secs_f64())?;
        if !(timeout_sec.is_finite() && timeout_sec > 0.0) {
            return Err(Error::Config(format!(
                "{ENV_PREFIX}TIMEOUT_SEC must be > 0, got {timeout_sec}"
            )));
        }

        let fetch_backend = match env.raw("FETCH_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => d.fetch_backend,
            Some(s) if s == "http" => FetchBackendKind::Http,
            Some(s) if s == "browser" => FetchBackendKind::Browser,
            Some(s) => {
                return Err(Error::Config(format!(
                    "{ENV_PREFIX}FETCH_BACKEND={s:?}: expected http or browser"
                )))
            }
        };

        let out = Self {
            base_url: env.raw("BASE_URL").unwrap_or(d.base_url),
            engines: env
                .raw("ENGINES")
                .map(|s| {
                    s.split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            language: env.raw("LANGUAGE").unwrap_or(d.language),
            safe_search: env.parse("SAFE_SEARCH", d.safe_search)?,
            max_page: env.parse("MAX_PAGE", d.max_page)?,
            filter_score_percentile: env
                .parse_opt("FILTER_SCORE_PERCENTILE", d.filter_score_percentile)?,
            filter_top_k: env.parse("FILTER_TOP_K", d.filter_top_k)?,
            content_strategy: env
                .raw("CONTENT_STRATEGY")
                .map(|s| ContentStrategy::parse(&s))
                .unwrap_or(d.content_strategy),
            content_limit: env.parse_opt("CONTENT_LIMIT", d.content_limit)?,
            summary_content_limit: env
                .parse_opt("SUMMARY_CONTENT_LIMIT", d.summary_content_limit)?,
            summary_chunk_size: env.parse("SUMMARY_CHUNK_SIZE", d.summary_chunk_size)?,
            summary_temperature: env.parse("SUMMARY_TEMPERATURE", d.summary_temperature)?,
            summary_max_tokens: env.parse_opt("SUMMARY_MAX_TOKENS", d.summary_max_tokens)?,
            timeout: Duration::from_secs_f64(timeout_sec),
            http2: env.flag("HTTP2", d.http2)?,
            verify: env.flag("VERIFY", d.verify)?,
            fetch_backend,
            extraction: ExtractionOptions {
                min_extracted_size: env
                    .parse("EXTRACT_MIN_EXTRACTED_SIZE", dx.min_extracted_size)?,
                min_duplcheck_size: env
                    .parse("EXTRACT_MIN_DUPLCHECK_SIZE", dx.min_duplcheck_size)?,
                max_repetitions: env.parse("EXTRACT_MAX_REPETITIONS", dx.max_repetitions)?,
                include_links: env.flag("EXTRACT_INCLUDE_LINKS", dx.include_links)?,
                include_images: env.flag("EXTRACT_INCLUDE_IMAGES", dx.include_images)?,
                include_tables: env.flag("EXTRACT_INCLUDE_TABLES", dx.include_tables)?,
                include_comments: env.flag("EXTRACT_INCLUDE_COMMENTS", dx.include_comments)?,
                include_formatting: env
                    .flag("EXTRACT_INCLUDE_FORMATTING", dx.include_formatting)?,
                deduplicate: env.flag("EXTRACT_DEDUPLICATE", dx.deduplicate)?,
                favor_precision: env.flag("EXTRACT_FAVOR_PRECISION", dx.favor_precision)?,
                extraction_timeout_sec: env
                    .parse("EXTRACT_EXTRACTION_TIMEOUT", dx.extraction_timeout_sec)?,
                extensive_date_search: env
                    .flag("EXTRACT_EXTENSIVE_DATE_SEARCH", dx.extensive_date_search)?,
            },
        };
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        let u = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("base_url {:?}: {e}", self.base_url)))?;
        if !matches!(u.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "base_url must be http(s), got {:?}",
                self.base_url
            )));
        }
        if self.safe_search > 2 {
            return Err(Error::Config("safe_search must be 0, 1 or 2".to_string()));
        }
        if self.max_page < 1 {
            return Err(Error::Config("max_page must be >= 1".to_string()));
        }
        if let Some(p) = self.filter_score_percentile {
            if !(0.0..=100.0).contains(&p) {
                return Err(Error::Config(format!(
                    "filter_score_percentile must be within 0..=100, got {p}"
                )));
            }
        }
        if self.filter_top_k < 1 {
            return Err(Error::Config("filter_top_k must be >= 1".to_string()));
        }
        if self.summary_chunk_size < 1 {
            return Err(Error::Config("summary_chunk_size must be >= 1".to_string()));
        }
        if !(0.0..=2.0).contains(&self.summary_temperature) {
            return Err(Error::Config(format!(
                "summary_temperature must be within 0..=2, got {}",
                self.summary_temperature
            )));
        }
        if self.summary_max_tokens == Some(0) {
            return Err(Error::Config("summary_max_tokens must be >= 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be > 0".to_string()));
        }
        let et = self.extraction.extraction_timeout_sec;
        if !(et.is_finite() && et >= 0.0) {
            return Err(Error::Config(format!(
                "extraction_timeout must be >= 0, got {et}"
            )));
        }
        Ok(())
    }
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let cache = match env.raw("CACHE") {
            None => None,
            Some(s) => Some(parse_cache_storage(&s)?),
        };
        let sampling_fallback = match env.raw("SAMPLING_FALLBACK").map(|s| s.to_ascii_lowercase()) {
            None => None,
            Some(s) if s == "fallback" => Some(SamplingFallback::Fallback),
            Some(s) if s == "always" => Some(SamplingFallback::Always),
            Some(s) => {
                return Err(Error::Config(format!(
                    "{ENV_PREFIX}SAMPLING_FALLBACK={s:?}: expected fallback or always"
                )))
            }
        };
        Ok(Self {
            log_level: env.raw("LOG_LEVEL"),
            cache,
            cache_ttl_sec: env.parse("CACHE_TTL_SEC", 3600u64)?,
            sampling_fallback,
            openai_api_key: env.raw("OPENAI_API_KEY"),
            openai_base_url: env.raw("OPENAI_BASE_URL"),
            openai_default_model: env.raw("OPENAI_DEFAULT_MODEL"),
        })
    }
}

fn parse_cache_storage(s: &str) -> Result<CacheStorage> {
    let lc = s.to_ascii_lowercase();
    if lc == "memory" {
        return Ok(CacheStorage::Memory);
    }
    if lc == "null" || lc == "none" {
        return Ok(CacheStorage::Null);
    }
    if let Some(path) = s.strip_prefix("file://") {
        if path.trim().is_empty() {
            return Err(Error::Config("CACHE=file:// needs a directory".to_string()));
        }
        return Ok(CacheStorage::File(PathBuf::from(path)));
    }
    if lc.starts_with("redis://") || lc.starts_with("rediss://") {
        return Err(Error::NotSupported(
            "redis cache storage is not available in this build".to_string(),
        ));
    }
    Err(Error::Config(format!(
        "{ENV_PREFIX}CACHE={s:?}: expected memory, null or file://<dir>"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.base_url, "http://127.0.0.1:9876");
        assert_eq!(s.filter_score_percentile, Some(75.0));
        assert_eq!(s.filter_top_k, 10);
        assert_eq!(s.content_strategy, ContentStrategy::Fetch);
        assert_eq!(s.summary_chunk_size, 4);
        assert_eq!(s.summary_max_tokens, Some(800));
        assert_eq!(s.timeout, Duration::from_secs(20));
        assert_eq!(s.fetch_backend, FetchBackendKind::Http);
        assert_eq!(s.extraction, ExtractionOptions::default());
    }

    #[test]
    fn overrides_and_none_values_are_parsed() {
        let s = Settings::from_lookup(lookup(&[
            ("ENGINES", "duckduckgo, ,brave"),
            ("FILTER_SCORE_PERCENTILE", "none"),
            ("CONTENT_STRATEGY", "Quick"),
            ("CONTENT_LIMIT", "500"),
            ("SUMMARY_MAX_TOKENS", "null"),
            ("TIMEOUT_SEC", "2.5"),
            ("EXTRACT_INCLUDE_LINKS", "yes"),
            ("FETCH_BACKEND", "browser"),
        ]))
        .unwrap();
        assert_eq!(s.engines, vec!["duckduckgo", "brave"]);
        assert_eq!(s.filter_score_percentile, None);
        assert_eq!(s.content_strategy, ContentStrategy::Quick);
        assert_eq!(s.content_limit, Some(500));
        assert_eq!(s.summary_max_tokens, None);
        assert_eq!(s.timeout, Duration::from_millis(2500));
        assert!(s.extraction.include_links);
        assert_eq!(s.fetch_backend, FetchBackendKind::Browser);
    }

    #[test]
    fn extraction_timeout_and_date_search_knobs() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.extraction.extraction_timeout(), None);
        assert!(s.extraction.extensive_date_search);

        let s = Settings::from_lookup(lookup(&[
            ("EXTRACT_EXTRACTION_TIMEOUT", "1.5"),
            ("EXTRACT_EXTENSIVE_DATE_SEARCH", "off"),
        ]))
        .unwrap();
        assert_eq!(
            s.extraction.extraction_timeout(),
            Some(Duration::from_millis(1500))
        );
        assert!(!s.extraction.extensive_date_search);
    }

    #[test]
    fn unknown_strategy_is_kept_verbatim() {
        let s = Settings::from_lookup(lookup(&[("CONTENT_STRATEGY", "deep")])).unwrap();
        assert_eq!(s.content_strategy, ContentStrategy::Unknown("deep".to_string()));
        assert_eq!(s.content_strategy.as_str(), "deep");
    }

    #[test]
    fn out_of_range_values_are_config_errors() {
        for (k, v) in [
            ("SAFE_SEARCH", "3"),
            ("MAX_PAGE", "0"),
            ("FILTER_SCORE_PERCENTILE", "101"),
            ("FILTER_TOP_K", "0"),
            ("SUMMARY_CHUNK_SIZE", "0"),
            ("SUMMARY_TEMPERATURE", "2.5"),
            ("TIMEOUT_SEC", "0"),
            ("BASE_URL", "ftp://example.com"),
            ("HTTP2", "maybe"),
            ("FETCH_BACKEND", "curl"),
            ("EXTRACT_EXTRACTION_TIMEOUT", "-1"),
        ] {
            let err = Settings::from_lookup(lookup(&[(k, v)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{k}={v} gave {err:?}");
        }
    }

    #[test]
    fn server_settings_parse_cache_and_fallback() {
        let s = ServerSettings::from_lookup(lookup(&[
            ("CACHE", "file:///tmp/ps-cache"),
            ("SAMPLING_FALLBACK", "always"),
            ("OPENAI_DEFAULT_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();
        assert_eq!(s.cache, Some(CacheStorage::File(PathBuf::from("/tmp/ps-cache"))));
        assert_eq!(s.cache_ttl_sec, 3600);
        assert_eq!(s.sampling_fallback, Some(SamplingFallback::Always));
        assert_eq!(s.openai_default_model.as_deref(), Some("gpt-4o-mini"));

        let err = ServerSettings::from_lookup(lookup(&[("CACHE", "redis://localhost")]))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
