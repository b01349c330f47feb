//! Single-URL acquisition: page fetch, extraction, cleanup, optional cap.

use crate::extract::clean_markdown;
use powersearch_core::{
    truncate_chars, ContentExtractor, Error, ExtractionOptions, FetchFailureKind, MessageSink,
    PageFetcher, Result,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ContentFetcher {
    pages: Arc<dyn PageFetcher>,
    extractor: Arc<dyn ContentExtractor>,
    options: ExtractionOptions,
    content_limit: Option<usize>,
}

impl ContentFetcher {
    pub fn new(
        pages: Arc<dyn PageFetcher>,
        extractor: Arc<dyn ContentExtractor>,
        options: ExtractionOptions,
        content_limit: Option<usize>,
    ) -> Self {
        Self {
            pages,
            extractor,
            options,
            content_limit,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.pages.name()
    }

    /// Fetch one page and return its cleaned markdown.
    ///
    /// Every failure, including an empty extraction, is reported to `sink` and returned.
    pub async fn fetch_url(
        &self,
        sink: &dyn MessageSink,
        url: &str,
        timeout: Duration,
    ) -> Result<String> {
        match self.acquire(Some(sink), url, timeout).await? {
            Some(md) => Ok(md),
            None => {
                sink.error(&format!("No content extracted from {url}")).await;
                Err(Error::fetch(
                    url,
                    FetchFailureKind::EmptyExtraction,
                    "no content extracted",
                ))
            }
        }
    }

    /// Acquisition without the empty-extraction policy: `Ok(None)` means the page was fetched
    /// but nothing usable came out of it.
    ///
    /// Transport and status failures notify `sink` when one is given.
    pub(crate) async fn acquire(
        &self,
        sink: Option<&dyn MessageSink>,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let t0 = Instant::now();
        let out = match tokio::time::timeout(timeout, self.acquire_inner(sink, url, timeout)).await
        {
            Ok(r) => r,
            Err(_) => {
                let cause = format!("timed out after {}ms", timeout.as_millis());
                if let Some(sink) = sink {
                    sink.error(&format!("Fetch for {url} {cause}")).await;
                }
                Err(Error::fetch(url, FetchFailureKind::Transport, cause))
            }
        };
        tracing::debug!(
            url,
            backend = self.pages.name(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            ok = out.is_ok(),
            "content fetch finished"
        );
        out
    }

    async fn acquire_inner(
        &self,
        sink: Option<&dyn MessageSink>,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let page = match self.pages.fetch_page(url, timeout).await {
            Ok(p) => p,
            Err(e) => {
                if let Some(sink) = sink {
                    sink.error(&format!("Fetcher failed for {url}: {}", e.cause()))
                        .await;
                }
                return Err(match e {
                    Error::InvalidArgument(_) => e,
                    other => Error::fetch(url, FetchFailureKind::Transport, other.cause()),
                });
            }
        };

        if !page.is_success() {
            if let Some(sink) = sink {
                sink.error(&format!("Fetch for {url} returned status {}", page.status_code))
                    .await;
            }
            return Err(Error::fetch(
                url,
                FetchFailureKind::Status(page.status_code),
                format!("status {}", page.status_code),
            ));
        }

        let extractor = self.extractor.clone();
        let options = self.options.clone();
        let extraction_timeout = options.extraction_timeout();
        let url_owned = url.to_string();
        let task = tokio::task::spawn_blocking(move || {
            extractor.extract_markdown(&page.html, &url_owned, &options)
        });
        let joined = match extraction_timeout {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(j) => j,
                Err(_) => {
                    tracing::debug!(
                        url,
                        limit_ms = limit.as_millis() as u64,
                        "extraction timed out"
                    );
                    return Ok(None);
                }
            },
        };
        let extracted = joined.map_err(|e| {
            Error::fetch(
                url,
                FetchFailureKind::Transport,
                format!("extraction task failed: {e}"),
            )
        })?;

        let Some(md) = extracted else {
            return Ok(None);
        };
        let cleaned = clean_markdown(&md);
        if cleaned.is_empty() {
            return Ok(None);
        }
        Ok(Some(match self.content_limit {
            Some(limit) => truncate_chars(&cleaned, limit),
            None => cleaned,
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use powersearch_core::MessageLevel;

    fn fetcher(pages: StubPages, limit: Option<usize>) -> ContentFetcher {
        ContentFetcher::new(
            Arc::new(pages),
            Arc::new(EchoExtractor),
            ExtractionOptions::default(),
            limit,
        )
    }

    #[tokio::test]
    async fn success_is_cleaned_and_capped() {
        let pages = StubPages::default().with(
            "https://a",
            Canned::Page(200, "<p>Hello</p>\n\n\n\nWorld and more".to_string()),
        );
        let sink = RecordingSink::default();
        let f = fetcher(pages, Some(12));
        let md = f
            .fetch_url(&sink, "https://a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(md, "Hello\n\nWorld");
        assert!(sink.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_a_status_failure() {
        let pages = StubPages::default().with("https://a", Canned::Page(404, "nope".into()));
        let sink = RecordingSink::default();
        let err = fetcher(pages, None)
            .fetch_url(&sink, "https://a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchFailureKind::Status(404)));
        assert_eq!(err.to_string(), "failed to fetch https://a: status 404");
        let errors = sink.at(MessageLevel::Error);
        assert_eq!(errors, vec!["Fetch for https://a returned status 404".to_string()]);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_once() {
        let pages = StubPages::default().with("https://a", Canned::Fail("dns".into()));
        let sink = RecordingSink::default();
        let err = fetcher(pages, None)
            .fetch_url(&sink, "https://a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchFailureKind::Transport));
        let errors = sink.at(MessageLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Fetcher failed for https://a"));
    }

    #[tokio::test]
    async fn empty_extraction_fails_at_fetch_url_but_not_in_acquire() {
        let pages = StubPages::default().with("https://a", Canned::Page(200, "  <b></b> ".into()));
        let f = fetcher(pages, None);
        let sink = RecordingSink::default();
        let err = f
            .fetch_url(&sink, "https://a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchFailureKind::EmptyExtraction));
        assert_eq!(
            sink.at(MessageLevel::Error),
            vec!["No content extracted from https://a".to_string()]
        );

        let got = f
            .acquire(None, "https://a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn acquisition_is_bounded_by_the_timeout() {
        let pages =
            StubPages::default().with("https://slow", Canned::Slow(Duration::from_secs(5)));
        let sink = RecordingSink::default();
        let t0 = Instant::now();
        let err = fetcher(pages, None)
            .fetch_url(&sink, "https://slow", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(t0.elapsed() < Duration::from_secs(2));
        assert_eq!(err.fetch_kind(), Some(FetchFailureKind::Transport));
        assert_eq!(sink.at(MessageLevel::Error).len(), 1);
    }

    struct SlowExtractor;

    impl ContentExtractor for SlowExtractor {
        fn extract_markdown(
            &self,
            html: &str,
            _url: &str,
            _opts: &ExtractionOptions,
        ) -> Option<String> {
            std::thread::sleep(Duration::from_millis(400));
            Some(html.to_string())
        }
    }

    #[tokio::test]
    async fn extraction_timeout_counts_as_nothing_extracted() {
        let pages = Arc::new(
            StubPages::default().with("https://a", Canned::Page(200, "plenty of text".into())),
        );
        let f = ContentFetcher::new(
            pages.clone(),
            Arc::new(SlowExtractor),
            ExtractionOptions {
                extraction_timeout_sec: 0.05,
                ..ExtractionOptions::default()
            },
            None,
        );
        let sink = RecordingSink::default();
        let err = f
            .fetch_url(&sink, "https://a", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchFailureKind::EmptyExtraction));
        assert_eq!(pages.calls(), vec!["https://a".to_string()]);
    }

    #[tokio::test]
    async fn invalid_urls_stay_invalid_arguments() {
        let f = ContentFetcher::new(
            Arc::new(crate::HttpPageFetcher::new().unwrap()),
            Arc::new(EchoExtractor),
            ExtractionOptions::default(),
            None,
        );
        let sink = RecordingSink::default();
        let err = f
            .fetch_url(&sink, "file:///etc/hosts", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(sink.at(MessageLevel::Error).len(), 1);
    }
}
