//! Search-then-summarize through a client-provided LLM.
//!
//! Small result sets go out as one prompt. With `map_reduce` and more results than
//! `summary_chunk_size`, each chunk is summarized on its own (strictly one call at a time) and
//! a final call merges the partial summaries.

use crate::search::PowerSearch;
use powersearch_core::{
    truncate_chars, MessageSink, ProgressSink, Result, SamplingChannel, SamplingRequest,
    SearchResultRecord, SearchSummary,
};

pub const SYSTEM_PROMPT: &str = "You summarize web search results for an AI agent. Preserve factual accuracy and keep citations as markdown links using the provided URLs. Prefer concise, actionable language. If sources disagree, call that out. Do not invent facts or sources.";

pub const RESULTS_JSON_INSTRUCTION: &str = "Search results are provided as JSON under \"search-results\", where each item has fields: result (ordinal), url, and content (markdown).";

pub const SUMMARY_INSTRUCTION: &str = "Write a single markdown summary that combines all results. Use inline markdown citations that link to the provided URLs.";

const PROGRESS_TOTAL: f64 = 100.0;

#[derive(Debug, Clone, Default)]
pub struct SummarizeRequest {
    pub query: String,
    pub intent: String,
    pub time_range: Option<String>,
    /// Defaults to the configured top-k when unset or zero.
    pub max_results: Option<usize>,
    pub map_reduce: bool,
}

/// Who to talk to while summarizing.
pub struct SummaryContext<'a> {
    pub messages: &'a dyn MessageSink,
    pub progress: &'a dyn ProgressSink,
    pub sampler: &'a dyn SamplingChannel,
}

/// Render records as the `{"search-results": [...]}` block embedded in prompts.
pub fn render_results(results: &[SearchResultRecord]) -> String {
    let items: Vec<serde_json::Value> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            serde_json::json!({
                "result": i + 1,
                "url": r.url,
                "content": r.content,
            })
        })
        .collect();
    serde_json::to_string_pretty(&serde_json::json!({ "search-results": items }))
        .unwrap_or_default()
}

/// Progress value reported before summarizing chunk `idx` (1-based) of `total`.
pub fn chunk_progress(idx: usize, total: usize) -> f64 {
    let step = 60.0 / total.max(1) as f64;
    20.0 + (idx.saturating_sub(1) as f64 * step).floor()
}

fn single_pass_prompt(query: &str, intent: &str, results: &[SearchResultRecord]) -> String {
    format!(
        "Query: {query}\nIntent: {intent}\n{RESULTS_JSON_INSTRUCTION}\n{SUMMARY_INSTRUCTION}\n\
         Summarize the search results below using markdown links for citations.\n\n{}",
        render_results(results)
    )
}

fn chunk_prompt(query: &str, intent: &str, chunk: &[SearchResultRecord]) -> String {
    format!(
        "Query: {query}\nIntent: {intent}\n{RESULTS_JSON_INSTRUCTION}\n\
         Summarize this subset of search results as a single markdown answer. \
         Use inline markdown citations that link to the provided URLs.\n\n{}",
        render_results(chunk)
    )
}

fn reduce_prompt(query: &str, intent: &str, partials: &[String]) -> String {
    let blocks: Vec<String> = partials
        .iter()
        .enumerate()
        .map(|(i, s)| format!("Chunk {}:\n{s}", i + 1))
        .collect();
    format!(
        "Query: {query}\nIntent: {intent}\n{SUMMARY_INSTRUCTION}\n\
         Combine the partial summaries into a single concise markdown answer. \
         Preserve or re-add markdown citations linking to the search result URLs.\n\n{}",
        blocks.join("\n\n")
    )
}

async fn sample(
    search: &PowerSearch,
    sampler: &dyn SamplingChannel,
    prompt: String,
) -> Result<String> {
    let s = search.settings();
    sampler
        .sample(&SamplingRequest {
            user_prompt: prompt,
            system_prompt: SYSTEM_PROMPT.to_string(),
            temperature: s.summary_temperature,
            max_tokens: s.summary_max_tokens,
        })
        .await
}

/// Search, then summarize the results with the caller's sampling channel.
///
/// Search errors and sampling errors propagate unchanged; nothing is retried.
pub async fn summarize_search(
    search: &PowerSearch,
    cx: &SummaryContext<'_>,
    req: &SummarizeRequest,
) -> Result<SearchSummary> {
    cx.progress
        .report(0.0, PROGRESS_TOTAL, Some("Searching the web"))
        .await;
    let results = search
        .search(cx.messages, &req.query, req.time_range.as_deref())
        .await?;

    if results.is_empty() {
        cx.messages
            .warning("No search results available to summarize")
            .await;
        cx.progress
            .report(PROGRESS_TOTAL, PROGRESS_TOTAL, Some("No results"))
            .await;
        return Ok(SearchSummary::default());
    }

    let settings = search.settings();
    let max_results = req
        .max_results
        .filter(|n| *n > 0)
        .unwrap_or(settings.filter_top_k);
    let mut trimmed: Vec<SearchResultRecord> = results.into_iter().take(max_results).collect();
    if let Some(limit) = settings.summary_content_limit {
        for r in &mut trimmed {
            r.content = truncate_chars(&r.content, limit);
        }
    }

    cx.progress
        .report(15.0, PROGRESS_TOTAL, Some("Summarizing results"))
        .await;

    let chunk_size = settings.summary_chunk_size.max(1);
    let summary = if req.map_reduce && trimmed.len() > chunk_size {
        let chunks: Vec<&[SearchResultRecord]> = trimmed.chunks(chunk_size).collect();
        let n = chunks.len();
        let mut partials = Vec::with_capacity(n);
        for (i, chunk) in chunks.iter().enumerate() {
            let idx = i + 1;
            let label = format!("Summarizing chunk {idx}/{n}");
            cx.progress
                .report(chunk_progress(idx, n), PROGRESS_TOTAL, Some(label.as_str()))
                .await;
            let prompt = chunk_prompt(&req.query, &req.intent, chunk);
            partials.push(sample(search, cx.sampler, prompt).await?);
        }
        tracing::debug!(chunks = n, "reducing partial summaries");
        let prompt = reduce_prompt(&req.query, &req.intent, &partials);
        sample(search, cx.sampler, prompt).await?
    } else {
        let prompt = single_pass_prompt(&req.query, &req.intent, &trimmed);
        sample(search, cx.sampler, prompt).await?
    };

    cx.progress
        .report(PROGRESS_TOTAL, PROGRESS_TOTAL, Some("Summary complete"))
        .await;

    Ok(SearchSummary {
        summary: summary.trim().to_string(),
        sources: trimmed.into_iter().map(|r| r.url).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::*;
    use crate::settings::{ContentStrategy, Settings};
    use axum::{routing::get, Json, Router};
    use powersearch_core::{Error, MessageLevel};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedSampler {
        prompts: Mutex<Vec<SamplingRequest>>,
        fail_on: Option<usize>,
    }

    impl ScriptedSampler {
        fn prompts(&self) -> Vec<SamplingRequest> {
            self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl SamplingChannel for ScriptedSampler {
        async fn sample(&self, req: &SamplingRequest) -> Result<String> {
            let n = {
                let mut p = self.prompts.lock().unwrap();
                p.push(req.clone());
                p.len()
            };
            if self.fail_on == Some(n) {
                return Err(Error::Sampling("client refused".to_string()));
            }
            Ok(format!("  summary #{n}  "))
        }
    }

    async fn fixture(n: usize) -> String {
        let results: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "title": format!("T{i}"),
                    "url": format!("https://r{i}.test/"),
                    "content": format!("content number {i} for the summary"),
                    "score": (n - i) as f64,
                })
            })
            .collect();
        let body = serde_json::json!({ "results": results });
        let app = Router::new().route("/search", get(move || async move { Json(body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn pipeline(base: &str, chunk_size: usize) -> PowerSearch {
        let s = Settings {
            base_url: base.to_string(),
            filter_score_percentile: None,
            content_strategy: ContentStrategy::Quick,
            summary_chunk_size: chunk_size,
            ..Settings::default()
        };
        PowerSearch::new(Arc::new(s), Arc::new(StubPages::default()), Arc::new(EchoExtractor))
            .unwrap()
    }

    fn request(map_reduce: bool) -> SummarizeRequest {
        SummarizeRequest {
            query: "rust async".to_string(),
            intent: "learn".to_string(),
            map_reduce,
            ..Default::default()
        }
    }

    #[test]
    fn chunk_progress_spreads_over_twenty_to_eighty() {
        assert_eq!(chunk_progress(1, 3), 20.0);
        assert_eq!(chunk_progress(2, 3), 40.0);
        assert_eq!(chunk_progress(3, 3), 60.0);
        assert_eq!(chunk_progress(1, 1), 20.0);
        assert_eq!(chunk_progress(7, 7), 71.0);
    }

    #[test]
    fn results_block_uses_one_based_ordinals() {
        let rs = vec![SearchResultRecord {
            title: "t".into(),
            url: "https://a".into(),
            content: "c".into(),
        }];
        let v: serde_json::Value = serde_json::from_str(&render_results(&rs)).unwrap();
        assert_eq!(v["search-results"][0]["result"], 1);
        assert_eq!(v["search-results"][0]["url"], "https://a");
        assert!(v["search-results"][0].get("title").is_none());
    }

    #[tokio::test]
    async fn map_reduce_issues_one_call_per_chunk_plus_reduce() {
        let base = fixture(2).await;
        let ps = pipeline(&base, 1);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let out = summarize_search(&ps, &cx, &request(true)).await.unwrap();

        let prompts = sampler.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].user_prompt.contains("https://r0.test/"));
        assert!(!prompts[0].user_prompt.contains("https://r1.test/"));
        // Partials go into the reduce prompt exactly as sampled.
        assert!(prompts[2].user_prompt.contains("Chunk 1:\n  summary #1  \n\nChunk 2:"));
        assert!(prompts[2].user_prompt.contains("Chunk 2:\n  summary #2  "));
        assert!(prompts.iter().all(|p| p.system_prompt == SYSTEM_PROMPT));
        assert!(prompts.iter().all(|p| p.max_tokens == Some(800)));

        assert_eq!(out.summary, "summary #3");
        assert_eq!(out.sources, vec!["https://r0.test/", "https://r1.test/"]);

        let progress = sink.progress();
        let values: Vec<f64> = progress.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(values, vec![0.0, 15.0, 20.0, 50.0, 100.0]);
        assert!(progress.iter().all(|(_, t, _)| *t == 100.0));
        assert_eq!(progress[3].2.as_deref(), Some("Summarizing chunk 2/2"));
    }

    #[tokio::test]
    async fn single_pass_when_results_fit_in_one_chunk() {
        let base = fixture(3).await;
        let ps = pipeline(&base, 4);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let out = summarize_search(&ps, &cx, &request(true)).await.unwrap();
        let prompts = sampler.prompts();
        assert_eq!(prompts.len(), 1);
        let p = &prompts[0].user_prompt;
        assert!(p.starts_with("Query: rust async\nIntent: learn\n"));
        assert!(p.contains(RESULTS_JSON_INSTRUCTION));
        assert!(p.contains(SUMMARY_INSTRUCTION));
        assert!(p.contains("\"search-results\""));
        assert_eq!(out.summary, "summary #1");
        assert_eq!(out.sources.len(), 3);

        let values: Vec<f64> = sink.progress().iter().map(|(p, _, _)| *p).collect();
        assert_eq!(values, vec![0.0, 15.0, 100.0]);
    }

    #[tokio::test]
    async fn without_map_reduce_many_results_still_take_one_call() {
        let base = fixture(3).await;
        let ps = pipeline(&base, 1);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let out = summarize_search(&ps, &cx, &request(false)).await.unwrap();

        let prompts = sampler.prompts();
        assert_eq!(prompts.len(), 1);
        for i in 0..3 {
            assert!(prompts[0].user_prompt.contains(&format!("https://r{i}.test/")));
        }
        assert!(!prompts[0].user_prompt.contains("Chunk 1:"));
        assert_eq!(out.summary, "summary #1");
        assert_eq!(out.sources.len(), 3);

        let values: Vec<f64> = sink.progress().iter().map(|(p, _, _)| *p).collect();
        assert_eq!(values, vec![0.0, 15.0, 100.0]);
    }

    #[tokio::test]
    async fn max_results_and_summary_limit_shape_the_prompt() {
        let base = fixture(5).await;
        let s = Settings {
            base_url: base.clone(),
            filter_score_percentile: None,
            content_strategy: ContentStrategy::Quick,
            summary_content_limit: Some(10),
            ..Settings::default()
        };
        let ps = PowerSearch::new(
            Arc::new(s),
            Arc::new(StubPages::default()),
            Arc::new(EchoExtractor),
        )
        .unwrap();
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let req = SummarizeRequest {
            max_results: Some(2),
            ..request(false)
        };
        let out = summarize_search(&ps, &cx, &req).await.unwrap();
        assert_eq!(out.sources, vec!["https://r0.test/", "https://r1.test/"]);
        let p = &sampler.prompts()[0].user_prompt;
        assert!(p.contains("\"content\": \"content nu\""));
        assert!(!p.contains("https://r2.test/"));
    }

    #[tokio::test]
    async fn empty_search_short_circuits_without_sampling() {
        let base = fixture(0).await;
        let ps = pipeline(&base, 4);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let out = summarize_search(&ps, &cx, &request(true)).await.unwrap();
        assert_eq!(out, SearchSummary::default());
        assert!(sampler.prompts().is_empty());
        let progress = sink.progress();
        assert_eq!(
            progress.last().cloned(),
            Some((100.0, 100.0, Some("No results".to_string())))
        );
        assert!(!sink.at(MessageLevel::Warning).is_empty());
    }

    #[tokio::test]
    async fn sampling_failure_mid_map_propagates() {
        let base = fixture(3).await;
        let ps = pipeline(&base, 1);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler {
            fail_on: Some(2),
            ..Default::default()
        };
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let err = summarize_search(&ps, &cx, &request(true)).await.unwrap_err();
        assert!(matches!(err, Error::Sampling(_)));
        assert_eq!(sampler.prompts().len(), 2);
    }

    #[tokio::test]
    async fn search_errors_propagate_before_sampling() {
        let base = fixture(3).await;
        let ps = pipeline(&base, 1);
        let sink = RecordingSink::default();
        let sampler = ScriptedSampler::default();
        let cx = SummaryContext {
            messages: &sink,
            progress: &sink,
            sampler: &sampler,
        };
        let req = SummarizeRequest {
            time_range: Some("week".to_string()),
            ..request(false)
        };
        let err = summarize_search(&ps, &cx, &req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(sampler.prompts().is_empty());
    }
}
