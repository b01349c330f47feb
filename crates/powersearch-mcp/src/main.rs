use anyhow::Result;
use clap::{Parser, Subcommand};
use powersearch_core::{MessageLevel, MessageSink};
use powersearch_local::settings::{CacheStorage, SamplingFallback};
use powersearch_local::{PowerSearch, ServerSettings, Settings};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "powersearch")]
#[command(about = "Web search, page fetch and summarization (MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server.
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Run one search and print the results (json).
    Search(SearchCmd),
    /// Fetch one URL and print its cleaned markdown (json).
    Fetch(FetchCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    /// Search query.
    query: String,
    /// Recency hint. Allowed: day, month, year
    #[arg(long)]
    time_range: Option<String>,
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    /// Absolute http(s) URL.
    url: String,
    /// Per-page fetch timeout (ms).
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Attempt a local stdio MCP handshake (list_tools) to prove a client can start the server.
    ///
    /// Spawns a child `powersearch mcp-stdio` process and calls `list_tools`; no search is run.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    check_stdio: bool,
    /// Timeout for the stdio handshake (ms).
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Stderr logging. `RUST_LOG` wins, then `POWERSEARCH_LOG_LEVEL`, then `info`.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let lvl = std::env::var("POWERSEARCH_LOG_LEVEL").unwrap_or_default();
            EnvFilter::try_new(lvl.trim().to_ascii_lowercase())
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub(crate) fn log_message(level: MessageLevel, message: &str) {
    match level {
        MessageLevel::Info => tracing::info!("{message}"),
        MessageLevel::Warning => tracing::warn!("{message}"),
        MessageLevel::Error => tracing::error!("{message}"),
    }
}

/// Message sink for one-shot CLI commands.
struct TracingSink;

#[async_trait::async_trait]
impl MessageSink for TracingSink {
    async fn notify(&self, level: MessageLevel, message: &str) {
        log_message(level, message);
    }
}

fn cache_storage_str(c: Option<&CacheStorage>) -> String {
    match c {
        None => "off".to_string(),
        Some(CacheStorage::Memory) => "memory".to_string(),
        Some(CacheStorage::Null) => "null".to_string(),
        Some(CacheStorage::File(p)) => format!("file://{}", p.display()),
    }
}

fn sampling_fallback_str(f: Option<SamplingFallback>) -> Option<&'static str> {
    f.map(|f| match f {
        SamplingFallback::Fallback => "fallback",
        SamplingFallback::Always => "always",
    })
}

/// Effective settings without secret values.
fn settings_json(s: &Settings) -> serde_json::Value {
    serde_json::json!({
        "base_url": s.base_url,
        "engines": s.engines,
        "language": s.language,
        "safe_search": s.safe_search,
        "max_page": s.max_page,
        "filter_score_percentile": s.filter_score_percentile,
        "filter_top_k": s.filter_top_k,
        "content_strategy": s.content_strategy.as_str(),
        "content_limit": s.content_limit,
        "summary_content_limit": s.summary_content_limit,
        "summary_chunk_size": s.summary_chunk_size,
        "summary_temperature": s.summary_temperature,
        "summary_max_tokens": s.summary_max_tokens,
        "timeout_ms": s.timeout.as_millis() as u64,
        "http2": s.http2,
        "verify": s.verify,
        "fetch_backend": s.fetch_backend.as_str(),
        "extraction": s.extraction,
    })
}

fn server_settings_json(s: &ServerSettings) -> serde_json::Value {
    serde_json::json!({
        "log_level": s.log_level,
        "cache": cache_storage_str(s.cache.as_ref()),
        "cache_ttl_sec": s.cache_ttl_sec,
        "sampling_fallback": sampling_fallback_str(s.sampling_fallback),
        "openai": {
            "api_key": s.openai_api_key.is_some(),
            "base_url": s.openai_base_url.is_some(),
            "default_model": s.openai_default_model,
        },
    })
}

#[cfg(feature = "stdio")]
mod mcp {
    use super::*;
    use powersearch_core::SamplingChannel;
    use powersearch_local::cache::ResponseCache;
    use powersearch_local::openai_compat::OpenAiCompatClient;
    use powersearch_local::summarize::{self, SummarizeRequest, SummaryContext};
    use rmcp::{
        handler::server::router::prompt::PromptRouter as RmcpPromptRouter,
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{
            CallToolResult, Content, GetPromptRequestParam, GetPromptResult, ListPromptsResult,
            PaginatedRequestParam, PromptMessage, PromptMessageRole, ServerCapabilities,
            ServerInfo,
        },
        prompt, prompt_handler, prompt_router,
        service::RequestContext,
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, RoleServer, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::time::{Duration, Instant};

    const SCHEMA_VERSION: u64 = 1;
    const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

    #[path = "envelope.rs"]
    mod envelope;
    use envelope::*;

    #[path = "context.rs"]
    mod context;
    use context::{client_can_sample, McpMessageSink, McpProgressSink, McpSampling};

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Structured content for machine consumers, plus a text fallback for clients that only
        // read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    fn invalid_params(message: &str, hint: &str, request: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": error_obj(ErrorCode::InvalidParams, message, hint),
            "request": request,
        })
    }

    fn nonempty(s: Option<String>) -> Option<String> {
        s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct SearchArgs {
        /// What to search for.
        #[serde(default)]
        query: Option<String>,
        /// Optional recency hint. Allowed: day, month, year
        #[serde(default)]
        time_range: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct FetchUrlArgs {
        /// Absolute http(s) URL.
        #[serde(default)]
        url: Option<String>,
        /// Fetch timeout in milliseconds (default 10000).
        #[serde(default)]
        fetch_timeout_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct SummarizeSearchArgs {
        /// What to search for.
        #[serde(default)]
        query: Option<String>,
        /// What the caller wants to learn; steers the summary.
        #[serde(default)]
        intent: Option<String>,
        /// Optional recency hint. Allowed: day, month, year
        #[serde(default)]
        time_range: Option<String>,
        /// How many results to summarize (default: the configured top-k).
        #[serde(default)]
        max_results: Option<usize>,
        /// Summarize in chunks and merge the partial summaries (default false).
        #[serde(default)]
        map_reduce: Option<bool>,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    pub(crate) struct InternetSearchPromptArgs {
        /// What you are trying to find.
        goal: String,
        /// Optional recency bias: day, month, or year.
        #[serde(default)]
        time_range: Option<String>,
    }

    fn recency_hint(time_range: Option<&str>) -> String {
        match time_range.map(str::trim).filter(|s| !s.is_empty()) {
            Some(tr) => format!(" Include time_range='{tr}' if you need recent results."),
            None => String::new(),
        }
    }

    pub(crate) fn internet_search_text(goal: &str, time_range: Option<&str>) -> String {
        format!(
            "You can search the public web via the powersearch MCP server.\n\
             Goal: {goal}\n\
             - Call powersearch/search with the goal as the query.{}\n\
             - Results include cleaned content; call fetch_url only to refresh a specific URL.\n\
             - Summarize briefly and cite URLs; do not invent sources.",
            recency_hint(time_range)
        )
    }

    pub(crate) fn summarize_internet_search_text(goal: &str, time_range: Option<&str>) -> String {
        format!(
            "You can search and summarize the public web via the powersearch MCP server.\n\
             Goal: {goal}\n\
             - Call powersearch/summarize_search with the goal as both query and intent.{}\n\
             - Set map_reduce=true when you expect many long results.\n\
             - Keep the markdown citations from the summary; do not invent sources.",
            recency_hint(time_range)
        )
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum SamplerChoice {
        Client,
        Fallback,
        Unavailable,
    }

    /// `always` forces the configured fallback; otherwise the client LLM wins when it can sample.
    pub(crate) fn choose_sampler(
        behavior: Option<SamplingFallback>,
        client_can_sample: bool,
        fallback_configured: bool,
    ) -> SamplerChoice {
        match (behavior, client_can_sample, fallback_configured) {
            (Some(SamplingFallback::Always), _, true) => SamplerChoice::Fallback,
            (_, true, _) => SamplerChoice::Client,
            (_, false, true) => SamplerChoice::Fallback,
            (_, false, false) => SamplerChoice::Unavailable,
        }
    }

    #[derive(Clone)]
    pub(crate) struct PowerSearchMcp {
        tool_router: RmcpToolRouter<Self>,
        prompt_router: RmcpPromptRouter<Self>,
        pipeline: Arc<PowerSearch>,
        server: Arc<ServerSettings>,
        cache: Option<ResponseCache>,
        fallback: Option<Arc<OpenAiCompatClient>>,
    }

    #[tool_router]
    impl PowerSearchMcp {
        pub(crate) fn new() -> Result<Self, McpError> {
            let settings = Settings::from_env()
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            let server = ServerSettings::from_env()
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            let pipeline = PowerSearch::from_settings(Arc::new(settings))
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            let fallback = OpenAiCompatClient::from_settings(&server)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            Ok(Self::with_parts(Arc::new(pipeline), server, fallback))
        }

        pub(crate) fn with_parts(
            pipeline: Arc<PowerSearch>,
            server: ServerSettings,
            fallback: Option<OpenAiCompatClient>,
        ) -> Self {
            let cache = server
                .cache
                .as_ref()
                .map(|c| ResponseCache::new(c, server.cache_ttl_sec));
            Self {
                tool_router: Self::tool_router(),
                prompt_router: Self::prompt_router(),
                pipeline,
                server: Arc::new(server),
                cache,
                fallback: fallback.map(Arc::new),
            }
        }

        /// Serve `run` from the response cache when possible; only `ok: true` payloads are stored.
        async fn with_cache<F>(
            &self,
            kind: &str,
            request: &serde_json::Value,
            run: F,
        ) -> serde_json::Value
        where
            F: std::future::Future<Output = serde_json::Value>,
        {
            let Some(cache) = &self.cache else {
                return run.await;
            };
            let key = ResponseCache::key_for(kind, request);
            match cache.get(&key).await {
                Ok(Some(mut hit)) => {
                    hit["cache"] = serde_json::json!({"hit": true, "backend": cache.backend()});
                    return hit;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, kind, "cache read failed"),
            }
            let mut payload = run.await;
            if payload["ok"].as_bool() == Some(true) {
                if let Err(e) = cache.put(&key, &payload).await {
                    tracing::warn!(error = %e, kind, "cache write failed");
                }
            }
            payload["cache"] = serde_json::json!({"hit": false, "backend": cache.backend()});
            payload
        }

        fn sampler_for(
            &self,
            ctx: &RequestContext<RoleServer>,
        ) -> Option<(Arc<dyn SamplingChannel>, &'static str)> {
            let choice = choose_sampler(
                self.server.sampling_fallback,
                client_can_sample(&ctx.peer),
                self.fallback.is_some(),
            );
            match choice {
                SamplerChoice::Client => {
                    let client: Arc<dyn SamplingChannel> =
                        Arc::new(McpSampling::new(ctx.peer.clone()));
                    Some((client, "client"))
                }
                SamplerChoice::Fallback => self
                    .fallback
                    .clone()
                    .map(|c| (c as Arc<dyn SamplingChannel>, "fallback")),
                SamplerChoice::Unavailable => None,
            }
        }

        #[tool(
            description = "Search the web through SearXNG. Returns ranked results (title, url, content); content is the page text when full-page fetching is enabled."
        )]
        async fn search(
            &self,
            params: Parameters<Option<SearchArgs>>,
            ctx: RequestContext<RoleServer>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = Instant::now();
            let args = params.0.unwrap_or_default();
            let time_range = nonempty(args.time_range);
            let Some(query) = nonempty(args.query) else {
                let mut payload = invalid_params(
                    "query must be non-empty",
                    "Pass a search query string.",
                    serde_json::json!({"query": null, "time_range": time_range}),
                );
                add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            };
            let request = serde_json::json!({"query": query, "time_range": time_range});

            let sink = McpMessageSink::new(ctx.peer.clone());
            let mut payload = self
                .with_cache("search", &request, async {
                    match self
                        .pipeline
                        .search(&sink, &query, time_range.as_deref())
                        .await
                    {
                        Ok(results) => serde_json::json!({
                            "ok": true,
                            "query": query,
                            "count": results.len(),
                            "results": results,
                            "request": request,
                        }),
                        Err(e) => error_payload(&e, request.clone()),
                    }
                })
                .await;
            add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }

        #[tool(description = "Fetch one URL and return its main content as cleaned markdown.")]
        async fn fetch_url(
            &self,
            params: Parameters<Option<FetchUrlArgs>>,
            ctx: RequestContext<RoleServer>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = Instant::now();
            let args = params.0.unwrap_or_default();
            let timeout_ms = args.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
            let url = nonempty(args.url);
            let request = serde_json::json!({"url": url, "fetch_timeout_ms": timeout_ms});
            let invalid = match (&url, timeout_ms) {
                (None, _) => Some((
                    "url must be non-empty",
                    "Pass an absolute URL like https://example.com.",
                )),
                (Some(_), 0) => Some(("fetch_timeout_ms must be > 0", "Omit it to use 10000.")),
                _ => None,
            };
            if let Some((message, hint)) = invalid {
                let mut payload = invalid_params(message, hint, request);
                add_envelope_fields(&mut payload, "fetch_url", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            }
            let url = url.unwrap_or_default();

            let sink = McpMessageSink::new(ctx.peer.clone());
            let mut payload = self
                .with_cache("fetch_url", &request, async {
                    match self
                        .pipeline
                        .fetch_url(&sink, &url, Duration::from_millis(timeout_ms))
                        .await
                    {
                        Ok(content) => serde_json::json!({
                            "ok": true,
                            "url": url,
                            "content": content,
                            "request": request,
                        }),
                        Err(e) => error_payload(&e, request.clone()),
                    }
                })
                .await;
            add_envelope_fields(&mut payload, "fetch_url", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }

        #[tool(
            description = "Search the web and summarize the results with the client's LLM (MCP sampling), keeping markdown citations. Set map_reduce=true for large result sets."
        )]
        async fn summarize_search(
            &self,
            params: Parameters<Option<SummarizeSearchArgs>>,
            ctx: RequestContext<RoleServer>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = Instant::now();
            let args = params.0.unwrap_or_default();
            let req = SummarizeRequest {
                query: nonempty(args.query).unwrap_or_default(),
                intent: args.intent.unwrap_or_default().trim().to_string(),
                time_range: nonempty(args.time_range),
                max_results: args.max_results,
                map_reduce: args.map_reduce.unwrap_or(false),
            };
            let request = serde_json::json!({
                "query": req.query,
                "intent": req.intent,
                "time_range": req.time_range,
                "max_results": req.max_results,
                "map_reduce": req.map_reduce,
            });
            if req.query.is_empty() {
                let mut payload = invalid_params(
                    "query must be non-empty",
                    "Pass a search query string.",
                    request,
                );
                add_envelope_fields(&mut payload, "summarize_search", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            }

            let Some((sampler, sampler_kind)) = self.sampler_for(&ctx) else {
                let mut payload = serde_json::json!({
                    "ok": false,
                    "error": error_obj(
                        ErrorCode::NotSupported,
                        "the client does not support sampling and no fallback LLM is configured",
                        "Use an MCP client with sampling, or set POWERSEARCH_OPENAI_API_KEY (or POWERSEARCH_OPENAI_BASE_URL) and POWERSEARCH_OPENAI_DEFAULT_MODEL."
                    ),
                    "request": request,
                });
                add_envelope_fields(&mut payload, "summarize_search", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            };

            let messages = McpMessageSink::new(ctx.peer.clone());
            let progress = McpProgressSink::new(ctx.peer.clone(), ctx.meta.get_progress_token());
            let cx = SummaryContext {
                messages: &messages,
                progress: &progress,
                sampler: &*sampler,
            };
            let mut payload = match summarize::summarize_search(&self.pipeline, &cx, &req).await {
                Ok(s) => serde_json::json!({
                    "ok": true,
                    "summary": s.summary,
                    "sources": s.sources,
                    "sampler": sampler_kind,
                    "request": request,
                }),
                Err(e) => {
                    let mut p = error_payload(&e, request);
                    p["sampler"] = serde_json::json!(sampler_kind);
                    p
                }
            };
            add_envelope_fields(&mut payload, "summarize_search", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }
    }

    #[prompt_router]
    impl PowerSearchMcp {
        /// Lightweight prompt for agents to run a web lookup with the search tools.
        #[prompt(name = "internet_search_prompt", title = "Internet Search")]
        async fn internet_search_prompt(
            &self,
            params: Parameters<InternetSearchPromptArgs>,
        ) -> Vec<PromptMessage> {
            let args = params.0;
            vec![PromptMessage::new_text(
                PromptMessageRole::User,
                internet_search_text(&args.goal, args.time_range.as_deref()),
            )]
        }

        /// Prompt for agents to search and get a cited summary in one call.
        #[prompt(
            name = "summarize_internet_search_prompt",
            title = "Summarize Internet Search"
        )]
        async fn summarize_internet_search_prompt(
            &self,
            params: Parameters<InternetSearchPromptArgs>,
        ) -> Vec<PromptMessage> {
            let args = params.0;
            vec![PromptMessage::new_text(
                PromptMessageRole::User,
                summarize_internet_search_text(&args.goal, args.time_range.as_deref()),
            )]
        }
    }

    #[tool_handler]
    #[prompt_handler]
    impl rmcp::ServerHandler for PowerSearchMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Web search via SearXNG. `search` returns ranked results, `fetch_url` returns one page as markdown, `summarize_search` searches and summarizes with your LLM via sampling. Outputs are schema-versioned JSON."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder()
                    .enable_tools()
                    .enable_prompts()
                    .enable_logging()
                    .build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio() -> Result<(), McpError> {
        let svc = PowerSearchMcp::new()?;
        tracing::info!(
            base_url = %svc.pipeline.settings().base_url,
            fetch_backend = svc.pipeline.fetcher().backend_name(),
            cache = svc.cache.as_ref().map(|c| c.backend()).unwrap_or("off"),
            "starting mcp stdio server"
        );
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        fn svc(server: ServerSettings) -> PowerSearchMcp {
            let pipeline = PowerSearch::from_settings(Arc::new(Settings::default())).unwrap();
            PowerSearchMcp::with_parts(Arc::new(pipeline), server, None)
        }

        #[test]
        fn sampler_choice_follows_capability_and_fallback_behavior() {
            use SamplerChoice::*;
            assert_eq!(choose_sampler(None, true, false), Client);
            assert_eq!(choose_sampler(None, true, true), Client);
            assert_eq!(choose_sampler(None, false, true), Fallback);
            assert_eq!(choose_sampler(None, false, false), Unavailable);
            assert_eq!(
                choose_sampler(Some(SamplingFallback::Fallback), true, true),
                Client
            );
            assert_eq!(
                choose_sampler(Some(SamplingFallback::Always), true, true),
                Fallback
            );
            // `always` without a configured client cannot force anything.
            assert_eq!(
                choose_sampler(Some(SamplingFallback::Always), true, false),
                Client
            );
        }

        #[tokio::test]
        async fn cache_serves_repeat_calls_and_skips_failures() {
            let svc = svc(ServerSettings {
                cache: Some(CacheStorage::Memory),
                cache_ttl_sec: 60,
                ..Default::default()
            });
            let runs = AtomicUsize::new(0);
            let req = serde_json::json!({"query": "rust"});

            for _ in 0..2 {
                let v = svc
                    .with_cache("search", &req, async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        serde_json::json!({"ok": true, "results": []})
                    })
                    .await;
                assert_eq!(v["ok"], true);
            }
            assert_eq!(runs.load(Ordering::SeqCst), 1);

            let bad = serde_json::json!({"query": "broken"});
            for _ in 0..2 {
                let v = svc
                    .with_cache("search", &bad, async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        serde_json::json!({"ok": false})
                    })
                    .await;
                assert_eq!(v["cache"]["hit"], false);
            }
            assert_eq!(runs.load(Ordering::SeqCst), 3);
        }

        #[test]
        fn prompt_text_carries_goal_and_recency_hint() {
            let t = internet_search_text("find docs", Some("month"));
            assert!(t.contains("Goal: find docs"));
            assert!(t.contains("time_range='month'"));
            assert!(t.contains("powersearch/search"));

            let t = internet_search_text("find docs", Some("  "));
            assert!(!t.contains("time_range="));

            let t = summarize_internet_search_text("rust async", Some("day"));
            assert!(t.contains("Goal: rust async"));
            assert!(t.contains("time_range='day'"));
            assert!(t.contains("summarize_search"));
        }

        #[test]
        fn both_prompts_are_routed() {
            let names: Vec<String> = svc(ServerSettings::default())
                .prompt_router
                .list_all()
                .into_iter()
                .map(|p| p.name)
                .collect();
            assert!(names.contains(&"internet_search_prompt".to_string()));
            assert!(names.contains(&"summarize_internet_search_prompt".to_string()));
        }

        #[tokio::test]
        async fn without_cache_every_call_runs() {
            let svc = svc(ServerSettings::default());
            let v = svc
                .with_cache("fetch_url", &serde_json::json!({}), async {
                    serde_json::json!({"ok": true})
                })
                .await;
            assert!(v.get("cache").is_none());
        }

        #[test]
        fn server_info_advertises_tools_prompts_and_logging() {
            use rmcp::ServerHandler;
            let info = svc(ServerSettings::default()).get_info();
            assert!(info.capabilities.tools.is_some());
            assert!(info.capabilities.prompts.is_some());
            assert!(info.capabilities.logging.is_some());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = powersearch_local::settings::load_env_file();
    init_tracing();
    if let Some(p) = &env_file {
        tracing::debug!(path = %p.display(), "loaded env file");
    }

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Search(args) => {
            let t0 = std::time::Instant::now();
            let settings = Arc::new(Settings::from_env()?);
            let ps = PowerSearch::from_settings(settings)?;
            let results = ps
                .search(&TracingSink, &args.query, args.time_range.as_deref())
                .await?;
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "search",
                "ok": true,
                "query": args.query,
                "count": results.len(),
                "results": results,
                "elapsed_ms": t0.elapsed().as_millis() as u64,
            });
            println!("{payload}");
        }
        Commands::Fetch(args) => {
            let t0 = std::time::Instant::now();
            let settings = Arc::new(Settings::from_env()?);
            let ps = PowerSearch::from_settings(settings)?;
            let content = ps
                .fetch_url(
                    &TracingSink,
                    &args.url,
                    std::time::Duration::from_millis(args.timeout_ms.max(1)),
                )
                .await?;
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "fetch_url",
                "ok": true,
                "url": args.url,
                "content": content,
                "elapsed_ms": t0.elapsed().as_millis() as u64,
            });
            println!("{payload}");
        }
        Commands::Doctor(args) => {
            let t0 = std::time::Instant::now();
            let mut checks: Vec<serde_json::Value> = Vec::new();

            let settings = Settings::from_env();
            checks.push(serde_json::json!({
                "name": "settings_valid",
                "ok": settings.is_ok(),
                "error": settings.as_ref().err().map(|e| e.to_string()),
                "hint": if settings.is_ok() { "" } else { "Fix the POWERSEARCH_* variables listed in the error." },
            }));
            let server = ServerSettings::from_env();
            checks.push(serde_json::json!({
                "name": "server_settings_valid",
                "ok": server.is_ok(),
                "error": server.as_ref().err().map(|e| e.to_string()),
                "hint": if server.is_ok() { "" } else { "Check POWERSEARCH_CACHE and POWERSEARCH_SAMPLING_FALLBACK." },
            }));
            let fallback = server.as_ref().ok().map(|s| {
                powersearch_local::openai_compat::OpenAiCompatClient::from_settings(s)
            });
            let fallback_configured = matches!(fallback, Some(Ok(Some(_))));
            if let Some(Err(e)) = &fallback {
                checks.push(serde_json::json!({
                    "name": "sampling_fallback",
                    "ok": false,
                    "error": e.to_string(),
                    "hint": "Set POWERSEARCH_OPENAI_DEFAULT_MODEL alongside the API key/base URL.",
                }));
            }

            // Check: stdio MCP handshake (optional).
            let mut stdio_ok: Option<bool> = None;
            let mut stdio_tool_count: Option<usize> = None;
            let mut stdio_error: Option<serde_json::Value> = None;
            let mut stdio_elapsed_ms: Option<u128> = None;

            #[cfg(feature = "stdio")]
            if args.check_stdio {
                use rmcp::service::ServiceExt;
                use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
                use tokio::process::Command;

                let exe = std::env::current_exe()
                    .unwrap_or_else(|_| std::path::PathBuf::from("powersearch"));
                let child = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
                    cmd.args(["mcp-stdio"]);
                    cmd.env("RUST_LOG", "error");
                }))?;

                let service = ().serve(child).await?;
                let check_t0 = std::time::Instant::now();
                let res = tokio::time::timeout(
                    std::time::Duration::from_millis(args.timeout_ms),
                    service.list_tools(Default::default()),
                )
                .await;
                stdio_elapsed_ms = Some(check_t0.elapsed().as_millis());

                match res {
                    Ok(Ok(tools)) => {
                        stdio_ok = Some(true);
                        stdio_tool_count = Some(tools.tools.len());
                    }
                    Ok(Err(e)) => {
                        stdio_ok = Some(false);
                        stdio_error = Some(serde_json::json!({
                            "code": "handshake_failed",
                            "message": e.to_string(),
                            "hint": "The child closed the stdio transport early. Check that nothing prints to stdout in mcp-stdio mode and that the settings above are valid."
                        }));
                    }
                    Err(_) => {
                        stdio_ok = Some(false);
                        stdio_error = Some(serde_json::json!({
                            "code": "timeout",
                            "message": format!("list_tools timed out after {}ms", args.timeout_ms),
                            "hint": "Increase --timeout-ms or run `powersearch mcp-stdio` manually to see startup errors."
                        }));
                    }
                }
                let _ = service.cancel().await;
            }

            let skipped = stdio_ok.is_none();
            checks.push(serde_json::json!({
                "name": "mcp_stdio_handshake",
                "ok": stdio_ok.unwrap_or(true),
                "skipped": skipped,
                "tool_count": stdio_tool_count,
                "elapsed_ms": stdio_elapsed_ms,
                "error": stdio_error,
            }));

            let ok = checks
                .iter()
                .all(|c| c["ok"].as_bool().unwrap_or(false));
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": ok,
                "name": "powersearch",
                "version": env!("CARGO_PKG_VERSION"),
                "elapsed_ms": t0.elapsed().as_millis() as u64,
                "features": { "stdio": cfg!(feature = "stdio") },
                "env_file": env_file.as_ref().map(|p| p.display().to_string()),
                "settings": settings.as_ref().ok().map(settings_json),
                "server": server.as_ref().ok().map(server_settings_json),
                "configured": { "sampling_fallback": fallback_configured },
                "checks": checks,
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!(
                        "powersearch {} ({})",
                        env!("CARGO_PKG_VERSION"),
                        if ok { "ok" } else { "problems found" }
                    );
                    for c in payload["checks"].as_array().into_iter().flatten() {
                        println!(
                            "- {}: {}",
                            c["name"].as_str().unwrap_or("?"),
                            if c["ok"].as_bool().unwrap_or(false) { "ok" } else { "FAIL" }
                        );
                    }
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "powersearch",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("powersearch {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn doctor_settings_json_has_no_secret_values() {
        let server = ServerSettings {
            openai_api_key: Some("sk-secret".into()),
            cache: Some(CacheStorage::Memory),
            ..Default::default()
        };
        let v = server_settings_json(&server);
        assert_eq!(v["openai"]["api_key"], true);
        assert_eq!(v["cache"], "memory");
        assert!(!v.to_string().contains("sk-secret"));

        let s = settings_json(&Settings::default());
        assert_eq!(s["content_strategy"], "fetch");
        assert_eq!(s["timeout_ms"], 20_000);
    }
}
