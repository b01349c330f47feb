use powersearch_core::{Error, FetchFailureKind};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    SearchFailed,
    FetchFailed,
    SamplingFailed,
    NotSupported,
    NotConfigured,
    CacheError,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::SearchFailed => "search_failed",
            Self::FetchFailed => "fetch_failed",
            Self::SamplingFailed => "sampling_failed",
            Self::NotSupported => "not_supported",
            Self::NotConfigured => "not_configured",
            Self::CacheError => "cache_error",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::SearchFailed | Self::FetchFailed | Self::SamplingFailed | Self::CacheError => {
                true
            }
            // Configuration + invalid input are not retryable without changing something.
            Self::InvalidParams
            | Self::NotSupported
            | Self::NotConfigured
            | Self::UnexpectedError => false,
        }
    }
}

pub(crate) fn error_code_for(e: &Error) -> ErrorCode {
    match e {
        Error::InvalidArgument(_) => ErrorCode::InvalidParams,
        Error::Upstream { .. } => ErrorCode::SearchFailed,
        Error::Fetch { .. } => ErrorCode::FetchFailed,
        Error::Sampling(_) => ErrorCode::SamplingFailed,
        Error::Cache(_) => ErrorCode::CacheError,
        Error::NotConfigured(_) => ErrorCode::NotConfigured,
        Error::NotSupported(_) => ErrorCode::NotSupported,
        Error::Config(_) => ErrorCode::UnexpectedError,
    }
}

fn hint_for(e: &Error) -> &'static str {
    match e {
        Error::InvalidArgument(_) => "Fix the arguments and retry (time_range must be day, month or year).",
        Error::Upstream { .. } => {
            "Check that SearXNG is reachable at POWERSEARCH_BASE_URL and has the json output format enabled."
        }
        Error::Fetch { kind, .. } => match kind {
            FetchFailureKind::Status(_) => {
                "The page answered with an error status. Check the URL or retry later."
            }
            FetchFailureKind::EmptyExtraction => {
                "The page had no extractable main content. Try POWERSEARCH_FETCH_BACKEND=browser or POWERSEARCH_EXTRACT_FAVOR_PRECISION=false."
            }
            FetchFailureKind::Transport => {
                "The page could not be retrieved in time. Raise fetch_timeout_ms or retry later."
            }
        },
        Error::Sampling(_) => "The LLM behind the sampling channel failed; retry or check the client model.",
        Error::Cache(_) => "Check POWERSEARCH_CACHE (memory, null or file://<dir>) and directory permissions.",
        Error::NotConfigured(_) => "Set the missing configuration (see `powersearch doctor`).",
        Error::NotSupported(_) => "This capability is not available in the current setup.",
        Error::Config(_) => "Fix the POWERSEARCH_* environment and restart the server.",
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(super::SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    // `request` is always present: null or object.
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

/// `ok: false` payload for a domain error.
pub(crate) fn error_payload(e: &Error, request: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "error": error_obj(error_code_for(e), e, hint_for(e)),
        "request": request,
    })
}
