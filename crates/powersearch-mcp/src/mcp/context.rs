//! Pipeline capabilities backed by the requesting MCP peer.

use powersearch_core::{
    Error, MessageLevel, MessageSink, ProgressSink, Result, SamplingChannel, SamplingRequest,
};
use rmcp::model::{
    CreateMessageRequestParam, LoggingLevel, LoggingMessageNotificationParam,
    ProgressNotificationParam, ProgressToken,
};
use rmcp::{Peer, RoleServer};

const LOGGER: &str = "powersearch";

/// `maxTokens` is mandatory in `sampling/createMessage`; used when no limit is configured.
const DEFAULT_SAMPLING_MAX_TOKENS: u32 = 4096;

/// Whole numbers go out as JSON integers so either numeric progress representation decodes.
fn json_number(x: f64) -> serde_json::Value {
    if x.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&x) {
        serde_json::json!(x as u64)
    } else {
        serde_json::json!(x)
    }
}

/// `notifications/message` to the client, mirrored to tracing.
#[derive(Clone)]
pub(crate) struct McpMessageSink {
    peer: Peer<RoleServer>,
}

impl McpMessageSink {
    pub(crate) fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

#[async_trait::async_trait]
impl MessageSink for McpMessageSink {
    async fn notify(&self, level: MessageLevel, message: &str) {
        crate::log_message(level, message);
        let level = match level {
            MessageLevel::Info => LoggingLevel::Info,
            MessageLevel::Warning => LoggingLevel::Warning,
            MessageLevel::Error => LoggingLevel::Error,
        };
        let param = LoggingMessageNotificationParam {
            level,
            logger: Some(LOGGER.to_string()),
            data: serde_json::json!(message),
        };
        if let Err(e) = self.peer.notify_logging_message(param).await {
            tracing::debug!(error = %e, "dropping client log notification");
        }
    }
}

/// `notifications/progress`, only when the request carried a progress token.
#[derive(Clone)]
pub(crate) struct McpProgressSink {
    peer: Peer<RoleServer>,
    token: Option<ProgressToken>,
}

impl McpProgressSink {
    pub(crate) fn new(peer: Peer<RoleServer>, token: Option<ProgressToken>) -> Self {
        Self { peer, token }
    }
}

#[async_trait::async_trait]
impl ProgressSink for McpProgressSink {
    async fn report(&self, progress: f64, total: f64, message: Option<&str>) {
        tracing::debug!(progress, total, message, "progress");
        let Some(token) = &self.token else {
            return;
        };
        let raw = serde_json::json!({
            "progressToken": token,
            "progress": json_number(progress),
            "total": json_number(total),
            "message": message,
        });
        let param: ProgressNotificationParam = match serde_json::from_value(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "could not build progress notification");
                return;
            }
        };
        if let Err(e) = self.peer.notify_progress(param).await {
            tracing::debug!(error = %e, "dropping progress notification");
        }
    }
}

/// Whether the connected client declared the `sampling` capability at initialization.
pub(crate) fn client_can_sample(peer: &Peer<RoleServer>) -> bool {
    peer.peer_info()
        .and_then(|info| serde_json::to_value(info).ok())
        .is_some_and(|v| {
            v.pointer("/capabilities/sampling")
                .is_some_and(|s| !s.is_null())
        })
}

/// `sampling/createMessage` on the requesting peer.
#[derive(Clone)]
pub(crate) struct McpSampling {
    peer: Peer<RoleServer>,
}

impl McpSampling {
    pub(crate) fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

pub(crate) fn create_message_param(req: &SamplingRequest) -> Result<CreateMessageRequestParam> {
    let raw = serde_json::json!({
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": req.user_prompt},
        }],
        "systemPrompt": req.system_prompt,
        "temperature": req.temperature,
        "maxTokens": req.max_tokens.unwrap_or(DEFAULT_SAMPLING_MAX_TOKENS),
    });
    serde_json::from_value(raw).map_err(|e| Error::Sampling(format!("bad sampling request: {e}")))
}

/// The reply's text content, or the serialized content when it is not text.
pub(crate) fn reply_text(reply: &serde_json::Value) -> String {
    for p in ["/content/text", "/message/content/text"] {
        if let Some(s) = reply.pointer(p).and_then(|v| v.as_str()) {
            return s.to_string();
        }
    }
    reply
        .get("content")
        .or_else(|| reply.pointer("/message/content"))
        .map(|c| c.to_string())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl SamplingChannel for McpSampling {
    async fn sample(&self, req: &SamplingRequest) -> Result<String> {
        let param = create_message_param(req)?;
        let reply = self
            .peer
            .create_message(param)
            .await
            .map_err(|e| Error::Sampling(e.to_string()))?;
        let v = serde_json::to_value(&reply).map_err(|e| Error::Sampling(e.to_string()))?;
        Ok(reply_text(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_request_maps_onto_create_message() {
        let p = create_message_param(&SamplingRequest {
            user_prompt: "summarize".into(),
            system_prompt: "be brief".into(),
            temperature: 0.0,
            max_tokens: None,
        })
        .unwrap();
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["systemPrompt"], "be brief");
        assert_eq!(v["maxTokens"], DEFAULT_SAMPLING_MAX_TOKENS);
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["messages"][0]["content"]["text"], "summarize");
    }

    #[test]
    fn reply_text_prefers_text_content() {
        let v = serde_json::json!({
            "model": "m",
            "role": "assistant",
            "content": {"type": "text", "text": "hello"}
        });
        assert_eq!(reply_text(&v), "hello");

        let v = serde_json::json!({
            "role": "assistant",
            "content": {"type": "image", "data": "AAAA", "mimeType": "image/png"}
        });
        assert!(reply_text(&v).contains("image/png"));
    }

    #[test]
    fn whole_progress_values_are_integers() {
        assert_eq!(json_number(20.0), serde_json::json!(20));
        assert_eq!(json_number(100.0), serde_json::json!(100));
        assert_eq!(json_number(12.5), serde_json::json!(12.5));
    }
}
