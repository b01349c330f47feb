//! OpenAI-compatible chat completions client, used as the server-side sampling fallback.

use crate::settings::ServerSettings;
use powersearch_core::{Error, Result, SamplingChannel, SamplingRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("openai http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// `Ok(None)` when neither an API key nor a base URL is configured.
    pub fn from_settings(s: &ServerSettings) -> Result<Option<Self>> {
        if s.openai_api_key.is_none() && s.openai_base_url.is_none() {
            return Ok(None);
        }
        let model = s.openai_default_model.clone().ok_or_else(|| {
            Error::NotConfigured(
                "missing model for the sampling fallback (set POWERSEARCH_OPENAI_DEFAULT_MODEL)"
                    .to_string(),
            )
        })?;
        let base_url = s
            .openai_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, s.openai_api_key.clone(), model).map(Some)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Accepts both `https://host` and `https://host/v1` style base URLs.
    fn endpoint_chat_completions(&self) -> String {
        let b = self.base_url.trim_end_matches('/');
        if b.ends_with("/v1") {
            format!("{b}/chat/completions")
        } else {
            format!("{b}/v1/chat/completions")
        }
    }

    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature,
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Sampling(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Sampling(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::Sampling(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl SamplingChannel for OpenAiCompatClient {
    async fn sample(&self, req: &SamplingRequest) -> Result<String> {
        self.chat(
            &req.system_prompt,
            &req.user_prompt,
            req.max_tokens,
            Some(req.temperature),
        )
        .await
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
