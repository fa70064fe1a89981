//! Answer generation endpoints.
//!
//! `inference` talks to the local inference server's `POST /chat`;
//! `openai` talks to any OpenAI-compatible `/v1/chat/completions`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use harness_core::error::BackendError;
use harness_core::synthesize::{Generator, Prompt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::http::{openai_api_key, JsonClient};

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _: &Prompt, _: u32, _: f32) -> Result<String, BackendError> {
        Err(BackendError::unavailable("generation provider is disabled"))
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

fn messages(prompt: &Prompt) -> [ChatMessage<'_>; 2] {
    [
        ChatMessage {
            role: "system",
            content: &prompt.system,
        },
        ChatMessage {
            role: "user",
            content: &prompt.user,
        },
    ]
}

// ============ Local inference server ============

pub struct InferenceGenerator {
    model: String,
    url: String,
    client: JsonClient,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct InferenceResponse {
    response: String,
}

impl InferenceGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.url required for inference provider"))?;
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "local".to_string()),
            url,
            client: JsonClient::new("inference server", config.timeout_secs, config.max_retries)?,
        })
    }
}

#[async_trait]
impl Generator for InferenceGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, BackendError> {
        let body = InferenceRequest {
            messages: messages(prompt),
            max_tokens,
            temperature,
            stream: false,
        };
        let resp: InferenceResponse = self
            .client
            .post(&format!("{}/chat", self.url.trim_end_matches('/')), &body, None)
            .await?;
        Ok(resp.response)
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiGenerator {
    model: String,
    url: String,
    api_key: String,
    client: JsonClient,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: openai_api_key()?,
            client: JsonClient::new("openai chat", config.timeout_secs, config.max_retries)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, BackendError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: messages(prompt),
            max_tokens,
            temperature,
        };
        let resp: ChatCompletionResponse = self
            .client
            .post(
                &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
                &body,
                Some(&self.api_key),
            )
            .await?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("chat completion without content".into()))
    }
}

/// Build the generator named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "inference" => Ok(Arc::new(InferenceGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
