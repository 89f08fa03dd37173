use crate::config::Settings;
use crate::domain::message::Role;
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::sse::SseLineBuffer;
use crate::llm::{ChatInput, CompletionClient, Provider, TokenStream};
use anyhow::Context;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4-turbo";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_openai_api_key()?.to_string();
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = std::env::var("OPENAI_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok());

        // The timeout covers the whole exchange including the streamed body,
        // so slow generations are cut off rather than left hanging.
        let timeout_secs = std::env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
            max_tokens,
        })
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        Ok(headers)
    }

    fn request_body(&self, input: &ChatInput) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(input.messages.len() + 1);
        messages.push(WireMessage {
            role: Role::System,
            content: input.system.clone(),
        });
        messages.extend(input.messages.iter().map(|m| WireMessage {
            role: m.role,
            content: m.content.clone(),
        }));

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            max_tokens: self.max_tokens,
        }
    }

    fn delta_content(payload: &str) -> anyhow::Result<Option<String>> {
        let chunk = serde_json::from_str::<StreamChunk>(payload)
            .with_context(|| format!("failed to decode stream chunk: {payload}"))?;
        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty()))
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn stream_chat(&self, input: ChatInput) -> anyhow::Result<TokenStream> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let res = self
            .http
            .post(url)
            .headers(self.headers()?)
            .json(&self.request_body(&input))
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = res.status();
        if !status.is_success() {
            let text = res
                .text()
                .await
                .context("failed to read OpenAI error body")?;
            return Err(LlmDiagnosticsError {
                provider: Provider::OpenAi,
                stage: "http",
                detail: format!("status={status}"),
                raw_output: Some(text),
            }
            .into());
        }

        let mut upstream = res.bytes_stream();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<anyhow::Result<String>>();

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::new();
            'read: while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(anyhow::Error::new(err).context("OpenAI stream read failed")));
                        break;
                    }
                };

                lines.push(&chunk);
                while let Some(payload) = lines.next_data() {
                    if payload == DONE_MARKER {
                        break 'read;
                    }
                    match Self::delta_content(&payload) {
                        Ok(Some(content)) => {
                            // Receiver gone means the caller disconnected;
                            // dropping the stream aborts the provider request.
                            if tx.send(Ok(content)).is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = tx.send(Err(LlmDiagnosticsError {
                                provider: Provider::OpenAi,
                                stage: "stream_decode",
                                detail: format!("{err:#}"),
                                raw_output: Some(payload),
                            }
                            .into()));
                            break 'read;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
