// ── OpenAI-compatible provider ───────────────────────────────────────────
// Handles OpenAI itself and any OpenAI-compatible REST API (the `Custom`
// provider kind) via the same Chat Completions wire format.

use super::{is_retryable_status, model_error, parse_retry_after, retry_delay, transport_error, CircuitBreaker, ModelProvider, MAX_RETRIES};
use crate::atoms::error::PlatformResult;
use crate::atoms::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_else(|| config.kind.default_base_url().to_string());
        OpenAiProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let content_val = match &msg.content {
                    MessageContent::Text(s) => json!(s),
                    MessageContent::Blocks(blocks) => json!(blocks
                        .iter()
                        .map(|b| match b {
                            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                            ContentBlock::ImageUrl { image_url } => json!({
                                "type": "image_url",
                                "image_url": {"url": image_url.url, "detail": image_url.detail.as_deref().unwrap_or("auto")},
                            }),
                            ContentBlock::Document { mime_type, data, name } => json!({
                                "type": "file",
                                "file": {"filename": name.as_deref().unwrap_or("document.pdf"), "file_data": format!("data:{mime_type};base64,{data}")},
                            }),
                        })
                        .collect::<Vec<_>>()),
                };
                let mut m = json!({"role": msg.role, "content": content_val});
                if let Some(tc) = &msg.tool_calls {
                    m["tool_calls"] = json!(tc);
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                if let Some(name) = &msg.name {
                    m["name"] = json!(name);
                }
                m
            })
            .collect()
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| json!({"type": t.tool_type, "function": {"name": t.function.name, "description": t.function.description, "parameters": t.function.parameters}}))
            .collect()
    }

    fn parse_sse_chunk(data: &str) -> Option<StreamChunk> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let model = v["model"].as_str().map(str::to_string);
        let choice = v["choices"].get(0);
        let delta = choice.map(|c| &c["delta"]);
        let finish_reason = choice.and_then(|c| c["finish_reason"].as_str()).map(str::to_string);
        let delta_text = delta.and_then(|d| d["content"].as_str()).map(str::to_string);

        let mut tool_calls = Vec::new();
        if let Some(tcs) = delta.and_then(|d| d["tool_calls"].as_array()) {
            for tc in tcs {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                tool_calls.push(ToolCallDelta {
                    index,
                    id: tc["id"].as_str().map(str::to_string),
                    function_name: tc["function"]["name"].as_str().map(str::to_string),
                    arguments_delta: tc["function"]["arguments"].as_str().map(str::to_string),
                });
            }
        }

        let usage = v.get("usage").and_then(|u| {
            let input = u["prompt_tokens"].as_u64().unwrap_or(0);
            let output = u["completion_tokens"].as_u64().unwrap_or(0);
            (input > 0 || output > 0).then_some(TokenUsage { input_tokens: input, output_tokens: output, total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output) })
        });

        Some(StreamChunk { delta_text, tool_calls, finish_reason, usage, model })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDefinition], model: &str, temperature: Option<f64>) -> PlatformResult<Vec<StreamChunk>> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }

        info!("[providers] openai request model={model}");

        if let Err(msg) = OPENAI_CIRCUIT.check() {
            return Err(transport_error("openai", msg));
        }

        let mut last_error = String::new();
        let mut last_status: u16 = 0;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!("[providers] openai retry {attempt}/{MAX_RETRIES} after {}ms", delay.as_millis());
            }

            let req = self.client.post(&url).header("Content-Type", "application/json").header("Authorization", format!("Bearer {}", self.api_key));

            let response = match req.json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    OPENAI_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {e}");
                    last_status = 0;
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(transport_error("openai", last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_status = status;
                retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = truncate_utf8(&body_text, 300);
                error!("[providers] openai error {status}: {last_error}");

                OPENAI_CIRCUIT.record_failure();

                if status == 401 || status == 403 {
                    return Err(model_error("openai", status, last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(model_error("openai", status, last_error));
            }

            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes = result.map_err(|e| transport_error("openai", format!("stream read error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_chunk(data) {
                            chunks.push(chunk);
                        } else if data == "[DONE]" {
                            OPENAI_CIRCUIT.record_success();
                            return Ok(chunks);
                        }
                    }
                }
            }

            OPENAI_CIRCUIT.record_success();
            return Ok(chunks);
        }

        Err(model_error("openai", last_status, last_error))
    }
}
