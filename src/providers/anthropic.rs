// ── Anthropic Claude provider ─────────────────────────────────────────────
// Claude-specific SSE event parsing lives here; everything else (retries,
// circuit breaking) is shared with the other providers via `super`.

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

static ANTHROPIC_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_else(|| config.kind.default_base_url().to_string());
        AnthropicProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut formatted = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                system = Some(msg.content.as_text());
                continue;
            }

            if msg.role == Role::Tool {
                if let Some(tc_id) = &msg.tool_call_id {
                    formatted.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tc_id,
                            "content": msg.content.as_text(),
                        }]
                    }));
                }
                continue;
            }

            if msg.role == Role::Assistant {
                if let Some(tool_calls) = &msg.tool_calls {
                    let mut blocks: Vec<Value> = vec![];
                    let text = msg.content.as_text();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for tc in tool_calls {
                        let input: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
                        blocks.push(json!({"type": "tool_use", "id": tc.id, "name": tc.function.name, "input": input}));
                    }
                    formatted.push(json!({"role": "assistant", "content": blocks}));
                } else {
                    formatted.push(json!({"role": "assistant", "content": msg.content.as_text()}));
                }
                continue;
            }

            // User turn — may carry images or documents.
            match &msg.content {
                MessageContent::Blocks(blocks) => {
                    let content_blocks: Vec<Value> = blocks
                        .iter()
                        .map(|block| match block {
                            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                            ContentBlock::ImageUrl { image_url } => {
                                if let Some(rest) = image_url.url.strip_prefix("data:") {
                                    if let Some((media_type, b64)) = rest.split_once(";base64,") {
                                        return json!({"type": "image", "source": {"type": "base64", "media_type": media_type, "data": b64}});
                                    }
                                }
                                json!({"type": "image", "source": {"type": "url", "url": image_url.url}})
                            }
                            ContentBlock::Document { mime_type, data, .. } => {
                                json!({"type": "document", "source": {"type": "base64", "media_type": mime_type, "data": data}})
                            }
                        })
                        .collect();
                    formatted.push(json!({"role": "user", "content": content_blocks}));
                }
                MessageContent::Text(s) => formatted.push(json!({"role": "user", "content": s})),
            }
        }

        (system, formatted)
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| json!({"name": t.function.name, "description": t.function.description, "input_schema": t.function.parameters}))
            .collect()
    }

    fn parse_sse_event(data: &str) -> Option<StreamChunk> {
        let v: Value = serde_json::from_str(data).ok()?;
        let blank = || StreamChunk { delta_text: None, tool_calls: vec![], finish_reason: None, usage: None, model: None };

        match v["type"].as_str()? {
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => Some(StreamChunk { delta_text: delta["text"].as_str().map(str::to_string), ..blank() }),
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0) as usize;
                        Some(StreamChunk {
                            tool_calls: vec![ToolCallDelta { index, id: None, function_name: None, arguments_delta: delta["partial_json"].as_str().map(str::to_string) }],
                            ..blank()
                        })
                    }
                    _ => None,
                }
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let index = v["index"].as_u64().unwrap_or(0) as usize;
                    Some(StreamChunk {
                        tool_calls: vec![ToolCallDelta {
                            index,
                            id: block["id"].as_str().map(str::to_string),
                            function_name: block["name"].as_str().map(str::to_string),
                            arguments_delta: None,
                        }],
                        ..blank()
                    })
                } else {
                    None
                }
            }
            "message_delta" => {
                let stop_reason = v["delta"]["stop_reason"].as_str().map(str::to_string);
                let usage = v.get("usage").and_then(|u| {
                    let output = u["output_tokens"].as_u64().unwrap_or(0);
                    (output > 0).then_some(TokenUsage { input_tokens: 0, output_tokens: output, total_tokens: output })
                });
                Some(StreamChunk { finish_reason: stop_reason, usage, ..blank() })
            }
            "message_start" => {
                let msg = v.get("message");
                let model = msg.and_then(|m| m["model"].as_str()).map(str::to_string);
                let usage = msg.and_then(|m| m.get("usage")).and_then(|u| {
                    let input = u["input_tokens"].as_u64().unwrap_or(0);
                    (input > 0).then_some(TokenUsage { input_tokens: input, output_tokens: 0, total_tokens: input })
                });
                Some(StreamChunk { usage, model, ..blank() })
            }
            "message_stop" => Some(StreamChunk { finish_reason: Some("stop".into()), ..blank() }),
            _ => None,
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDefinition], model: &str, temperature: Option<f64>) -> PlatformResult<Vec<StreamChunk>> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let (system, formatted_messages) = Self::format_messages(messages);

        let mut body = json!({
            "model": model,
            "messages": formatted_messages,
            "max_tokens": 8192,
            "stream": true,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }

        info!("[providers] anthropic request model={model}");

        if let Err(msg) = ANTHROPIC_CIRCUIT.check() {
            return Err(transport_error("anthropic", msg));
        }

        let mut last_error = String::new();
        let mut last_status: u16 = 0;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!("[providers] anthropic retry {attempt}/{MAX_RETRIES} after {}ms", delay.as_millis());
            }

            let req = self
                .client
                .post(&url)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .header("x-api-key", &self.api_key);

            let response = match req.json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    ANTHROPIC_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {e}");
                    last_status = 0;
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(transport_error("anthropic", last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_status = status;
                retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = crate::atoms::types::truncate_utf8(&body_text, 300);
                error!("[providers] anthropic error {status}: {last_error}");

                ANTHROPIC_CIRCUIT.record_failure();

                if status == 401 || status == 403 {
                    return Err(model_error("anthropic", status, last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(model_error("anthropic", status, last_error));
            }

            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes = result.map_err(|e| transport_error("anthropic", format!("stream read error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_event(data) {
                            chunks.push(chunk);
                        }
                    }
                }
            }

            ANTHROPIC_CIRCUIT.record_success();
            return Ok(chunks);
        }

        Err(model_error("anthropic", last_status, last_error))
    }
}
