// ── Google Gemini provider ────────────────────────────────────────────────
// Gemini's REST shape differs enough from the OpenAI/Anthropic pair to earn
// its own formatter: system instructions are a top-level field, tool
// results come back as `functionResponse` parts, and the API key travels
// as a query parameter rather than a header.

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

static GOOGLE_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct GoogleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_else(|| config.kind.default_base_url().to_string());
        GoogleProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    fn format_messages(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
        let mut system_instruction: Option<Value> = None;
        let mut contents: Vec<Value> = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                let text = msg.content.as_text();
                match &mut system_instruction {
                    Some(existing) => {
                        let prev = existing["parts"][0]["text"].as_str().unwrap_or("").to_string();
                        existing["parts"][0]["text"] = json!(format!("{prev}\n\n{text}"));
                    }
                    None => system_instruction = Some(json!({"parts": [{"text": text}]})),
                }
                continue;
            }

            if msg.role == Role::Tool {
                if let Some(tc_id) = &msg.tool_call_id {
                    let fn_name = msg.name.clone().unwrap_or_else(|| tc_id.clone());
                    contents.push(json!({
                        "role": "function",
                        "parts": [{"functionResponse": {"name": fn_name, "response": {"result": msg.content.as_text()}}}]
                    }));
                }
                continue;
            }

            if msg.role == Role::Assistant {
                let mut parts: Vec<Value> = vec![];
                let text = msg.content.as_text();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                if let Some(tool_calls) = &msg.tool_calls {
                    for tc in tool_calls {
                        let args: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
                        parts.push(json!({"functionCall": {"name": tc.function.name, "args": args}}));
                    }
                }
                contents.push(json!({"role": "model", "parts": parts}));
                continue;
            }

            // User turn.
            let parts: Vec<Value> = match &msg.content {
                MessageContent::Text(s) => vec![json!({"text": s})],
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => json!({"text": text}),
                        ContentBlock::ImageUrl { image_url } => {
                            if let Some(rest) = image_url.url.strip_prefix("data:") {
                                if let Some((mime, b64)) = rest.split_once(";base64,") {
                                    return json!({"inlineData": {"mimeType": mime, "data": b64}});
                                }
                            }
                            json!({"fileData": {"fileUri": image_url.url}})
                        }
                        ContentBlock::Document { mime_type, data, .. } => json!({"inlineData": {"mimeType": mime_type, "data": data}}),
                    })
                    .collect(),
            };
            contents.push(json!({"role": "user", "parts": parts}));
        }

        (system_instruction, contents)
    }

    fn format_tools(tools: &[ToolDefinition]) -> Value {
        json!([{
            "functionDeclarations": tools.iter().map(|t| json!({
                "name": t.function.name,
                "description": t.function.description,
                "parameters": t.function.parameters,
            })).collect::<Vec<_>>()
        }])
    }

    fn parse_sse_chunk(data: &str) -> Option<StreamChunk> {
        let v: Value = serde_json::from_str(data).ok()?;
        let model = v["modelVersion"].as_str().map(str::to_string);
        let candidate = v["candidates"].get(0)?;
        let finish_reason = candidate["finishReason"].as_str().map(str::to_string);

        let mut delta_text = None;
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for (index, part) in parts.iter().enumerate() {
                if let Some(text) = part["text"].as_str() {
                    delta_text = Some(delta_text.unwrap_or_default() + text);
                }
                if let Some(fc) = part.get("functionCall") {
                    tool_calls.push(ToolCallDelta {
                        index,
                        id: None,
                        function_name: fc["name"].as_str().map(str::to_string),
                        arguments_delta: fc.get("args").map(|a| a.to_string()),
                    });
                }
            }
        }

        let usage = v.get("usageMetadata").and_then(|u| {
            let input = u["promptTokenCount"].as_u64().unwrap_or(0);
            let output = u["candidatesTokenCount"].as_u64().unwrap_or(0);
            (input > 0 || output > 0).then_some(TokenUsage { input_tokens: input, output_tokens: output, total_tokens: u["totalTokenCount"].as_u64().unwrap_or(input + output) })
        });

        Some(StreamChunk { delta_text, tool_calls, finish_reason, usage, model })
    }
}

#[async_trait]
impl ModelProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDefinition], model: &str, temperature: Option<f64>) -> PlatformResult<Vec<StreamChunk>> {
        let url = format!("{}/models/{model}:streamGenerateContent?alt=sse&key={}", self.base_url.trim_end_matches('/'), self.api_key);
        let (system_instruction, contents) = Self::format_messages(messages);

        let mut body = json!({ "contents": contents });
        if let Some(sys) = system_instruction {
            body["systemInstruction"] = sys;
        }
        if !tools.is_empty() {
            body["tools"] = Self::format_tools(tools);
        }
        if let Some(temp) = temperature {
            body["generationConfig"] = json!({"temperature": temp});
        }

        info!("[providers] google request model={model}");

        if let Err(msg) = GOOGLE_CIRCUIT.check() {
            return Err(transport_error("google", msg));
        }

        let mut last_error = String::new();
        let mut last_status: u16 = 0;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!("[providers] google retry {attempt}/{MAX_RETRIES} after {}ms", delay.as_millis());
            }

            let response = match self.client.post(&url).header("Content-Type", "application/json").json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    GOOGLE_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {e}");
                    last_status = 0;
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(transport_error("google", last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_status = status;
                retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = truncate_utf8(&body_text, 300);
                error!("[providers] google error {status}: {last_error}");

                GOOGLE_CIRCUIT.record_failure();

                if status == 401 || status == 403 {
                    return Err(model_error("google", status, last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(model_error("google", status, last_error));
            }

            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes = result.map_err(|e| transport_error("google", format!("stream read error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_chunk(data) {
                            chunks.push(chunk);
                        }
                    }
                }
            }

            GOOGLE_CIRCUIT.record_success();
            return Ok(chunks);
        }

        Err(model_error("google", last_status, last_error))
    }
}
