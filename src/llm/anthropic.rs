//! Anthropic Messages API gateway.
//!
//! Transient failures (5xx, network, timeout, 429) retry inside the gateway
//! with exponential backoff: 1 s initial, doubling, three attempts total.
//! A 429 retry-after is honored exactly. Invalid responses and context
//! overflows are never retried.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::gateway::{LlmError, LlmGateway};
use super::types::{
    CompletionRequest, CompletionResponse, Message, MessageContent, Role, StopReason,
    StreamEvent, TokenUsage, ToolCall,
};
use crate::config::LlmConfig;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Gateway to the Anthropic API.
pub struct AnthropicGateway {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl AnthropicGateway {
    pub fn new(api_key: String, config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn message_to_value(message: &Message) -> Value {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &message.content {
            MessageContent::Text(text) => json!({ "role": role, "content": text }),
            MessageContent::Blocks(blocks) => json!({ "role": role, "content": blocks }),
        }
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Self::message_to_value).collect();
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens.min(self.config.max_tokens),
            "messages": messages,
        });
        if !request.system_prompt.is_empty() {
            body["system"] = json!(request.system_prompt);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request_builder(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    fn classify_reqwest(e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(e.to_string())
        }
    }

    async fn classify_status(response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30));
            return LlmError::RateLimited { retry_after };
        }
        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                    .or(Some(body))
            })
            .unwrap_or_default();
        LlmError::Api { status, message }
    }

    fn parse_response(value: Value) -> Result<CompletionResponse, LlmError> {
        let blocks = value["content"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse("missing content array".to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    text.push_str(block["text"].as_str().unwrap_or_default());
                }
                Some("tool_use") => {
                    let id = block["id"]
                        .as_str()
                        .ok_or_else(|| LlmError::InvalidResponse("tool_use without id".to_string()))?;
                    let name = block["name"]
                        .as_str()
                        .ok_or_else(|| LlmError::InvalidResponse("tool_use without name".to_string()))?;
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }

        let stop_reason = value["stop_reason"]
            .as_str()
            .and_then(StopReason::parse)
            .ok_or_else(|| LlmError::InvalidResponse("missing stop_reason".to_string()))?;

        let usage = TokenUsage {
            input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: value["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0),
            cache_creation_tokens: value["usage"]["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        };

        Ok(CompletionResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            stop_reason,
            usage,
        })
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(request, false);
        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(Self::classify_reqwest)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response).await);
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Self::parse_response(value)
    }

    async fn stream_once(
        &self,
        request: &CompletionRequest,
        sink: &mpsc::Sender<StreamEvent>,
        emitted: &mut bool,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(request, true);
        let mut source = EventSource::new(self.request_builder(&body))
            .map_err(|e| LlmError::Network(format!("cannot open event stream: {}", e)))?;

        #[derive(Default)]
        struct BlockState {
            is_tool: bool,
            tool_id: String,
            tool_name: String,
            text: String,
            input_json: String,
        }
        let mut blocks: BTreeMap<u64, BlockState> = BTreeMap::new();
        let mut stop_reason = StopReason::EndTurn;
        let mut usage = TokenUsage::default();

        while let Some(event) = source.next().await {
            let message = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(_, response)) => {
                    return Err(Self::classify_status(response).await);
                }
                Err(e) => return Err(LlmError::Network(e.to_string())),
            };

            let data: Value = match serde_json::from_str(&message.data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match message.event.as_str() {
                "content_block_start" => {
                    let index = data["index"].as_u64().unwrap_or(0);
                    let block = data["content_block"].clone();
                    let mut state = BlockState::default();
                    if block["type"] == "tool_use" {
                        state.is_tool = true;
                        state.tool_id = block["id"].as_str().unwrap_or_default().to_string();
                        state.tool_name = block["name"].as_str().unwrap_or_default().to_string();
                        *emitted = true;
                        let _ = sink
                            .send(StreamEvent::ToolUseStart {
                                id: state.tool_id.clone(),
                                name: state.tool_name.clone(),
                            })
                            .await;
                    }
                    blocks.insert(index, state);
                }
                "content_block_delta" => {
                    let index = data["index"].as_u64().unwrap_or(0);
                    let state = blocks.entry(index).or_default();
                    if let Some(text) = data["delta"]["text"].as_str() {
                        state.text.push_str(text);
                        *emitted = true;
                        let _ = sink.send(StreamEvent::TextDelta(text.to_string())).await;
                    }
                    if let Some(partial) = data["delta"]["partial_json"].as_str() {
                        state.input_json.push_str(partial);
                        *emitted = true;
                        let _ = sink
                            .send(StreamEvent::ToolUseDelta {
                                id: state.tool_id.clone(),
                                partial_json: partial.to_string(),
                            })
                            .await;
                    }
                }
                "content_block_stop" => {
                    let index = data["index"].as_u64().unwrap_or(0);
                    if let Some(state) = blocks.get(&index) {
                        if state.is_tool {
                            let _ = sink
                                .send(StreamEvent::ToolUseEnd {
                                    id: state.tool_id.clone(),
                                })
                                .await;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                        stop_reason = StopReason::parse(reason).unwrap_or_default();
                    }
                    if let Some(out) = data["usage"]["output_tokens"].as_u64() {
                        usage.output_tokens = out;
                    }
                }
                "message_start" => {
                    usage.input_tokens = data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                    usage.cache_read_tokens = data["message"]["usage"]["cache_read_input_tokens"]
                        .as_u64()
                        .unwrap_or(0);
                    usage.cache_creation_tokens = data["message"]["usage"]["cache_creation_input_tokens"]
                        .as_u64()
                        .unwrap_or(0);
                }
                "message_stop" => break,
                "error" => {
                    return Err(LlmError::Api {
                        status: 500,
                        message: data["error"]["message"].as_str().unwrap_or("stream error").to_string(),
                    });
                }
                _ => {}
            }
        }
        source.close();

        let _ = sink.send(StreamEvent::Done { stop_reason, usage }).await;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for state in blocks.values() {
            if state.is_tool {
                let input = serde_json::from_str(&state.input_json).unwrap_or(Value::Null);
                tool_calls.push(ToolCall {
                    id: state.tool_id.clone(),
                    name: state.tool_name.clone(),
                    input,
                });
            } else {
                text.push_str(&state.text);
            }
        }
        Ok(CompletionResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            stop_reason,
            usage,
        })
    }

    async fn backoff_for(error: &LlmError, backoff: Duration) -> Duration {
        let delay = match error {
            LlmError::RateLimited { retry_after } => *retry_after,
            _ => backoff,
        };
        debug!(delay_ms = delay.as_millis() as u64, "transient llm error, backing off");
        tokio::time::sleep(delay).await;
        backoff * 2
    }
}

#[async_trait]
impl LlmGateway for AnthropicGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.complete_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "completion attempt failed");
                    backoff = Self::backoff_for(&e, backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<CompletionResponse, LlmError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let mut emitted = false;
            match self.stream_once(&request, &sink, &mut emitted).await {
                Ok(response) => return Ok(response),
                // Only retry failures from before the stream produced output
                Err(e) if e.is_transient() && !emitted && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "stream attempt failed");
                    backoff = Self::backoff_for(&e, backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
