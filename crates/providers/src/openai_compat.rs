//! OpenAI-compatible streaming transport.
//!
//! Works with any endpoint exposing `/v1/chat/completions` with SSE
//! streaming: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp server, LM Studio,
//! and local model servers.
//!
//! Content deltas become [`StreamEvent::Fragment`]s as they arrive. Tool-call
//! deltas are accumulated by index and, once the stream finishes, the first
//! complete call is delivered as the terminal
//! [`StreamEvent::ToolInvocation`].

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chatloop_config::AppConfig;
use chatloop_core::error::TransportError;
use chatloop_core::message::{OutgoingMessage, Role};
use chatloop_core::tool::ToolDefinition;
use chatloop_core::transport::{
    CompletionRequest, EventReceiver, StreamEvent, ToolInvocationSignal, Transport,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible streaming transport.
pub struct OpenAiCompatTransport {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatTransport {
    /// Create a new transport for `base_url` (e.g. `http://127.0.0.1:1337/v1`).
    ///
    /// Only a connect timeout is set: streamed responses may legitimately
    /// run for a long time.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self::with_client(name, base_url, api_key, client))
    }

    /// Create a transport around an already configured HTTP client.
    pub fn with_client(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        }
    }

    /// Build a transport from the loaded configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        Self::new("openai-compat", &config.api_url, config.api_key.clone())
    }

    /// Convert outgoing messages to the OpenAI wire format.
    fn to_api_messages(messages: &[OutgoingMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: Self::to_api_content(m),
                tool_calls: m.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    /// Plain string content, or text + image parts for user images.
    fn to_api_content(message: &OutgoingMessage) -> Option<serde_json::Value> {
        if message.role != Role::User || message.images.is_empty() {
            return message.content.clone().map(serde_json::Value::String);
        }

        let mut parts = Vec::with_capacity(message.images.len() + 1);
        if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
            parts.push(serde_json::json!({ "type": "text", "text": text }));
        }
        for image in &message.images {
            let url = format!("data:{};base64,{}", image.mime_type, BASE64.encode(&image.data));
            parts.push(serde_json::json!({ "type": "image_url", "image_url": { "url": url } }));
        }
        Some(serde_json::Value::Array(parts))
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    /// The JSON request body. `tools` and `tool_choice` are omitted entirely
    /// when no tool is enabled.
    fn build_body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if let Some(choice) = request.tool_choice() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
            body["tool_choice"] = serde_json::json!(choice);
        }

        body
    }
}

#[async_trait]
impl Transport for OpenAiCompatTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: CompletionRequest) -> Result<EventReceiver, TransportError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);

        debug!(
            transport = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(TransportError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(TransportError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Endpoint streaming error");
            return Err(TransportError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let transport_name = self.name.clone();

        // Read the SSE byte stream on its own task; dropping the receiver
        // stops it and releases the connection.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while !decoder.is_done() {
                let next = tokio::select! {
                    _ = tx.closed() => return,
                    next = byte_stream.next() => next,
                };
                let Some(chunk_result) = next else {
                    break;
                };

                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(TransportError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }

            if let Some(event) = decoder.finish() {
                if let StreamEvent::ToolInvocation(signal) = &event {
                    debug!(transport = %transport_name, tool = %signal.tool_name, "Model requested a tool");
                }
                let _ = tx.send(Ok(event)).await;
            }
        });

        Ok(rx)
    }
}

// --- SSE decoding ---

/// Incremental decoder for a chat-completions SSE body.
///
/// Bytes may be split anywhere, including inside a multi-byte character;
/// only complete lines are decoded.
pub struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            tool_calls: BTreeMap::new(),
            done: false,
        }
    }

    /// Whether `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes; returns the text fragments they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                break;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(stream_resp) => {
                    if let Some(text) = self.apply(stream_resp) {
                        events.push(StreamEvent::Fragment { text });
                    }
                }
                Err(e) => {
                    trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }

        events
    }

    /// Accumulate tool-call deltas; return the content delta, if any.
    fn apply(&mut self, response: StreamResponse) -> Option<String> {
        let choice = response.choices.into_iter().next()?;
        let delta = choice.delta;

        for tc_delta in delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(tc_delta.index).or_default();
            if let Some(id) = tc_delta.id {
                acc.id = id;
            }
            if let Some(func) = tc_delta.function {
                if let Some(name) = func.name {
                    acc.name.push_str(&name);
                }
                if let Some(args) = func.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }

        delta.content.filter(|c| !c.is_empty())
    }

    /// End of stream: the first accumulated tool call, if the model made one.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let calls = std::mem::take(&mut self.tool_calls);
        let mut named = calls.into_values().filter(|acc| !acc.name.is_empty());
        let first = named.next()?;

        let dropped = named.count();
        if dropped > 0 {
            warn!(dropped, "Endpoint returned parallel tool calls; only the first is executed");
        }

        Some(StreamEvent::ToolInvocation(first.into_signal()))
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates incremental tool call deltas into a complete call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_signal(self) -> ToolInvocationSignal {
        ToolInvocationSignal {
            tool_name: self.name,
            arguments_json: self.arguments,
            call_id: (!self.id.is_empty()).then_some(self.id),
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta, arriving incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
