//! OpenAI 兼容 API 客户端
//!
//! 直接用 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）：非流式 chat/completions，
//! 以及 SSE 流式返回（含工具调用片段）。HTTP 状态码按 classify_http_status 归类，
//! 瞬时错误交给上层 RetryPolicy 处理，这里不做重试。
//! SSE 分帧（CRLF / LF 分隔、多行 data、注释行）由 eventsource-stream 处理。

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmSection;
use crate::llm::error::{classify_http_status, LlmErrorKind};
use crate::llm::{
    Completion, CompletionRequest, FinishReason, LlmClient, LlmDeltaStream, LlmError, StreamDelta,
    TokenUsage, ToolCallFragment,
};
use crate::memory::ToolCall;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    usage: Mutex<TokenUsage>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
            temperature: None,
            max_tokens: None,
            usage: Mutex::new(TokenUsage::default()),
        }
    }

    /// 按 [llm] 配置构建；API Key 从 api_key_env 指定的环境变量读取
    pub fn from_config(section: &LlmSection) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(section.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::client_error(0, format!("failed to build http client: {e}")))?;
        let api_key = std::env::var(&section.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(env = %section.api_key_env, "API key not set, requests will be unauthenticated");
        }
        Ok(Self {
            client,
            api_key,
            temperature: Some(section.temperature),
            max_tokens: Some(section.max_tokens),
            ..Self::new(section.base_url.as_deref(), &section.model, None)
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// 请求缺省的 model / temperature / max_tokens 用客户端配置补齐
    fn fill_defaults(&self, request: &CompletionRequest) -> CompletionRequest {
        let mut request = request.clone();
        if request.model.is_empty() {
            request.model = self.model.clone();
        }
        request.temperature = request.temperature.or(self.temperature);
        request.max_tokens = request.max_tokens.or(self.max_tokens);
        request
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = ChatRequestBody { request, stream };
        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::network_error(format!("Request timeout: {e}"))
            } else if e.is_connect() {
                LlmError::network_error(format!("Connection failed: {e}"))
            } else {
                LlmError::network_error(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers());
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(status = status.as_u16(), error = %e, "failed to read error body");
                String::new()
            }
        };
        Err(error_for_status(status.as_u16(), body, retry_after))
    }

    fn record_usage(&self, usage: Option<TokenUsage>) {
        if let (Some(usage), Ok(mut total)) = (usage, self.usage.lock()) {
            total.add(&usage);
        }
    }
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    #[serde(flatten)]
    request: &'a CompletionRequest,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsageWire>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct UsageWire {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<UsageWire> for TokenUsage {
    fn from(u: UsageWire) -> Self {
        TokenUsage::new(u.prompt_tokens, u.completion_tokens)
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsageWire>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn error_for_status(status: u16, body: String, retry_after: Option<Duration>) -> LlmError {
    match classify_http_status(status) {
        LlmErrorKind::RateLimited => LlmError::rate_limited(body, retry_after),
        LlmErrorKind::ServerError => LlmError::server_error(status, body),
        LlmErrorKind::Network => LlmError {
            status: Some(status),
            ..LlmError::network_error(body)
        },
        _ => LlmError::client_error(status, body),
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn parse_completion(body: &str) -> Result<Completion, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::parse_error(format!("Failed to parse response: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse_error("No choices in response"))?;
    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    let finish_reason = match choice.finish_reason.as_deref() {
        Some(reason) => parse_finish_reason(reason),
        None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };
    Ok(Completion {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        finish_reason,
        usage: parsed.usage.map(TokenUsage::from),
    })
}

/// 一个 SSE data 负载 -> 若干 delta（同一 chunk 可能同时带文本、工具片段和结束原因）
fn parse_stream_chunk(data: &str) -> Result<Vec<StreamDelta>, LlmError> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::parse_error(format!("Failed to parse stream chunk: {e}")))?;
    let usage = chunk.usage.map(TokenUsage::from);
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|c| !c.is_empty()) {
            deltas.push(StreamDelta::text(text));
        }
        for call in choice.delta.tool_calls {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(StreamDelta::tool_call(ToolCallFragment {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }));
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            let mut finished = StreamDelta::finished(parse_finish_reason(reason));
            finished.usage = usage;
            deltas.push(finished);
        }
    }
    Ok(deltas)
}

/// 字节流 -> delta 流
///
/// `[DONE]` 正常结束；此前没有 finish_reason 时补一个（见过工具片段则为 ToolCalls）。
/// 连接在 `[DONE]` 与 finish_reason 之前断开按网络错误处理。
fn sse_deltas<S, B, E>(bytes: S) -> LlmDeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut events = Box::pin(bytes.eventsource());
    Box::pin(stream! {
        let mut saw_finish = false;
        let mut saw_tool_call = false;
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(LlmError::network_error(format!("Stream interrupted: {e}")));
                    return;
                }
            };
            let data = event.data.trim();
            if data == "[DONE]" {
                if !saw_finish {
                    let reason = if saw_tool_call {
                        FinishReason::ToolCalls
                    } else {
                        FinishReason::Stop
                    };
                    yield Ok(StreamDelta::finished(reason));
                }
                return;
            }
            if data.is_empty() {
                continue;
            }
            match parse_stream_chunk(data) {
                Ok(deltas) => {
                    for delta in deltas {
                        saw_finish |= delta.is_finished();
                        saw_tool_call |= delta.tool_call.is_some();
                        yield Ok(delta);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if !saw_finish {
            yield Err(LlmError::network_error("Stream ended before completion"));
        }
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let request = self.fill_defaults(request);
        let response = self.send(&request, false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read body: {e}")))?;
        let completion = parse_completion(&body)?;
        self.record_usage(completion.usage);
        tracing::debug!(
            model = %request.model,
            tool_calls = completion.tool_calls.len(),
            finish_reason = ?completion.finish_reason,
            "completion received"
        );
        Ok(completion)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<LlmDeltaStream, LlmError> {
        let request = self.fill_defaults(request);
        let response = self.send(&request, true).await?;
        tracing::debug!(model = %request.model, "stream opened");
        Ok(sse_deltas(response.bytes_stream()))
    }

    fn token_usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::merge_deltas;
    use crate::memory::Message;

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "get_user_property", "arguments": "{\"asked_property\":\"birthday\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let c = parse_completion(body).unwrap();
        assert!(c.content.is_none());
        assert_eq!(c.finish_reason, FinishReason::ToolCalls);
        assert_eq!(c.tool_calls[0].function.name, "get_user_property");
        assert_eq!(c.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_completion(r#"{"choices": []}"#).unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Parse);
        assert!(!err.is_transient());
    }

    async fn collect(chunks: Vec<&'static str>) -> Vec<Result<StreamDelta, LlmError>> {
        let bytes = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::convert::Infallible>));
        sse_deltas(bytes).collect().await
    }

    #[tokio::test]
    async fn test_sse_fragments_merge_across_chunks() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"lookup\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"k\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        // 按固定长度切块，事件边界落在块中间
        let chunks: Vec<&'static str> = (0..raw.len())
            .step_by(17)
            .map(|i| &raw[i..(i + 17).min(raw.len())])
            .collect();
        let deltas: Vec<StreamDelta> = collect(chunks)
            .await
            .into_iter()
            .map(|d| d.unwrap())
            .collect();
        let merged = merge_deltas(&deltas);
        assert_eq!(merged.tool_calls[0].id, "c1");
        assert_eq!(merged.tool_calls[0].function.arguments, "{\"k\":1}");
        assert_eq!(merged.finish_reason, FinishReason::ToolCalls);
        assert_eq!(deltas.iter().filter(|d| d.is_finished()).count(), 1);
    }

    #[tokio::test]
    async fn test_sse_crlf_and_multiline_data() {
        let deltas = collect(vec![
            ": keep-alive\r\n\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\r",
            "\n\r\n",
            "data: {\"choices\":[{\"delta\":\r\ndata: {\"content\":\"lo\"}}]}\r\n\r\n",
            "data: [DONE]\r\n\r\n",
        ])
        .await;
        let deltas: Vec<StreamDelta> = deltas.into_iter().map(|d| d.unwrap()).collect();
        let merged = merge_deltas(&deltas);
        assert_eq!(merged.content.as_deref(), Some("Hello"));
        assert_eq!(merged.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_done_without_finish_reason_after_tool_fragments() {
        let deltas = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"ping\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;
        let last = deltas.last().unwrap().as_ref().unwrap();
        assert!(last.is_finished());
        assert_eq!(last.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_network_error() {
        let deltas = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n",
            "data: {\"choices\":[{\"del",
        ])
        .await;
        assert_eq!(deltas.len(), 2);
        assert!(deltas[0].is_ok());
        let err = deltas[1].as_ref().unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Network);
        assert!(err.is_transient());
    }

    #[test]
    fn test_status_mapping() {
        let err = error_for_status(429, "slow".into(), Some(Duration::from_secs(2)));
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        assert!(error_for_status(502, String::new(), None).is_transient());
        assert!(!error_for_status(401, String::new(), None).is_transient());
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiClient::new(Some("http://localhost:8080/v1/"), "test-model", None);
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
        let request = client.fill_defaults(&CompletionRequest::new(vec![Message::user("hi")]));
        let body = serde_json::to_value(ChatRequestBody {
            request: &request,
            stream: true,
        })
        .unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
