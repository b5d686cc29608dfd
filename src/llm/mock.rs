//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设的回复、错误或原始 delta 序列；脚本用完后回显最后一条 User 消息。
//! 每次请求都会被记录，便于断言模型实际看到的上下文。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{
    Completion, CompletionRequest, FinishReason, LlmClient, LlmDeltaStream, LlmError, StreamDelta,
    TokenUsage, ToolCallFragment,
};
use crate::memory::{Role, ToolCall};

/// 流式回放时每个文本片段的字符数
const CHUNK_CHARS: usize = 6;

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum MockReply {
    Completion(Completion),
    Error(LlmError),
    /// 原样作为流返回；非流式调用时先合并
    Deltas(Vec<StreamDelta>),
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
    usage: Mutex<TokenUsage>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let client = Self::new();
        if let Ok(mut script) = client.script.lock() {
            script.extend(replies);
        }
        client
    }

    pub fn reply(self, reply: MockReply) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
        self
    }

    pub fn text(self, content: impl Into<String>) -> Self {
        self.reply(MockReply::Completion(Completion::text(content)))
    }

    pub fn tool_call(self, id: &str, name: &str, arguments: &str) -> Self {
        self.reply(MockReply::Completion(Completion::with_tool_calls(vec![
            ToolCall::new(id, name, arguments),
        ])))
    }

    pub fn error(self, err: LlmError) -> Self {
        self.reply(MockReply::Error(err))
    }

    /// 已发起的调用次数（含失败）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| MockReply::Completion(echo(request)))
    }

    fn record_usage(&self, completion: &Completion) {
        if let (Some(usage), Ok(mut total)) = (completion.usage, self.usage.lock()) {
            total.add(&usage);
        }
    }
}

fn echo(request: &CompletionRequest) -> Completion {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)");
    Completion::text(format!("Echo from Mock: {last_user}"))
}

/// 把完整回复拆成 delta 序列：文本按 CHUNK_CHARS 切片，工具调用先发 name 再分片发 arguments
pub fn split_into_deltas(completion: &Completion) -> Vec<StreamDelta> {
    let mut deltas: Vec<StreamDelta> = chunk_str(completion.content_str())
        .into_iter()
        .map(StreamDelta::text)
        .collect();
    for (index, call) in completion.tool_calls.iter().enumerate() {
        deltas.push(StreamDelta::tool_call(ToolCallFragment {
            index,
            id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
            arguments: String::new(),
        }));
        deltas.extend(chunk_str(&call.function.arguments).into_iter().map(|piece| {
            StreamDelta::tool_call(ToolCallFragment {
                index,
                arguments: piece,
                ..ToolCallFragment::default()
            })
        }));
    }
    let reason = if completion.has_tool_calls() {
        FinishReason::ToolCalls
    } else {
        completion.finish_reason
    };
    let mut last = StreamDelta::finished(reason);
    last.usage = completion.usage;
    deltas.push(last);
    deltas
}

fn chunk_str(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let completion = match self.next_reply(request) {
            MockReply::Completion(c) => c,
            MockReply::Error(e) => return Err(e),
            MockReply::Deltas(deltas) => crate::llm::merge_deltas(&deltas),
        };
        self.record_usage(&completion);
        Ok(completion)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<LlmDeltaStream, LlmError> {
        let deltas = match self.next_reply(request) {
            MockReply::Completion(c) => {
                self.record_usage(&c);
                split_into_deltas(&c)
            }
            MockReply::Error(e) => return Err(e),
            MockReply::Deltas(deltas) => deltas,
        };
        Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok::<_, LlmError>))))
    }

    fn token_usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}
