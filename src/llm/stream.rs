//! 流式 Delta 与合并
//!
//! 合并是一个 fold：`(accumulator, delta) -> accumulator`。文本片段按到达顺序拼接；
//! 工具调用按 index 归组，name / id 只在第一次出现时记下，arguments 逐片拼接。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::{Completion, FinishReason, TokenUsage};
use crate::memory::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaStatus {
    Streaming,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    AssistantText,
    ToolCall,
}

/// 一个工具调用的局部片段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    /// 同一回复中第几个调用
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub status: DeltaStatus,
    pub kind: DeltaKind,
    pub content: Option<String>,
    pub tool_call: Option<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    /// 截至本片段的累计结果，由引擎填写
    pub completion: Option<Completion>,
}

impl StreamDelta {
    pub fn text(chunk: impl Into<String>) -> Self {
        Self {
            status: DeltaStatus::Streaming,
            kind: DeltaKind::AssistantText,
            content: Some(chunk.into()),
            tool_call: None,
            finish_reason: None,
            usage: None,
            completion: None,
        }
    }

    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        Self {
            kind: DeltaKind::ToolCall,
            content: None,
            tool_call: Some(fragment),
            ..Self::text("")
        }
    }

    /// 流的最后一个片段
    pub fn finished(reason: FinishReason) -> Self {
        Self {
            status: DeltaStatus::Finished,
            content: None,
            finish_reason: Some(reason),
            kind: match reason {
                FinishReason::ToolCalls => DeltaKind::ToolCall,
                _ => DeltaKind::AssistantText,
            },
            ..Self::text("")
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status == DeltaStatus::Finished
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// 合并状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaAccumulator {
    text: String,
    calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(mut self, delta: &StreamDelta) -> Self {
        if let Some(chunk) = &delta.content {
            self.text.push_str(chunk);
        }
        if let Some(fragment) = &delta.tool_call {
            let call = self.calls.entry(fragment.index).or_default();
            if call.id.is_none() {
                call.id = fragment.id.clone();
            }
            if call.name.is_none() {
                call.name = fragment.name.clone();
            }
            call.arguments.push_str(&fragment.arguments);
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
        if delta.usage.is_some() {
            self.usage = delta.usage;
        }
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 当前累计的完整结果（不消耗累加器）
    pub fn snapshot(&self) -> Completion {
        self.clone().into_completion()
    }

    pub fn into_completion(self) -> Completion {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|(index, call)| {
                ToolCall::new(
                    call.id.unwrap_or_else(|| format!("call_{index}")),
                    call.name.unwrap_or_default(),
                    call.arguments,
                )
            })
            .collect();
        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        Completion {
            content: if self.text.is_empty() { None } else { Some(self.text) },
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

/// 按顺序合并一串 delta
pub fn merge_deltas<'a>(deltas: impl IntoIterator<Item = &'a StreamDelta>) -> Completion {
    deltas
        .into_iter()
        .fold(DeltaAccumulator::new(), DeltaAccumulator::apply)
        .into_completion()
}
