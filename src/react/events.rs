//! Agent 过程事件：用于流式展示回复片段、工具调用与结果

use serde::Serialize;

use crate::memory::ToolCall;
use crate::tools::ToolOutcome;

/// 一轮对话的最终结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// 最终回复文本
    pub content: String,
    /// 配置了结构化输出时，解析并校验后的 JSON
    pub structured: Option<serde_json::Value>,
    /// 本轮经历的工具往返次数
    pub tool_rounds: usize,
    /// 因卡住或步数上限而被迫收尾
    pub forced: bool,
}

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 流式回复的一小段文本
    Delta { text: String },
    /// 模型请求调用工具
    ToolCalls { calls: Vec<ToolCall> },
    /// 工具返回，顺序与请求一致
    ToolResults { outcomes: Vec<ToolOutcome> },
    /// 连续工具结果相同，下一次不再提供工具
    Stuck { repeated: usize },
    /// 本轮结束
    Final { response: AgentResponse },
}

pub(crate) fn send_event(
    tx: Option<&tokio::sync::mpsc::UnboundedSender<AgentEvent>>,
    ev: AgentEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
