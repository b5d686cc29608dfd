//! 短期记忆：对话历史
//!
//! 只追加、保序。窗口按「轮次单元」截取：普通消息各自成一个单元，
//! 带 tool_calls 的 assistant 消息与回应它的 tool 消息合为一个单元，截断时不会被拆开。

use serde::{Deserialize, Serialize};

use crate::core::EngineError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型发起的函数调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// 原始 JSON 字符串（流式时由多个片段拼接而成）
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// 单条消息；字段形状即 Provider 的线上格式
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// 发起工具调用的 assistant 消息；content 与 tool_calls 互斥，故置空
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain(Role::Assistant, "")
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// 对话记忆，由创建它的 Agent 独占
#[derive(Clone, Debug, Default)]
pub struct ConversationMemory {
    messages: Vec<Message>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加消息。tool 消息必须紧跟在发出其 tool_call_id 的调用组之后，且每个 id 只回应一次
    pub fn push(&mut self, msg: Message) -> Result<(), EngineError> {
        if msg.role == Role::Tool {
            self.check_tool_result(&msg)?;
        }
        self.messages.push(msg);
        Ok(())
    }

    fn check_tool_result(&self, msg: &Message) -> Result<(), EngineError> {
        let call_id = msg
            .tool_call_id
            .as_deref()
            .ok_or_else(|| EngineError::InvalidMessage("tool message without tool_call_id".into()))?;

        let answered: Vec<&str> = self
            .messages
            .iter()
            .rev()
            .take_while(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let issuer = self.messages.iter().rev().nth(answered.len());

        let issued = issuer
            .and_then(|m| m.tool_calls.as_ref())
            .is_some_and(|calls| calls.iter().any(|c| c.id == call_id));
        if !issued {
            return Err(EngineError::InvalidMessage(format!(
                "tool result '{call_id}' does not answer the preceding tool call"
            )));
        }
        if answered.contains(&call_id) {
            return Err(EngineError::InvalidMessage(format!(
                "tool call '{call_id}' already has a result"
            )));
        }
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近 n 个轮次单元（调用组与其结果不拆分）
    pub fn get_memories(&self, n: usize) -> &[Message] {
        self.history(self.messages.len(), n)
    }

    /// 只看前 end 条消息时的最近 n 个轮次单元；Agent 用它取本轮之前的历史
    pub fn history(&self, end: usize, n: usize) -> &[Message] {
        let prefix = &self.messages[..end.min(self.messages.len())];
        if n == 0 {
            return &[];
        }
        let starts: Vec<usize> = prefix
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != Role::Tool)
            .map(|(i, _)| i)
            .collect();
        if starts.len() <= n {
            return prefix;
        }
        &prefix[starts[starts.len() - n]..]
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 丢弃第 len 条之后的消息（失败轮次整体撤回）
    pub fn truncate(&mut self, len: usize) {
        if len < self.messages.len() {
            tracing::debug!(dropped = self.messages.len() - len, "memory rolled back");
        }
        self.messages.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_round() -> ConversationMemory {
        let mut mem = ConversationMemory::new();
        mem.push(Message::user("When is my birthday?")).unwrap();
        mem.push(Message::assistant_tool_calls(vec![ToolCall::new(
            "call_1",
            "get_user_property",
            r#"{"asked_property":"birthday"}"#,
        )]))
        .unwrap();
        mem.push(Message::tool("call_1", "get_user_property", "January 1st"))
            .unwrap();
        mem.push(Message::assistant("Your birthday is January 1st."))
            .unwrap();
        mem
    }

    #[test]
    fn test_window_keeps_tool_pair_together() {
        let mem = tool_round();
        let window = mem.get_memories(2);
        assert_eq!(window.len(), 3);
        assert!(window[0].has_tool_calls());
        assert_eq!(window[1].role, Role::Tool);
        assert_eq!(window[2].role, Role::Assistant);

        for n in 0..=5 {
            let window = mem.get_memories(n);
            if let Some(pos) = window.iter().position(|m| m.role == Role::Tool) {
                assert!(pos > 0 && window[pos - 1].has_tool_calls(), "window {n} split a pair");
            }
        }
    }

    #[test]
    fn test_window_larger_than_history() {
        let mem = tool_round();
        assert_eq!(mem.get_memories(10).len(), 4);
        assert!(mem.get_memories(0).is_empty());
        assert_eq!(mem.get_memories(1), &mem.messages()[3..]);
    }

    #[test]
    fn test_history_ignores_current_turn() {
        let mem = tool_round();
        assert!(mem.history(0, 3).is_empty());
        assert_eq!(mem.history(1, 3).len(), 1);
        assert_eq!(mem.history(3, 1).len(), 2, "the open call group stays whole");
        assert_eq!(mem.history(99, 10).len(), 4);
    }

    #[test]
    fn test_multiple_results_in_one_group() {
        let mut mem = ConversationMemory::new();
        mem.push(Message::user("compare")).unwrap();
        mem.push(Message::assistant_tool_calls(vec![
            ToolCall::new("a", "lookup", "{}"),
            ToolCall::new("b", "lookup", "{}"),
        ]))
        .unwrap();
        mem.push(Message::tool("b", "lookup", "2")).unwrap();
        mem.push(Message::tool("a", "lookup", "1")).unwrap();
        assert!(mem.push(Message::tool("a", "lookup", "again")).is_err());
        assert_eq!(mem.get_memories(1).len(), 3);
    }

    #[test]
    fn test_truncate_drops_open_call_group() {
        let mut mem = tool_round();
        mem.push(Message::user("and my name?")).unwrap();
        mem.push(Message::assistant_tool_calls(vec![ToolCall::new("call_2", "get_user_property", "{}")]))
            .unwrap();
        mem.truncate(4);
        assert_eq!(mem.len(), 4);
        assert_eq!(mem.last().map(|m| m.role), Some(Role::Assistant));
        // 被撤回的调用 id 不再能被回应
        assert!(mem.push(Message::tool("call_2", "get_user_property", "Ann")).is_err());

        mem.truncate(10);
        assert_eq!(mem.len(), 4);
    }

    #[test]
    fn test_orphan_tool_message_rejected() {
        let mut mem = ConversationMemory::new();
        assert!(mem.push(Message::tool("x", "t", "r")).is_err());
        mem.push(Message::user("hi")).unwrap();
        let err = mem.push(Message::tool("x", "t", "r")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidMessage(_)));

        let mut missing_id = Message::tool("x", "t", "r");
        missing_id.tool_call_id = None;
        assert!(mem.push(missing_id).is_err());
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::assistant_tool_calls(vec![ToolCall::new("c1", "echo", "{}")]);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["content"], "");
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "echo");
        assert!(v.get("tool_call_id").is_none());

        let tool = serde_json::to_value(Message::tool("c1", "echo", "ok")).unwrap();
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "c1");
    }
}
