//! Toolkit：工具注册与并发分发
//!
//! 一批 tool call 先全部按名解析（未知工具是致命错误，整批不执行），
//! 再各自包成 Task，经 Concurrent::run_settled 并发执行，结果按请求顺序返回。
//! 工具自身的失败、超时、参数错误都转成带错误文本的 ToolOutcome，交回模型而不是上抛。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ToolsSection;
use crate::core::{EngineError, Task, TaskArgs, TaskBody, Validator};
use crate::llm::ToolSchema;
use crate::memory::{Message, ToolCall};
use crate::observability::{noop_sink, TraceSink};
use crate::tools::{Tool, ToolDefinition};
use crate::workflow::Concurrent;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// 单个工具调用的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    fn failure(call: &ToolCall, reason: impl std::fmt::Display) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: format!("Error: {reason}"),
            is_error: true,
        }
    }

    /// 转成回应该调用的 tool 消息
    pub fn to_message(&self) -> Message {
        Message::tool(&self.call_id, &self.name, &self.content)
    }
}

/// 工具注册表，构造完成后只读，并发分发无需加锁
///
/// 每次分发的 tool_dispatch span 挂在 parent 之下，单个工具的 span 再挂在 tool_dispatch 之下。
#[derive(Clone)]
pub struct Toolkit {
    tools: Vec<ToolDefinition>,
    timeout: Duration,
    sink: Arc<dyn TraceSink>,
    parent_id: Option<Uuid>,
}

impl Default for Toolkit {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            sink: noop_sink(),
            parent_id: None,
        }
    }
}

impl fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolkit")
            .field("tools", &self.names())
            .field("timeout", &self.timeout)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

impl Toolkit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(section: &ToolsSection) -> Self {
        Self::new().with_timeout(Duration::from_secs(section.tool_timeout_secs))
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn set_sink(&mut self, sink: Arc<dyn TraceSink>) {
        self.sink = sink;
    }

    /// 分发 span 的父节点（通常是所属 Agent）
    pub fn set_parent(&mut self, parent: Uuid) {
        self.parent_id = Some(parent);
    }

    /// 注册工具；名称在 Toolkit 内必须唯一
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), EngineError> {
        self.register_definition(ToolDefinition::new(tool))
    }

    pub fn register_definition(&mut self, definition: ToolDefinition) -> Result<(), EngineError> {
        if self.get(definition.name()).is_some() {
            return Err(EngineError::InvalidInput(format!(
                "tool '{}' is already registered",
                definition.name()
            )));
        }
        self.tools.push(definition);
        Ok(())
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Result<Self, EngineError> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// 暴露给模型的函数声明，顺序与注册顺序一致
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(ToolDefinition::schema).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 并发执行一批调用，结果与请求一一对应
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Result<Vec<ToolOutcome>, EngineError> {
        let mut definitions = Vec::with_capacity(calls.len());
        for call in calls {
            let definition = self
                .get(&call.function.name)
                .ok_or_else(|| EngineError::UnknownTool(call.function.name.clone()))?;
            definitions.push(definition);
        }

        let mut slots: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        let mut group = Concurrent::new("tool_dispatch").with_sink(self.sink.clone());
        if let Some(parent) = self.parent_id {
            group = group.with_parent(parent);
        }
        let mut inputs = Vec::new();
        let mut positions = Vec::new();
        for (pos, (call, definition)) in calls.iter().zip(definitions).enumerate() {
            match parse_arguments(&call.function.arguments) {
                Ok(args) => {
                    group.push(Box::new(self.tool_task(definition)));
                    inputs.push(args);
                    positions.push(pos);
                }
                Err(reason) => {
                    tracing::warn!(tool = %call.function.name, error = %reason, "unparseable tool arguments");
                    slots[pos] = Some(ToolOutcome::failure(call, reason));
                }
            }
        }

        if !positions.is_empty() {
            let settled = group.run_settled(inputs).await?;
            for (pos, result) in positions.into_iter().zip(settled) {
                let call = &calls[pos];
                slots[pos] = Some(match result {
                    Ok(output) => ToolOutcome::success(call, output.get_str("content").unwrap_or_default()),
                    Err(EngineError::Execution(reason)) => ToolOutcome::failure(call, reason),
                    Err(err) => ToolOutcome::failure(call, err),
                });
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn tool_task(&self, definition: &ToolDefinition) -> Task {
        let body = ToolBody {
            tool: definition.tool(),
            timeout: self.timeout,
        };
        Task::builder(definition.name(), body)
            .input_validator(Validator::from_json_schema(definition.parameters()))
            .sink(self.sink.clone())
            .build()
    }
}

/// 把一次工具执行包成任务体：限时执行并输出审计日志
struct ToolBody {
    tool: Arc<dyn Tool>,
    timeout: Duration,
}

#[async_trait]
impl TaskBody for ToolBody {
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        let start = Instant::now();
        let args = args.into_value();
        let preview = args_preview(&args);
        let result = timeout(self.timeout, self.tool.execute(args)).await;

        let (ok, outcome) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": self.tool.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(TaskArgs::new().with("content", content)),
            Ok(Err(reason)) => Err(EngineError::Execution(reason)),
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

fn parse_arguments(raw: &str) -> Result<TaskArgs, String> {
    if raw.trim().is_empty() {
        return Ok(TaskArgs::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))?;
    TaskArgs::from_value(value).map_err(|e| e.to_string())
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
