//! Tracing Sink 协作接口
//!
//! 引擎在每次 Task 调用、每轮 Agent 对话前后调用 begin_span / end_span，评估器通过 score 打分。
//! Sink 以句柄注入，未配置时使用 NoopTraceSink。

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

pub type SpanId = String;

/// span 开始时的信息
#[derive(Debug, Clone)]
pub struct SpanStart {
    pub name: String,
    pub task_id: Uuid,
    /// 父任务 id（层级追踪）
    pub parent_id: Option<Uuid>,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub enum SpanOutcome {
    Output(Value),
    Error(String),
}

pub trait TraceSink: Send + Sync {
    fn begin_span(&self, start: SpanStart) -> SpanId;

    fn end_span(&self, span: &SpanId, outcome: SpanOutcome);

    fn score(&self, span: &SpanId, name: &str, value: f64);
}

/// 不记录任何东西
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn begin_span(&self, start: SpanStart) -> SpanId {
        start.task_id.to_string()
    }

    fn end_span(&self, _span: &SpanId, _outcome: SpanOutcome) {}

    fn score(&self, _span: &SpanId, _name: &str, _value: f64) {}
}

/// 绑定到某个 span 的句柄，交给评估器使用
#[derive(Clone)]
pub struct TraceHandle {
    sink: Arc<dyn TraceSink>,
    span: SpanId,
}

impl TraceHandle {
    pub fn new(sink: Arc<dyn TraceSink>, span: SpanId) -> Self {
        Self { sink, span }
    }

    pub fn span_id(&self) -> &SpanId {
        &self.span
    }

    pub fn score(&self, name: &str, value: f64) {
        self.sink.score(&self.span, name, value);
    }
}

impl std::fmt::Debug for TraceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceHandle")
            .field("span", &self.span)
            .finish()
    }
}

pub fn noop_sink() -> Arc<dyn TraceSink> {
    Arc::new(NoopTraceSink)
}
