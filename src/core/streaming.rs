//! StreamingTask：任务体产出一串 delta 而不是一个结果
//!
//! 阶段与 Task 相同，但 RUNNING 之后每收到一个 delta 都重新进入 OUTPUT_VALIDATION（自环），
//! 上游耗尽后才合并、校验最终结果并进入 PROCESSING_OUTPUT。
//! 返回的流有限且不可重放，再次消费需要重新调用 stream。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use crate::core::evaluator::run_evaluators;
use crate::core::state::{Abandon, InvocationGuard};
use crate::core::{EngineError, Evaluator, RetryPolicy, StateMachine, TaskArgs, TaskState, Validator};
use crate::llm::{DeltaAccumulator, StreamDelta};
use crate::observability::{noop_sink, SpanId, SpanOutcome, SpanStart, TraceHandle, TraceSink};

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, EngineError>> + Send>>;

#[async_trait]
pub trait StreamBody: Send + Sync {
    /// 打开上游流；打开失败属于 Provider 调用，受重试策略约束
    async fn open(&self, args: TaskArgs) -> Result<DeltaStream, EngineError>;

    /// 合并结果 -> 任务输出，默认序列化为 Completion
    fn finish(&self, merged: DeltaAccumulator) -> Result<TaskArgs, EngineError> {
        TaskArgs::from_typed(&merged.into_completion())
    }

    fn process_output(&self, output: TaskArgs) -> Result<TaskArgs, EngineError> {
        Ok(output)
    }
}

/// 交给调用方的事件：每个 delta 原样转发（已填好累计结果），最后是合并结果或错误
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(StreamDelta),
    Completed(TaskArgs),
    Error(String),
}

pub struct StreamingTask {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    machine: StateMachine,
    body: Arc<dyn StreamBody>,
    input_validator: Validator,
    output_validator: Validator,
    evaluators: Vec<Arc<dyn Evaluator>>,
    retry: RetryPolicy,
    sink: Arc<dyn TraceSink>,
    current_span: Option<SpanId>,
    failure: Option<EngineError>,
    last_error: Option<String>,
}

impl StreamingTask {
    pub fn new(name: impl Into<String>, body: impl StreamBody + 'static) -> Self {
        Self::from_arc(name, Arc::new(body))
    }

    pub fn from_arc(name: impl Into<String>, body: Arc<dyn StreamBody>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            machine: StateMachine::new(),
            body,
            input_validator: Validator::accept_all(),
            output_validator: Validator::accept_all(),
            evaluators: Vec::new(),
            retry: RetryPolicy::none(),
            sink: noop_sink(),
            current_span: None,
            failure: None,
            last_error: None,
        }
    }

    pub fn with_input_validator(mut self, validator: Validator) -> Self {
        self.input_validator = validator;
        self
    }

    pub fn with_output_validator(mut self, validator: Validator) -> Self {
        self.output_validator = validator;
        self
    }

    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluators.push(Arc::new(evaluator));
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 取出最近一次流失败的错误（StreamEvent::Error 只携带文本）
    pub fn take_error(&mut self) -> Option<EngineError> {
        self.failure.take()
    }

    /// 开始一次流式调用。状态与输入校验在这里同步检查，失败直接返回 Err
    ///
    /// 返回的流在产出 Completed / Error 之前被丢弃，任务会被置为 FAILED。
    pub fn stream(
        &mut self,
        args: TaskArgs,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + '_, EngineError> {
        self.machine.transition(TaskState::InputValidation)?;
        self.failure = None;

        let span = self.sink.begin_span(SpanStart {
            name: self.name.clone(),
            task_id: self.id,
            parent_id: self.parent_id,
            input: args.clone().into_value(),
        });
        self.current_span = Some(span.clone());
        if let Err(violations) = self.input_validator.validate(&args) {
            let err = EngineError::input_validation(violations);
            self.mark_failed(&err);
            return Err(err);
        }

        let mut guard = InvocationGuard::new(self);
        Ok(stream! {
            if let Err(err) = guard.machine.transition(TaskState::Running) {
                yield guard.abort(err);
                return;
            }

            let body = guard.body.clone();
            let opened = guard.retry.run(&guard.name, || body.open(args.clone())).await;
            let mut deltas = match opened {
                Ok(deltas) => deltas,
                Err(err) => {
                    yield guard.abort(err);
                    return;
                }
            };

            let mut acc = DeltaAccumulator::new();
            while let Some(item) = deltas.next().await {
                let mut delta = match item {
                    Ok(delta) => delta,
                    Err(err) => {
                        yield guard.abort(err);
                        return;
                    }
                };
                if let Err(err) = guard.machine.transition(TaskState::OutputValidation) {
                    yield guard.abort(err);
                    return;
                }
                acc = acc.apply(&delta);
                delta.completion = Some(acc.snapshot());
                yield StreamEvent::Delta(delta);
            }

            match guard.settle(acc, &span).await {
                Ok(output) => yield StreamEvent::Completed(output),
                Err(err) => yield guard.abort(err),
            }
        })
    }

    /// 消费整个流，只返回合并后的结果
    pub async fn run_to_completion(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        let mut output = None;
        {
            let mut events = Box::pin(self.stream(args)?);
            while let Some(event) = events.next().await {
                if let StreamEvent::Completed(out) = event {
                    output = Some(out);
                }
            }
        }
        match output {
            Some(out) => Ok(out),
            None => Err(self
                .take_error()
                .unwrap_or_else(|| EngineError::execution("stream ended without a result"))),
        }
    }

    /// 限时消费整个流；到期时任务已是 FAILED，可以直接再次调用
    pub async fn run_with_timeout(
        &mut self,
        args: TaskArgs,
        limit: Duration,
    ) -> Result<TaskArgs, EngineError> {
        match tokio::time::timeout(limit, self.run_to_completion(args)).await {
            Ok(result) => result,
            Err(_) => {
                let err = EngineError::Timeout(limit);
                self.last_error = Some(err.to_string());
                self.failure = None;
                tracing::warn!(task = %self.name, ?limit, "stream timed out");
                Err(err)
            }
        }
    }

    async fn settle(&mut self, acc: DeltaAccumulator, span: &SpanId) -> Result<TaskArgs, EngineError> {
        // 空流时仍停在 RUNNING，这里补一次进入 OUTPUT_VALIDATION
        self.machine.transition(TaskState::OutputValidation)?;
        let output = self.body.finish(acc)?;
        self.output_validator
            .validate(&output)
            .map_err(EngineError::output_validation)?;

        self.machine.transition(TaskState::ProcessingOutput)?;
        let output = self.body.process_output(output)?;

        if !self.evaluators.is_empty() {
            self.machine.transition(TaskState::Evaluating)?;
            let trace = TraceHandle::new(self.sink.clone(), span.clone());
            run_evaluators(&self.evaluators, &self.name, &output, &trace).await;
        }

        self.machine.transition(TaskState::Complete)?;
        self.last_error = None;
        if let Some(span) = self.current_span.take() {
            self.sink
                .end_span(&span, SpanOutcome::Output(output.clone().into_value()));
        }
        Ok(output)
    }

    fn mark_failed(&mut self, err: &EngineError) -> String {
        self.machine.fail();
        let message = err.to_string();
        self.last_error = Some(message.clone());
        if let Some(span) = self.current_span.take() {
            self.sink.end_span(&span, SpanOutcome::Error(message.clone()));
        }
        tracing::warn!(task = %self.name, state = %self.machine.state(), error = %message, "stream failed");
        message
    }

    fn abort(&mut self, err: EngineError) -> StreamEvent {
        let message = self.mark_failed(&err);
        self.failure = Some(err);
        StreamEvent::Error(message)
    }
}

impl Abandon for StreamingTask {
    fn abandon(&mut self) {
        // 已经产出终态事件的流无需收尾
        if self.machine.state().accepts_invocation() {
            return;
        }
        let err = EngineError::Cancelled;
        self.mark_failed(&err);
        self.failure = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validator::FieldType;
    use crate::llm::{Completion, FinishReason, LlmError, ToolCallFragment};
    use futures_util::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Replay {
        deltas: Vec<Result<StreamDelta, EngineError>>,
    }

    #[async_trait]
    impl StreamBody for Replay {
        async fn open(&self, _args: TaskArgs) -> Result<DeltaStream, EngineError> {
            let items: Vec<_> = self
                .deltas
                .iter()
                .map(|d| match d {
                    Ok(delta) => Ok(delta.clone()),
                    Err(e) => Err(EngineError::execution(e.to_string())),
                })
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn text_body(chunks: &[&str]) -> Replay {
        let mut deltas: Vec<_> = chunks.iter().map(|c| Ok(StreamDelta::text(*c))).collect();
        deltas.push(Ok(StreamDelta::finished(FinishReason::Stop)));
        Replay { deltas }
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_then_merged_result() {
        let mut task = StreamingTask::new("talk", text_body(&["Hel", "lo"]));
        let events: Vec<StreamEvent> = task.stream(TaskArgs::new()).unwrap().collect().await;

        assert_eq!(events.len(), 4);
        match &events[1] {
            StreamEvent::Delta(d) => {
                assert_eq!(d.completion.as_ref().unwrap().content.as_deref(), Some("Hello"))
            }
            other => panic!("unexpected {other:?}"),
        }
        let StreamEvent::Completed(out) = &events[3] else {
            panic!("expected completion, got {:?}", events[3]);
        };
        let completion: Completion = out.clone().into_typed().unwrap();
        assert_eq!(completion.content.as_deref(), Some("Hello"));
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_tool_call_fragments_merge() {
        let frag = |name: Option<&str>, args: &str| {
            Ok(StreamDelta::tool_call(ToolCallFragment {
                index: 0,
                id: name.map(|_| "c1".to_string()),
                name: name.map(String::from),
                arguments: args.to_string(),
            }))
        };
        let body = Replay {
            deltas: vec![
                frag(Some("lookup"), ""),
                frag(None, "{\"key\""),
                frag(None, ":\"v\"}"),
                Ok(StreamDelta::finished(FinishReason::ToolCalls)),
            ],
        };
        let mut task = StreamingTask::new("tools", body);
        let out = task.run_to_completion(TaskArgs::new()).await.unwrap();
        let completion: Completion = out.into_typed().unwrap();
        assert_eq!(completion.tool_calls[0].function.name, "lookup");
        assert_eq!(completion.tool_calls[0].function.arguments, "{\"key\":\"v\"}");
    }

    #[tokio::test]
    async fn test_empty_stream_still_completes() {
        let mut task = StreamingTask::new("silent", Replay { deltas: Vec::new() });
        let out = task.run_to_completion(TaskArgs::new()).await.unwrap();
        let completion: Completion = out.into_typed().unwrap();
        assert!(completion.content.is_none());
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_mid_stream_error_fails_task() {
        let body = Replay {
            deltas: vec![
                Ok(StreamDelta::text("par")),
                Err(EngineError::execution("connection dropped")),
            ],
        };
        let mut task = StreamingTask::new("broken", body);
        let events: Vec<StreamEvent> = task.stream(TaskArgs::new()).unwrap().collect().await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(msg)) if msg.contains("connection dropped")));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.take_error().is_some());

        // FAILED 可重新开始
        task.body = Arc::new(text_body(&["ok"]));
        task.run_to_completion(TaskArgs::new()).await.unwrap();
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_input_validation_is_eager() {
        let mut task = StreamingTask::new("strict", text_body(&["x"]))
            .with_input_validator(Validator::new().required("prompt", FieldType::String));
        let err = task.stream(TaskArgs::new()).err().unwrap();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_final_shape_is_validated() {
        let mut task = StreamingTask::new("shape", text_body(&["x"]))
            .with_output_validator(Validator::new().required("answer", FieldType::String));
        let err = task.run_to_completion(TaskArgs::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_open_is_retried_on_transient_error() {
        struct FlakyOpen {
            opens: AtomicU32,
        }

        #[async_trait]
        impl StreamBody for FlakyOpen {
            async fn open(&self, _args: TaskArgs) -> Result<DeltaStream, EngineError> {
                if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(LlmError::rate_limited("busy", None).into());
                }
                Ok(Box::pin(stream::iter(vec![Ok::<_, EngineError>(StreamDelta::text("ok"))])))
            }
        }

        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(1))
            .with_jitter(Duration::ZERO);
        let mut task = StreamingTask::new(
            "flaky",
            FlakyOpen {
                opens: AtomicU32::new(0),
            },
        )
        .with_retry(policy);
        let out = task.run_to_completion(TaskArgs::new()).await.unwrap();
        assert_eq!(out.get("content"), Some(&"ok".into()));
    }

    struct Stalls;

    #[async_trait]
    impl StreamBody for Stalls {
        async fn open(&self, args: TaskArgs) -> Result<DeltaStream, EngineError> {
            let first = stream::iter(vec![Ok::<_, EngineError>(StreamDelta::text("partial"))]);
            if args.get("stall").and_then(|v| v.as_bool()).unwrap_or(false) {
                Ok(Box::pin(first.chain(stream::pending())))
            } else {
                Ok(Box::pin(first.chain(stream::iter(vec![Ok(StreamDelta::finished(
                    FinishReason::Stop,
                ))]))))
            }
        }
    }

    #[tokio::test]
    async fn test_run_with_timeout_leaves_task_reusable() {
        let sink = Arc::new(crate::observability::InMemoryTraceSink::new());
        let mut task = StreamingTask::new("stall", Stalls).with_sink(sink.clone());

        let err = task
            .run_with_timeout(TaskArgs::new().with("stall", true), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.last_error().unwrap().starts_with("Timed out"));
        let spans = sink.spans_named("stall");
        assert_eq!(spans.len(), 1);
        assert!(spans[0].error.is_some());

        let out = task
            .run_with_timeout(TaskArgs::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.get("content"), Some(&"partial".into()));
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_unpolled_stream_dropped_marks_failed() {
        let mut task = StreamingTask::new("unused", text_body(&["x"]));
        let events = task.stream(TaskArgs::new()).unwrap();
        drop(events);
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.last_error(), Some("Invocation cancelled before completion"));
        assert!(matches!(task.take_error(), Some(EngineError::Cancelled)));

        task.run_to_completion(TaskArgs::new()).await.unwrap();
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_stream_dropped_mid_way_marks_failed() {
        let mut task = StreamingTask::new("half", text_body(&["a", "b", "c"]));
        {
            let mut events = Box::pin(task.stream(TaskArgs::new()).unwrap());
            assert!(matches!(events.next().await, Some(StreamEvent::Delta(_))));
        }
        assert_eq!(task.state(), TaskState::Failed);

        // 完整消费后丢弃不会改写状态
        {
            let events: Vec<StreamEvent> = task.stream(TaskArgs::new()).unwrap().collect().await;
            assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
        }
        assert_eq!(task.state(), TaskState::Complete);
        assert!(task.last_error().is_none());
    }
}
