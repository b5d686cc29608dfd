//! Task：带状态、带校验的异步工作单元
//!
//! 一次调用的阶段：INPUT_VALIDATION -> RUNNING -> OUTPUT_VALIDATION -> PROCESSING_OUTPUT
//! -> (EVALUATING) -> COMPLETE；RUNNING 之后任何失败都会进入 FAILED，记录错误信息，
//! 再按失败类别查 fallback 表决定是否用调整后的参数重跑。
//! 重试、超时等横切关注点以装饰器形式在构造时包在任务体外层（见 layers）。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::evaluator::run_evaluators;
use crate::core::layers::{Retrying, TimeLimited};
use crate::core::recovery::{self, FailureKind, FallbackStrategy, RecoveryAction};
use crate::core::state::{Abandon, InvocationGuard};
use crate::core::{EngineError, Evaluator, RetryPolicy, StateMachine, TaskArgs, TaskState, Validator};
use crate::observability::{noop_sink, SpanId, SpanOutcome, SpanStart, TraceHandle, TraceSink};

/// 任务体：唯一的抽象执行逻辑 + 可覆盖的输出后处理钩子（默认恒等）
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError>;

    fn process_output(&self, output: TaskArgs) -> Result<TaskArgs, EngineError> {
        Ok(output)
    }
}

/// 由异步闭包构成的任务体
pub struct FnBody<F> {
    f: F,
}

impl<F> FnBody<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskBody for FnBody<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskArgs, EngineError>> + Send + 'static,
{
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        (self.f)(args).await
    }
}

/// 可组合的执行单元：Task、Chain、Concurrent 都实现它，因此可以互相嵌套
#[async_trait]
pub trait Runnable: Send {
    fn id(&self) -> Uuid;

    fn name(&self) -> &str;

    fn state(&self) -> TaskState;

    fn set_parent(&mut self, parent: Uuid);

    async fn invoke(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError>;
}

pub struct Task {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    machine: StateMachine,
    body: Arc<dyn TaskBody>,
    input_validator: Validator,
    output_validator: Validator,
    evaluators: Vec<Arc<dyn Evaluator>>,
    fallbacks: HashMap<FailureKind, FallbackStrategy>,
    sink: Arc<dyn TraceSink>,
    current_span: Option<SpanId>,
    last_error: Option<String>,
    attempts: u32,
}

impl Task {
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        TaskBuilder::new(name, body).build()
    }

    pub fn builder(name: impl Into<String>, body: impl TaskBody + 'static) -> TaskBuilder {
        TaskBuilder::new(name, body)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn set_parent(&mut self, parent: Uuid) {
        self.parent_id = Some(parent);
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    /// 最近一次失败的错误信息；成功完成后清空
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 最近一次 invoke 中任务体被执行的轮数（1 + fallback 重跑次数）
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set_sink(&mut self, sink: Arc<dyn TraceSink>) {
        self.sink = sink;
    }

    /// 执行一次调用；失败时按 fallback 表决定是否重跑
    pub async fn invoke(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        let mut args = args;
        let mut retries = 0;
        self.attempts = 0;
        loop {
            self.attempts += 1;
            let err = match self.invoke_once(args.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            match recovery::decide(self.fallbacks.get(&err.kind()), &err, &args, retries) {
                RecoveryAction::RetryWith(next) => {
                    retries += 1;
                    tracing::warn!(
                        task = %self.name,
                        retry = retries,
                        error = %err,
                        "fallback: re-invoking with adjusted arguments"
                    );
                    args = next;
                }
                RecoveryAction::Abort => return Err(err),
            }
        }
    }

    /// 调用方层面的超时：到期后任务直接视为 FAILED，不走 fallback
    pub async fn invoke_with_timeout(
        &mut self,
        args: TaskArgs,
        limit: Duration,
    ) -> Result<TaskArgs, EngineError> {
        match tokio::time::timeout(limit, self.invoke(args)).await {
            Ok(result) => result,
            Err(_) => {
                let err = EngineError::Timeout(limit);
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn invoke_once(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        // 状态不允许开始新调用时原样上抛，不改变状态
        self.machine.transition(TaskState::InputValidation)?;

        let span = self.sink.begin_span(SpanStart {
            name: self.name.clone(),
            task_id: self.id,
            parent_id: self.parent_id,
            input: args.clone().into_value(),
        });
        self.current_span = Some(span.clone());

        // future 在 drive 期间被丢弃时由 guard 收尾
        let result = {
            let mut guard = InvocationGuard::new(self);
            let result = guard.drive(args, &span).await;
            guard.disarm();
            result
        };
        match &result {
            Ok(output) => {
                self.sink
                    .end_span(&span, SpanOutcome::Output(output.clone().into_value()));
                self.current_span = None;
            }
            Err(err) => self.record_failure(err),
        }
        result
    }

    async fn drive(&mut self, args: TaskArgs, span: &SpanId) -> Result<TaskArgs, EngineError> {
        self.input_validator
            .validate(&args)
            .map_err(EngineError::input_validation)?;

        self.machine.transition(TaskState::Running)?;
        let output = self.body.run(args).await?;

        self.machine.transition(TaskState::OutputValidation)?;
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
        tracing::debug!(task = %self.name, "task complete");
        Ok(output)
    }

    fn record_failure(&mut self, err: &EngineError) {
        self.machine.fail();
        self.last_error = Some(err.to_string());
        if let Some(span) = self.current_span.take() {
            self.sink.end_span(&span, SpanOutcome::Error(err.to_string()));
        }
        tracing::warn!(task = %self.name, state = %self.machine.state(), error = %err, "task failed");
    }
}

impl Abandon for Task {
    fn abandon(&mut self) {
        self.record_failure(&EngineError::Cancelled);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.machine.state())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runnable for Task {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> TaskState {
        self.machine.state()
    }

    fn set_parent(&mut self, parent: Uuid) {
        self.parent_id = Some(parent);
    }

    async fn invoke(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        Task::invoke(self, args).await
    }
}

/// Task 构建器：校验器、评估器、fallback 与装饰器在这里一次性配置
pub struct TaskBuilder {
    name: String,
    body: Arc<dyn TaskBody>,
    parent_id: Option<Uuid>,
    input_validator: Validator,
    output_validator: Validator,
    evaluators: Vec<Arc<dyn Evaluator>>,
    fallbacks: HashMap<FailureKind, FallbackStrategy>,
    sink: Arc<dyn TraceSink>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        Self::from_arc(name, Arc::new(body))
    }

    pub fn from_arc(name: impl Into<String>, body: Arc<dyn TaskBody>) -> Self {
        Self {
            name: name.into(),
            body,
            parent_id: None,
            input_validator: Validator::accept_all(),
            output_validator: Validator::accept_all(),
            evaluators: Vec::new(),
            fallbacks: HashMap::new(),
            sink: noop_sink(),
            retry: None,
            timeout: None,
        }
    }

    pub fn input_validator(mut self, validator: Validator) -> Self {
        self.input_validator = validator;
        self
    }

    pub fn output_validator(mut self, validator: Validator) -> Self {
        self.output_validator = validator;
        self
    }

    pub fn evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluators.push(Arc::new(evaluator));
        self
    }

    pub fn fallback(mut self, kind: FailureKind, strategy: FallbackStrategy) -> Self {
        self.fallbacks.insert(kind, strategy);
        self
    }

    /// 瞬时错误重试（Provider 调用专用）
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// 单次执行超时
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn build(self) -> Task {
        // 超时在内层（每次尝试单独计时），重试在外层
        let mut body = self.body;
        if let Some(limit) = self.timeout {
            body = Arc::new(TimeLimited::new(body, limit));
        }
        if let Some(policy) = self.retry {
            body = Arc::new(Retrying::new(body, policy, self.name.clone()));
        }
        Task {
            id: Uuid::new_v4(),
            name: self.name,
            parent_id: self.parent_id,
            machine: StateMachine::new(),
            body,
            input_validator: self.input_validator,
            output_validator: self.output_validator,
            evaluators: self.evaluators,
            fallbacks: self.fallbacks,
            sink: self.sink,
            current_span: None,
            last_error: None,
            attempts: 0,
        }
    }
}
