//! Concurrent：扇出 / 扇入
//!
//! 所有子任务在同一个任务内协作式并发（join_all，不 spawn），等全部结束才返回；
//! 结果顺序与子任务顺序一致，与完成先后无关。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use uuid::Uuid;

use crate::core::state::{Abandon, InvocationGuard};
use crate::core::{EngineError, Runnable, StateMachine, TaskArgs, TaskState};
use crate::observability::{noop_sink, SpanId, SpanOutcome, SpanStart, TraceSink};

/// 子任务的输入：一份共享参数广播给所有子任务，或每个子任务一份
#[derive(Debug, Clone)]
pub enum ConcurrentInput {
    Shared(TaskArgs),
    PerChild(Vec<TaskArgs>),
}

impl From<TaskArgs> for ConcurrentInput {
    fn from(args: TaskArgs) -> Self {
        ConcurrentInput::Shared(args)
    }
}

impl From<Vec<TaskArgs>> for ConcurrentInput {
    fn from(args: Vec<TaskArgs>) -> Self {
        ConcurrentInput::PerChild(args)
    }
}

impl ConcurrentInput {
    fn to_value(&self) -> Value {
        match self {
            ConcurrentInput::Shared(args) => args.clone().into_value(),
            ConcurrentInput::PerChild(list) => {
                Value::Array(list.iter().cloned().map(TaskArgs::into_value).collect())
            }
        }
    }
}

pub struct Concurrent {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    machine: StateMachine,
    children: Vec<Box<dyn Runnable>>,
    sink: Arc<dyn TraceSink>,
    current_span: Option<SpanId>,
    last_error: Option<String>,
}

impl Concurrent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            machine: StateMachine::new(),
            children: Vec::new(),
            sink: noop_sink(),
            current_span: None,
            last_error: None,
        }
    }

    pub fn with_child(mut self, child: impl Runnable + 'static) -> Self {
        self.push(Box::new(child));
        self
    }

    pub fn push(&mut self, mut child: Box<dyn Runnable>) {
        child.set_parent(self.id);
        self.children.push(child);
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[Box<dyn Runnable>] {
        &self.children
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// gather 语义：等所有子任务结束，再按子任务顺序上抛第一个错误
    pub async fn run(&mut self, input: impl Into<ConcurrentInput>) -> Result<Vec<TaskArgs>, EngineError> {
        let settled = self.gather(input.into()).await?;
        let mut outputs = Vec::with_capacity(settled.len());
        let mut first_error = None;
        for result in settled {
            match result {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            None => {
                self.complete(&outputs)?;
                Ok(outputs)
            }
            Some(err) => Err(self.record_failure(err)),
        }
    }

    /// 每个子任务各自的结果，子任务失败不影响其它子任务也不使组合失败
    pub async fn run_settled(
        &mut self,
        input: impl Into<ConcurrentInput>,
    ) -> Result<Vec<Result<TaskArgs, EngineError>>, EngineError> {
        let settled = self.gather(input.into()).await?;
        let ok: Vec<TaskArgs> = settled.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
        self.complete(&ok)?;
        Ok(settled)
    }

    async fn gather(
        &mut self,
        input: ConcurrentInput,
    ) -> Result<Vec<Result<TaskArgs, EngineError>>, EngineError> {
        self.machine.transition(TaskState::InputValidation)?;
        let span = self.sink.begin_span(SpanStart {
            name: self.name.clone(),
            task_id: self.id,
            parent_id: self.parent_id,
            input: input.to_value(),
        });
        self.current_span = Some(span);

        let inputs = match input {
            ConcurrentInput::Shared(args) => vec![args; self.children.len()],
            ConcurrentInput::PerChild(list) if list.len() == self.children.len() => list,
            ConcurrentInput::PerChild(list) => {
                let err = EngineError::InvalidInput(format!(
                    "{} inputs for {} children",
                    list.len(),
                    self.children.len()
                ));
                return Err(self.record_failure(err));
            }
        };

        self.machine.transition(TaskState::Running)?;
        tracing::debug!(group = %self.name, children = self.children.len(), "fan-out");
        let mut guard = InvocationGuard::new(self);
        let settled = join_all(
            guard
                .children
                .iter_mut()
                .zip(inputs)
                .map(|(child, args)| child.invoke(args)),
        )
        .await;
        guard.disarm();
        Ok(settled)
    }

    fn complete(&mut self, outputs: &[TaskArgs]) -> Result<(), EngineError> {
        self.machine.transition(TaskState::OutputValidation)?;
        self.machine.transition(TaskState::ProcessingOutput)?;
        self.machine.transition(TaskState::Complete)?;
        self.last_error = None;
        let value = Value::Array(outputs.iter().cloned().map(TaskArgs::into_value).collect());
        if let Some(span) = self.current_span.take() {
            self.sink.end_span(&span, SpanOutcome::Output(value));
        }
        Ok(())
    }

    fn record_failure(&mut self, err: EngineError) -> EngineError {
        self.machine.fail();
        self.last_error = Some(err.to_string());
        if let Some(span) = self.current_span.take() {
            self.sink.end_span(&span, SpanOutcome::Error(err.to_string()));
        }
        tracing::warn!(group = %self.name, error = %err, "concurrent group failed");
        err
    }
}

impl Abandon for Concurrent {
    fn abandon(&mut self) {
        self.record_failure(EngineError::Cancelled);
    }
}

#[async_trait]
impl Runnable for Concurrent {
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

    /// 共享输入，输出 `{"results": [...]}`
    async fn invoke(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        let outputs = self.run(args).await?;
        let results: Vec<Value> = outputs.into_iter().map(TaskArgs::into_value).collect();
        Ok(TaskArgs::new().with("results", results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FnBody, Task};
    use crate::workflow::Chain;
    use std::sync::Mutex;
    use std::time::Duration;

    fn sleeper(name: &'static str, finished: Arc<Mutex<Vec<&'static str>>>) -> Task {
        Task::new(
            name,
            FnBody::new(move |args: TaskArgs| {
                let finished = finished.clone();
                async move {
                    let t = args.get("t").and_then(|v| v.as_u64()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(t * 10)).await;
                    if let Ok(mut f) = finished.lock() {
                        f.push(name);
                    }
                    Ok::<_, EngineError>(TaskArgs::new().with("from", name))
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_results_follow_child_order() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut group = Concurrent::new("pair")
            .with_child(sleeper("a", finished.clone()))
            .with_child(sleeper("b", finished.clone()));

        let out = group
            .run(vec![TaskArgs::new().with("t", 5), TaskArgs::new().with("t", 1)])
            .await
            .unwrap();
        assert_eq!(*finished.lock().unwrap(), vec!["b", "a"]);
        assert_eq!(out[0].get_str("from"), Some("a"));
        assert_eq!(out[1].get_str("from"), Some("b"));
        assert_eq!(group.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_gather_waits_for_all_then_raises_first_error() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let failing = Task::new(
            "fails",
            FnBody::new(|_args: TaskArgs| async { Err(EngineError::execution("first")) }),
        );
        let mut group = Concurrent::new("mixed")
            .with_child(failing)
            .with_child(sleeper("slow", finished.clone()));

        let err = group.run(TaskArgs::new().with("t", 2)).await.unwrap_err();
        assert!(err.to_string().contains("first"));
        assert_eq!(*finished.lock().unwrap(), vec!["slow"], "no short-circuit");
        assert_eq!(group.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_settled_keeps_every_result() {
        let failing = Task::new(
            "fails",
            FnBody::new(|_args: TaskArgs| async { Err(EngineError::execution("bad")) }),
        );
        let mut group = Concurrent::new("settled")
            .with_child(sleeper("ok", Arc::new(Mutex::new(Vec::new()))))
            .with_child(failing);
        let results = group.run_settled(TaskArgs::new()).await.unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(group.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_arity_mismatch_rejected() {
        let mut group = Concurrent::new("one").with_child(sleeper("a", Arc::new(Mutex::new(Vec::new()))));
        let err = group
            .run(vec![TaskArgs::new(), TaskArgs::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(group.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_nests_inside_chain() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let group = Concurrent::new("fan")
            .with_child(sleeper("x", finished.clone()))
            .with_child(sleeper("y", finished.clone()));
        let mut chain = Chain::new("outer").then(group);
        let out = chain.invoke(TaskArgs::new()).await.unwrap();
        let results = out.get("results").and_then(|v| v.as_array()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["from"], "y");
    }
}
