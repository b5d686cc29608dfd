//! Chain：顺序组合
//!
//! 子任务严格按顺序执行，第 i 个的完整输出直接作为第 i+1 个的全部输入（替换而非合并）。
//! 任一子任务失败即中止整条链，链本身进入 FAILED；重试由子任务自己负责。

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::state::{Abandon, InvocationGuard};
use crate::core::{EngineError, Runnable, StateMachine, TaskArgs, TaskState};
use crate::observability::{noop_sink, SpanId, SpanOutcome, SpanStart, TraceSink};

pub struct Chain {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    machine: StateMachine,
    children: Vec<Box<dyn Runnable>>,
    sink: Arc<dyn TraceSink>,
    current_span: Option<SpanId>,
    last_error: Option<String>,
}

impl Chain {
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

    /// 追加一个子任务，子任务的 parent 指向本链
    pub fn then(mut self, child: impl Runnable + 'static) -> Self {
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

    pub async fn invoke(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        self.machine.transition(TaskState::InputValidation)?;
        let span = self.sink.begin_span(SpanStart {
            name: self.name.clone(),
            task_id: self.id,
            parent_id: self.parent_id,
            input: args.clone().into_value(),
        });

        self.current_span = Some(span);

        let result = {
            let mut guard = InvocationGuard::new(self);
            let result = guard.run_children(args).await;
            guard.disarm();
            result
        };
        match result {
            Ok(output) => {
                self.last_error = None;
                if let Some(span) = self.current_span.take() {
                    self.sink
                        .end_span(&span, SpanOutcome::Output(output.clone().into_value()));
                }
                Ok(output)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn record_failure(&mut self, err: &EngineError) {
        self.machine.fail();
        self.last_error = Some(err.to_string());
        if let Some(span) = self.current_span.take() {
            self.sink.end_span(&span, SpanOutcome::Error(err.to_string()));
        }
        tracing::warn!(chain = %self.name, error = %err, "chain aborted");
    }

    async fn run_children(&mut self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        self.machine.transition(TaskState::Running)?;
        let mut current = args;
        for (step, child) in self.children.iter_mut().enumerate() {
            tracing::debug!(chain = %self.name, step, child = child.name(), "chain step");
            current = child.invoke(current).await?;
        }
        self.machine.transition(TaskState::OutputValidation)?;
        self.machine.transition(TaskState::ProcessingOutput)?;
        self.machine.transition(TaskState::Complete)?;
        Ok(current)
    }
}

impl Abandon for Chain {
    fn abandon(&mut self) {
        self.record_failure(&EngineError::Cancelled);
    }
}

#[async_trait]
impl Runnable for Chain {
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
        Chain::invoke(self, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FnBody, Task};
    use std::sync::Mutex;

    fn recording(name: &str, seen: Arc<Mutex<Vec<TaskArgs>>>, output: TaskArgs) -> Task {
        Task::new(
            name,
            FnBody::new(move |args: TaskArgs| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(args);
                }
                let output = output.clone();
                async move { Ok::<_, EngineError>(output) }
            }),
        )
    }

    #[tokio::test]
    async fn test_output_replaces_next_input() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new("pipeline")
            .then(recording("a", seen.clone(), TaskArgs::new().with("x", 2)))
            .then(recording("b", seen.clone(), TaskArgs::new().with("y", 3)));

        let out = chain
            .invoke(TaskArgs::new().with("x", 1).with("extra", true))
            .await
            .unwrap();
        assert_eq!(out, TaskArgs::new().with("y", 3));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], TaskArgs::new().with("x", 1).with("extra", true));
        assert_eq!(seen[1], TaskArgs::new().with("x", 2));
        assert_eq!(chain.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_children() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failing = Task::new(
            "fails",
            FnBody::new(|_args: TaskArgs| async { Err(EngineError::execution("step broke")) }),
        );
        let mut chain = Chain::new("pipeline")
            .then(failing)
            .then(recording("never", seen.clone(), TaskArgs::new()));

        let err = chain.invoke(TaskArgs::new()).await.unwrap_err();
        assert!(err.to_string().contains("step broke"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(chain.state(), TaskState::Failed);
        assert_eq!(chain.children()[0].state(), TaskState::Failed);
        assert_eq!(chain.children()[1].state(), TaskState::Init);
        assert!(chain.last_error().is_some());
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let mut chain = Chain::new("empty");
        let args = TaskArgs::new().with("k", "v");
        assert_eq!(chain.invoke(args.clone()).await.unwrap(), args);
    }

    #[tokio::test]
    async fn test_chain_records_span() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(crate::observability::InMemoryTraceSink::new());
        let mut chain = Chain::new("parent")
            .then(recording("child", seen, TaskArgs::new().with("done", true)))
            .with_sink(sink.clone());
        chain.invoke(TaskArgs::new()).await.unwrap();
        let spans = sink.spans_named("parent");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].task_id, chain.id());
        assert_eq!(spans[0].output, Some(serde_json::json!({"done": true})));
    }
}
