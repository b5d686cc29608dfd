//! 任务体装饰器：构造时按需叠加在 TaskBody 外层，与被装饰者实现同一接口

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{EngineError, RetryPolicy, TaskArgs, TaskBody};

/// 对瞬时错误按 RetryPolicy 重试
pub struct Retrying {
    inner: Arc<dyn TaskBody>,
    policy: RetryPolicy,
    label: String,
}

impl Retrying {
    pub fn new(inner: Arc<dyn TaskBody>, policy: RetryPolicy, label: impl Into<String>) -> Self {
        Self {
            inner,
            policy,
            label: label.into(),
        }
    }
}

#[async_trait]
impl TaskBody for Retrying {
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        self.policy
            .run(&self.label, || self.inner.run(args.clone()))
            .await
    }

    fn process_output(&self, output: TaskArgs) -> Result<TaskArgs, EngineError> {
        self.inner.process_output(output)
    }
}

/// 单次执行超时，超时转为 EngineError::Timeout（不在重试集合内）
pub struct TimeLimited {
    inner: Arc<dyn TaskBody>,
    limit: Duration,
}

impl TimeLimited {
    pub fn new(inner: Arc<dyn TaskBody>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl TaskBody for TimeLimited {
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        tokio::time::timeout(self.limit, self.inner.run(args))
            .await
            .map_err(|_| EngineError::Timeout(self.limit))?
    }

    fn process_output(&self, output: TaskArgs) -> Result<TaskArgs, EngineError> {
        self.inner.process_output(output)
    }
}
