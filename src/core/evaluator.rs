//! 评估器：任务成功后按顺序执行的旁路任务
//!
//! 评估是观察性的，失败只记日志，不影响所属任务的结果。

use async_trait::async_trait;

use crate::core::TaskArgs;
use crate::observability::TraceHandle;

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, output: &TaskArgs, trace: &TraceHandle) -> anyhow::Result<()>;
}

/// 由闭包计算分数并写入 trace
pub struct ScoreEvaluator<F> {
    name: String,
    score: F,
}

impl<F> ScoreEvaluator<F>
where
    F: Fn(&TaskArgs) -> anyhow::Result<f64> + Send + Sync,
{
    pub fn new(name: impl Into<String>, score: F) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

#[async_trait]
impl<F> Evaluator for ScoreEvaluator<F>
where
    F: Fn(&TaskArgs) -> anyhow::Result<f64> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, output: &TaskArgs, trace: &TraceHandle) -> anyhow::Result<()> {
        let value = (self.score)(output)?;
        trace.score(&self.name, value);
        Ok(())
    }
}

/// 依次执行评估器，吞掉错误
pub(crate) async fn run_evaluators(
    evaluators: &[std::sync::Arc<dyn Evaluator>],
    task_name: &str,
    output: &TaskArgs,
    trace: &TraceHandle,
) {
    for evaluator in evaluators {
        if let Err(e) = evaluator.evaluate(output, trace).await {
            tracing::warn!(
                task = task_name,
                evaluator = evaluator.name(),
                error = %e,
                "evaluator failed"
            );
        }
    }
}
