//! 失败恢复：失败类别 -> 恢复策略
//!
//! 任务失败（进入 FAILED）后按 EngineError::kind() 查表：
//! Retry 用调整后的参数重新调用同一任务体（次数有上限），Reraise 或未登记则原样上抛。

use std::fmt;
use std::sync::Arc;

use crate::core::{EngineError, TaskArgs};

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    StateMachine,
    /// 限流、网络、5xx
    TransientProvider,
    Provider,
    UnknownTool,
    Timeout,
    Serialization,
    Execution,
}

/// 参数调整函数：(上一次参数, 失败原因) -> 新参数
pub type ArgsAdjuster = Arc<dyn Fn(TaskArgs, &EngineError) -> TaskArgs + Send + Sync>;

/// 恢复策略
#[derive(Clone)]
pub enum FallbackStrategy {
    /// 调整参数后重新执行，最多 max_retries 次
    Retry {
        max_retries: u32,
        adjust: ArgsAdjuster,
    },
    /// 原样上抛
    Reraise,
}

impl FallbackStrategy {
    pub fn retry_with(
        max_retries: u32,
        adjust: impl Fn(TaskArgs, &EngineError) -> TaskArgs + Send + Sync + 'static,
    ) -> Self {
        FallbackStrategy::Retry {
            max_retries,
            adjust: Arc::new(adjust),
        }
    }

    /// 参数不变，单纯重跑
    pub fn retry_unchanged(max_retries: u32) -> Self {
        Self::retry_with(max_retries, |args, _| args)
    }
}

impl fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackStrategy::Retry { max_retries, .. } => f
                .debug_struct("Retry")
                .field("max_retries", max_retries)
                .finish_non_exhaustive(),
            FallbackStrategy::Reraise => f.write_str("Reraise"),
        }
    }
}

/// 恢复引擎给出的动作
#[derive(Debug)]
pub enum RecoveryAction {
    RetryWith(TaskArgs),
    Abort,
}

/// 根据失败与已用重试次数决定下一步
pub fn decide(
    strategy: Option<&FallbackStrategy>,
    err: &EngineError,
    args: &TaskArgs,
    retries_used: u32,
) -> RecoveryAction {
    if err.is_fatal() {
        return RecoveryAction::Abort;
    }
    match strategy {
        Some(FallbackStrategy::Retry {
            max_retries,
            adjust,
        }) if retries_used < *max_retries => RecoveryAction::RetryWith(adjust(args.clone(), err)),
        _ => RecoveryAction::Abort,
    }
}
