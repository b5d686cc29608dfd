//! 引擎错误类型
//!
//! 与 recovery 模块配合：kind() 给出失败类别，任务据此在 fallback 表中查找恢复策略。
//! 校验错误与状态机错误是致命的，既不重试也不走 fallback。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::recovery::FailureKind;
use crate::core::validator::ValidationError;
use crate::core::TaskState;
use crate::llm::LlmError;

/// 校验发生在哪一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Input,
    Output,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Input => f.write_str("input"),
            ValidationPhase::Output => f.write_str("output"),
        }
    }
}

/// 任务执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{phase} validation failed: {source}")]
    Validation {
        phase: ValidationPhase,
        #[source]
        source: ValidationError,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// 调用 future 在结束前被丢弃（外层超时或 select 取消）
    #[error("Invocation cancelled before completion")]
    Cancelled,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Structured output rejected: {0}")]
    StructuredOutput(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn input_validation(source: ValidationError) -> Self {
        EngineError::Validation {
            phase: ValidationPhase::Input,
            source,
        }
    }

    pub fn output_validation(source: ValidationError) -> Self {
        EngineError::Validation {
            phase: ValidationPhase::Output,
            source,
        }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        EngineError::Execution(msg.into())
    }

    /// fallback 表的查找键
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Validation { .. } | EngineError::StructuredOutput(_) => {
                FailureKind::Validation
            }
            EngineError::InvalidStateTransition { .. } => FailureKind::StateMachine,
            EngineError::Llm(e) if e.is_transient() => FailureKind::TransientProvider,
            EngineError::Llm(_) => FailureKind::Provider,
            EngineError::UnknownTool(_) => FailureKind::UnknownTool,
            EngineError::Timeout(_) | EngineError::Cancelled => FailureKind::Timeout,
            EngineError::Serialization(_) => FailureKind::Serialization,
            EngineError::Execution(_)
            | EngineError::InvalidMessage(_)
            | EngineError::InvalidInput(_)
            | EngineError::Config(_) => FailureKind::Execution,
        }
    }

    /// 可由 Provider 重试策略匹配的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Llm(e) if e.is_transient())
    }

    /// 致命错误：不重试、不走 fallback，原样交给调用方
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Validation | FailureKind::StateMachine | FailureKind::UnknownTool
        )
    }
}
