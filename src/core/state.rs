//! 任务状态机
//!
//! 合法迁移表是固定数据而非推导：任何不在表内的迁移都是编程错误（InvalidStateTransition），
//! 立即返回且不改变当前状态。COMPLETE 与 FAILED 都可作为下一次调用的起点。

use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::Serialize;

use crate::core::EngineError;

/// 任务生命周期状态（按规范顺序）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Init,
    InputValidation,
    Running,
    OutputValidation,
    ProcessingOutput,
    Evaluating,
    Complete,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Init,
        TaskState::InputValidation,
        TaskState::Running,
        TaskState::OutputValidation,
        TaskState::ProcessingOutput,
        TaskState::Evaluating,
        TaskState::Complete,
        TaskState::Failed,
    ];

    /// 从当前状态出发允许到达的状态
    pub fn allowed_next(self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            Init => &[InputValidation, Failed],
            InputValidation => &[Running, Failed],
            Running => &[OutputValidation, Failed],
            // 流式任务每个分片都会重新进入 OUTPUT_VALIDATION
            OutputValidation => &[OutputValidation, ProcessingOutput, Failed],
            ProcessingOutput => &[Evaluating, Complete, Failed],
            Evaluating => &[Complete, Failed],
            Complete => &[InputValidation],
            Failed => &[InputValidation],
        }
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// 可以接受新调用的状态
    pub fn accepts_invocation(self) -> bool {
        matches!(self, TaskState::Init | TaskState::Complete | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "INIT",
            TaskState::InputValidation => "INPUT_VALIDATION",
            TaskState::Running => "RUNNING",
            TaskState::OutputValidation => "OUTPUT_VALIDATION",
            TaskState::ProcessingOutput => "PROCESSING_OUTPUT",
            TaskState::Evaluating => "EVALUATING",
            TaskState::Complete => "COMPLETE",
            TaskState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// 状态持有者：唯一的修改入口是 transition
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: TaskState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: TaskState::Init,
        }
    }

    /// 以指定状态起步（组合体恢复、测试）
    pub fn starting_at(state: TaskState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }

    /// 任意非终态 -> FAILED；已是 FAILED 时保持不变
    pub fn fail(&mut self) {
        if self.state != TaskState::Failed && self.state.can_transition_to(TaskState::Failed) {
            self.state = TaskState::Failed;
        }
    }
}

/// 调用被中途丢弃时的收尾：状态置为 FAILED，关闭进行中的 span
pub(crate) trait Abandon {
    fn abandon(&mut self);
}

/// 在一次调用期间独占目标；未 disarm 就被 drop 时触发 abandon
pub(crate) struct InvocationGuard<'a, T: Abandon> {
    target: &'a mut T,
    armed: bool,
}

impl<'a, T: Abandon> InvocationGuard<'a, T> {
    pub(crate) fn new(target: &'a mut T) -> Self {
        Self {
            target,
            armed: true,
        }
    }

    /// 调用已正常走完（成功或已记录的失败）
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Abandon> Deref for InvocationGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.target
    }
}

impl<T: Abandon> DerefMut for InvocationGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.target
    }
}

impl<T: Abandon> Drop for InvocationGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.target.abandon();
        }
    }
}
