//! 核心引擎：任务状态机、校验、错误与恢复、重试与装饰器、评估、流式任务

pub mod args;
pub mod error;
pub mod evaluator;
pub mod layers;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod streaming;
pub mod task;
pub mod validator;

pub use args::TaskArgs;
pub use error::{EngineError, ValidationPhase};
pub use evaluator::{Evaluator, ScoreEvaluator};
pub use layers::{Retrying, TimeLimited};
pub use recovery::{FailureKind, FallbackStrategy, RecoveryAction};
pub use retry::RetryPolicy;
pub use state::{StateMachine, TaskState};
pub use streaming::{DeltaStream, StreamBody, StreamEvent, StreamingTask};
pub use task::{FnBody, Runnable, Task, TaskBody, TaskBuilder};
pub use validator::{FieldType, ValidationError, Validator, Violation};
