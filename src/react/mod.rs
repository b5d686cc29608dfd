//! Agent 层：提示组装、工具调用主循环、卡死检测与过程事件

pub mod agent;
pub mod events;
pub mod guard;
pub mod prompt;

pub use agent::{Agent, AgentBuilder};
pub use events::{AgentEvent, AgentResponse};
pub use guard::LoopGuard;
pub use prompt::{Example, ExampleSelector, PromptTemplate};
