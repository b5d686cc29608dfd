//! LLM 层：Provider 抽象、流式 delta 合并、模型调用任务体与客户端实现（OpenAI 兼容 / Mock）

pub mod error;
pub mod mock;
pub mod model_call;
pub mod openai;
pub mod stream;
pub mod traits;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use mock::{MockLlmClient, MockReply};
pub use model_call::{ModelCall, ModelInput, ModelSettings};
pub use openai::OpenAiClient;
pub use stream::{merge_deltas, DeltaAccumulator, DeltaKind, DeltaStatus, StreamDelta, ToolCallFragment};
pub use traits::{
    Completion, CompletionRequest, FinishReason, FunctionSchema, LlmClient, LlmDeltaStream,
    TokenUsage, ToolSchema,
};
