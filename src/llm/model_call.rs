//! 模型调用任务体：同一个类型既可作为 Task（非流式）也可作为 StreamingTask（流式）的 body
//!
//! 输入 `{messages, tools?}`，输出序列化后的 Completion。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::LlmSection;
use crate::core::{DeltaStream, EngineError, FieldType, StreamBody, TaskArgs, TaskBody, Validator};
use crate::llm::{CompletionRequest, LlmClient, ToolSchema};
use crate::memory::Message;

/// 每次调用带上的模型参数
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl From<&LlmSection> for ModelSettings {
    fn from(section: &LlmSection) -> Self {
        Self {
            model: section.model.clone(),
            temperature: Some(section.temperature),
            max_tokens: Some(section.max_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInput {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
}

impl ModelInput {
    pub fn new(messages: Vec<Message>, tools: Vec<ToolSchema>) -> Self {
        Self {
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }

    pub fn into_args(self) -> Result<TaskArgs, EngineError> {
        TaskArgs::from_typed(&self)
    }
}

pub struct ModelCall {
    client: Arc<dyn LlmClient>,
    settings: ModelSettings,
}

impl ModelCall {
    pub fn new(client: Arc<dyn LlmClient>, settings: ModelSettings) -> Self {
        Self { client, settings }
    }

    pub fn input_validator() -> Validator {
        Validator::new()
            .required("messages", FieldType::Array)
            .optional("tools", FieldType::Array)
    }

    pub fn output_validator() -> Validator {
        Validator::new()
            .optional("content", FieldType::String)
            .required("tool_calls", FieldType::Array)
            .required("finish_reason", FieldType::String)
    }

    fn request(&self, args: TaskArgs) -> Result<CompletionRequest, EngineError> {
        let input: ModelInput = args.into_typed()?;
        Ok(CompletionRequest {
            messages: input.messages,
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: input.tools,
        })
    }
}

#[async_trait]
impl TaskBody for ModelCall {
    async fn run(&self, args: TaskArgs) -> Result<TaskArgs, EngineError> {
        let request = self.request(args)?;
        let completion = self.client.complete(&request).await?;
        TaskArgs::from_typed(&completion)
    }
}

#[async_trait]
impl StreamBody for ModelCall {
    async fn open(&self, args: TaskArgs) -> Result<DeltaStream, EngineError> {
        let request = self.request(args)?;
        let deltas = self.client.complete_stream(&request).await?;
        Ok(Box::pin(deltas.map(|item| item.map_err(EngineError::from))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StreamingTask, Task, TaskState};
    use crate::llm::{Completion, MockLlmClient};

    fn input() -> TaskArgs {
        ModelInput::new(vec![Message::user("hello")], Vec::new())
            .into_args()
            .unwrap()
    }

    #[tokio::test]
    async fn test_model_call_as_task() {
        let client = Arc::new(MockLlmClient::new().text("hi there"));
        let body = ModelCall::new(
            client.clone(),
            ModelSettings {
                model: "mock".into(),
                ..ModelSettings::default()
            },
        );
        let mut task = Task::builder("model", body)
            .input_validator(ModelCall::input_validator())
            .output_validator(ModelCall::output_validator())
            .build();
        let out: Completion = task.invoke(input()).await.unwrap().into_typed().unwrap();
        assert_eq!(out.content.as_deref(), Some("hi there"));
        assert_eq!(client.requests()[0].model, "mock");
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn test_model_call_as_stream() {
        let client = Arc::new(MockLlmClient::new().text("a streamed reply"));
        let mut task = StreamingTask::new("model", ModelCall::new(client, ModelSettings::default()))
            .with_output_validator(ModelCall::output_validator());
        let out: Completion = task
            .run_to_completion(input())
            .await
            .unwrap()
            .into_typed()
            .unwrap();
        assert_eq!(out.content.as_deref(), Some("a streamed reply"));
    }

    #[tokio::test]
    async fn test_missing_messages_rejected() {
        let client = Arc::new(MockLlmClient::new());
        let mut task = Task::builder("model", ModelCall::new(client.clone(), ModelSettings::default()))
            .input_validator(ModelCall::input_validator())
            .build();
        assert!(task.invoke(TaskArgs::new()).await.is_err());
        assert_eq!(client.calls(), 0);
    }
}
