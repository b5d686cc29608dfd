//! 提示组装：system、历史窗口、固定示例、检索示例，最后是本轮消息

use std::sync::Arc;

use async_trait::async_trait;

use crate::memory::{ConversationMemory, Message};

/// 一对示例输入/输出，展开为 user + assistant 两条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input: String,
    pub output: String,
}

impl Example {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    fn to_messages(&self) -> [Message; 2] {
        [Message::user(&self.input), Message::assistant(&self.output)]
    }
}

/// 按本轮输入挑选示例（如相似度检索），实现方自行决定来源
#[async_trait]
pub trait ExampleSelector: Send + Sync {
    async fn select(&self, input: &str) -> Vec<Example>;
}

#[derive(Clone)]
pub struct PromptTemplate {
    system_prompt: String,
    memory_window: usize,
    examples: Vec<Example>,
    selector: Option<Arc<dyn ExampleSelector>>,
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>, memory_window: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            memory_window,
            examples: Vec::new(),
            selector: None,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn set_memory_window(&mut self, window: usize) {
        self.memory_window = window;
    }

    pub fn add_example(&mut self, example: Example) {
        self.examples.push(example);
    }

    pub fn set_selector(&mut self, selector: Arc<dyn ExampleSelector>) {
        self.selector = Some(selector);
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 每轮对话开始时调用一次，结果在本轮的多次模型调用间复用
    pub async fn select_examples(&self, input: &str) -> Vec<Message> {
        let Some(selector) = &self.selector else {
            return Vec::new();
        };
        let selected = selector.select(input).await;
        tracing::debug!(count = selected.len(), "examples selected");
        selected.iter().flat_map(Example::to_messages).collect()
    }

    /// turn_start 之前是历史（按窗口截取），之后是本轮已写入记忆的消息
    pub fn build(
        &self,
        memory: &ConversationMemory,
        turn_start: usize,
        selected: &[Message],
    ) -> Vec<Message> {
        let mut messages = Vec::new();
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(&self.system_prompt));
        }
        messages.extend_from_slice(memory.history(turn_start, self.memory_window));
        messages.extend(self.examples.iter().flat_map(Example::to_messages));
        messages.extend_from_slice(selected);
        let current = memory.messages().get(turn_start..).unwrap_or_default();
        messages.extend_from_slice(current);
        messages
    }
}

impl std::fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTemplate")
            .field("system_prompt", &self.system_prompt)
            .field("memory_window", &self.memory_window)
            .field("examples", &self.examples.len())
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    struct KeywordSelector;

    #[async_trait]
    impl ExampleSelector for KeywordSelector {
        async fn select(&self, input: &str) -> Vec<Example> {
            if input.contains("weather") {
                vec![Example::new("weather in Paris?", "Sunny.")]
            } else {
                Vec::new()
            }
        }
    }

    #[tokio::test]
    async fn test_prompt_order() {
        let mut memory = ConversationMemory::new();
        memory.push(Message::user("old question")).unwrap();
        memory.push(Message::assistant("old answer")).unwrap();
        memory.push(Message::user("very old follow-up")).unwrap();
        memory.push(Message::assistant("follow-up answer")).unwrap();
        let turn_start = memory.len();
        memory.push(Message::user("what is the weather?")).unwrap();

        let mut template = PromptTemplate::new("be brief", 2);
        template.add_example(Example::new("2+2?", "4"));
        template.set_selector(Arc::new(KeywordSelector));

        let selected = template.select_examples("what is the weather?").await;
        let messages = template.build(&memory, turn_start, &selected);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "be brief",
                "very old follow-up",
                "follow-up answer",
                "2+2?",
                "4",
                "weather in Paris?",
                "Sunny.",
                "what is the weather?",
            ]
        );
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn test_empty_system_prompt_omitted() {
        let mut memory = ConversationMemory::new();
        memory.push(Message::user("hi")).unwrap();
        let messages = PromptTemplate::new("", 10).build(&memory, 0, &[]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
