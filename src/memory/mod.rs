//! 记忆层：对话消息的线上格式与按轮次截取的短期记忆

pub mod conversation;

pub use conversation::{ConversationMemory, FunctionCall, Message, Role, ToolCall};
