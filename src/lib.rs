//! Hive - Rust 异步任务执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态机、校验、错误分类、fallback 与重试、流式任务
//! - **llm**: Provider 抽象、delta 合并、模型调用任务体（OpenAI 兼容 / Mock）
//! - **memory**: 消息线上格式与按轮次截取的对话记忆
//! - **observability**: 日志初始化与 Tracing Sink
//! - **react**: 工具调用 Agent 主循环
//! - **tools**: 工具定义与 Toolkit 并发分发
//! - **workflow**: Chain 顺序组合与 Concurrent 并发扇出

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod workflow;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{EngineError, Runnable, Task, TaskArgs, TaskState};
pub use crate::react::{Agent, AgentEvent, AgentResponse};
