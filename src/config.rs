//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读默认 TOML 文件，再读显式指定的文件，最后用环境变量 `HIVE__*` 覆盖
//! （双下划线表示嵌套，如 `HIVE__RETRY__MAX_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::EngineError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [llm] 段：OpenAI 兼容端点与模型参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 1024,
            request_timeout_secs: 60,
        }
    }
}

/// [retry] 段：Provider 调用的重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter_ms: 250,
        }
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub system_prompt: String,
    /// 提示中带上的最近轮次单元数
    pub memory_window: usize,
    /// 连续多少次相同的工具结果视为卡住
    pub stuck_threshold: usize,
    /// 一轮对话内最多几次工具往返
    pub max_steps: usize,
    pub streaming: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            memory_window: 10,
            stuck_threshold: 3,
            max_steps: 20,
            streaming: false,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// 加载配置；默认文件不存在时全部使用内置默认值
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, EngineError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder
        .build()
        .map_err(|e| EngineError::Config(e.to_string()))?;
    c.try_deserialize()
        .map_err(|e| EngineError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.agent.memory_window, 10);
        assert_eq!(cfg.agent.stuck_threshold, 3);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[retry]\nmax_attempts = 5\n\n[agent]\nstuck_threshold = 2\nstreaming = true\n\n[llm]\nmodel = \"local-model\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 500, "unset keys keep their defaults");
        assert_eq!(cfg.agent.stuck_threshold, 2);
        assert!(cfg.agent.streaming);
        assert_eq!(cfg.llm.model, "local-model");
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let cfg = load_config(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap();
        assert!(cfg.tools.tool_timeout_secs > 0);
    }
}
