//! LLM 调用错误
//!
//! 按「是否瞬时」区分：限流、网络/超时、服务端 5xx 属于瞬时错误，可由重试策略匹配；
//! 客户端 4xx、解析错误等直接上抛。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    /// 429 限流
    RateLimited,
    /// 网络错误或请求超时
    Network,
    /// 5xx
    ServerError,
    /// 其它 4xx（鉴权、参数错误等）
    ClientError,
    /// 响应无法解析
    Parse,
}

impl LlmErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Network | LlmErrorKind::ServerError
        )
    }
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::Network => "network",
            LlmErrorKind::ServerError => "server_error",
            LlmErrorKind::ClientError => "client_error",
            LlmErrorKind::Parse => "parse",
        };
        f.write_str(s)
    }
}

/// Provider 调用失败
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// 服务端建议的等待时间（Retry-After）
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message)
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ServerError, message)
        }
    }

    pub fn client_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ClientError, message)
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Parse, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// HTTP 状态码 -> 错误分类
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Network,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ClientError,
    }
}
