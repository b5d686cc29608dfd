//! Provider 重试策略：有限次数 + 指数退避 + 随机抖动
//!
//! 只匹配瞬时错误（限流、网络/超时、5xx）；工具调用失败不走这里，而是作为观察结果交回模型。

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetrySection;
use crate::core::EngineError;
use crate::llm::LlmError;

/// 指数退避的最大指数，防止溢出
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 每次等待额外叠加 [0, jitter] 的随机时长
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter: Duration::from_millis(section.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时长；服务端 Retry-After 优先但不超过 max_delay
    pub fn delay_for(&self, attempt: u32, err: &EngineError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let mut delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if let EngineError::Llm(LlmError {
            retry_after: Some(after),
            ..
        }) = err
        {
            delay = delay.max(*after).min(self.max_delay);
        }
        delay + self.jitter_sample()
    }

    fn jitter_sample(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// 执行 op，瞬时错误按策略重试；非瞬时错误或次数用尽时返回最后一次错误
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(task = label, attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &err);
                    tracing::warn!(
                        task = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(task = label, attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
