//! 可观测性：日志订阅器初始化与 Tracing Sink（span / score 记录）

pub mod recorder;
pub mod sink;

pub use recorder::{InMemoryTraceSink, SpanRecord};
pub use sink::{noop_sink, NoopTraceSink, SpanId, SpanOutcome, SpanStart, TraceHandle, TraceSink};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局日志订阅器（RUST_LOG 优先，默认 info）；重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
