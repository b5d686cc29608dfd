//! 组合原语：顺序 Chain 与并发 Concurrent，二者都实现 Runnable，可互相嵌套

pub mod chain;
pub mod concurrent;

pub use chain::Chain;
pub use concurrent::{Concurrent, ConcurrentInput};
