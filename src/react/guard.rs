//! 工具循环卡死检测
//!
//! 记录最近 K 次工具往返的结果签名；K 次全部相同即视为卡住，
//! Agent 下一次调用模型时不再提供工具，迫使其直接作答。

use std::collections::VecDeque;

use crate::tools::ToolOutcome;

#[derive(Debug, Clone)]
pub struct LoopGuard {
    threshold: usize,
    recent: VecDeque<String>,
    stuck: bool,
}

impl LoopGuard {
    /// threshold 为 0 时不检测
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            recent: VecDeque::with_capacity(threshold),
            stuck: false,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 记录一次工具往返，返回此后是否处于卡住状态
    pub fn record(&mut self, outcomes: &[ToolOutcome]) -> bool {
        if self.threshold == 0 {
            return false;
        }
        if self.recent.len() == self.threshold {
            self.recent.pop_front();
        }
        self.recent.push_back(signature(outcomes));

        if self.recent.len() == self.threshold {
            let first = &self.recent[0];
            if self.recent.iter().all(|s| s == first) {
                self.stuck = true;
            }
        }
        self.stuck
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    /// 新一轮对话开始时清空
    pub fn reset(&mut self) {
        self.recent.clear();
        self.stuck = false;
    }
}

/// 一次往返的签名：工具名与结果文本，call id 不参与比较
fn signature(outcomes: &[ToolOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("{}\u{1f}{}\u{1f}{}", o.name, o.is_error, o.content))
        .collect::<Vec<_>>()
        .join("\u{1e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, content: &str) -> Vec<ToolOutcome> {
        vec![ToolOutcome {
            call_id: id.to_string(),
            name: "lookup".to_string(),
            content: content.to_string(),
            is_error: false,
        }]
    }

    #[test]
    fn test_identical_results_trip_guard() {
        let mut guard = LoopGuard::new(3);
        assert!(!guard.record(&outcome("1", "same")));
        assert!(!guard.record(&outcome("2", "same")));
        assert!(guard.record(&outcome("3", "same")));
        assert!(guard.is_stuck());

        guard.reset();
        assert!(!guard.is_stuck());
    }

    #[test]
    fn test_varied_results_do_not_trip() {
        let mut guard = LoopGuard::new(2);
        assert!(!guard.record(&outcome("1", "a")));
        assert!(!guard.record(&outcome("2", "b")));
        assert!(!guard.record(&outcome("3", "c")));
        assert!(guard.record(&outcome("4", "c")));
    }

    #[test]
    fn test_zero_threshold_disabled() {
        let mut guard = LoopGuard::new(0);
        for i in 0..5 {
            assert!(!guard.record(&outcome(&i.to_string(), "same")));
        }
    }
}
