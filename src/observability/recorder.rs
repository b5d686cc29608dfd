//! 内存 Tracing Sink：记录全部 span，供测试与本地排查

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::observability::sink::{SpanId, SpanOutcome, SpanStart, TraceSink};

#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub id: SpanId,
    pub name: String,
    pub task_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub scores: Vec<(String, f64)>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    spans: Mutex<Vec<SpanRecord>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn spans_named(&self, name: &str) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }
}

impl TraceSink for InMemoryTraceSink {
    fn begin_span(&self, start: SpanStart) -> SpanId {
        let id = Uuid::new_v4().to_string();
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(SpanRecord {
                id: id.clone(),
                name: start.name,
                task_id: start.task_id,
                parent_id: start.parent_id,
                input: start.input,
                output: None,
                error: None,
                scores: Vec::new(),
                started_at: Utc::now(),
                ended_at: None,
            });
        }
        id
    }

    fn end_span(&self, span: &SpanId, outcome: SpanOutcome) {
        if let Ok(mut spans) = self.spans.lock() {
            if let Some(record) = spans.iter_mut().find(|s| &s.id == span) {
                match outcome {
                    SpanOutcome::Output(v) => record.output = Some(v),
                    SpanOutcome::Error(e) => record.error = Some(e),
                }
                record.ended_at = Some(Utc::now());
            }
        }
    }

    fn score(&self, span: &SpanId, name: &str, value: f64) {
        if let Ok(mut spans) = self.spans.lock() {
            if let Some(record) = spans.iter_mut().find(|s| &s.id == span) {
                record.scores.push((name.to_string(), value));
            }
        }
    }
}
