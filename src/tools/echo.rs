//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::Tool;

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string", "description": "text to echo" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        args.get("text")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| "missing 'text'".to_string())
    }
}
