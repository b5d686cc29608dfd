//! 任务参数：具名值映射（JSON 对象）
//!
//! Chain 中上一个任务的输出整体成为下一个任务的输入，因此所有任务共用这一载体；
//! 类型化的请求/响应结构通过 from_typed / into_typed 在边界处转换。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskArgs(Map<String, Value>);

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建式插入
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// JSON 值必须是对象
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EngineError::InvalidInput(format!(
                "task arguments must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, EngineError> {
        Self::from_value(serde_json::to_value(value)?)
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, EngineError> {
        Ok(serde_json::from_value(Value::Object(self.0))?)
    }
}

impl From<Map<String, Value>> for TaskArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for TaskArgs {
    type Error = EngineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Query {
        text: String,
        limit: u32,
    }

    #[test]
    fn test_typed_boundary() {
        let args = TaskArgs::from_typed(&Query {
            text: "hi".into(),
            limit: 3,
        })
        .unwrap();
        assert_eq!(args.get_str("text"), Some("hi"));
        let back: Query = args.into_typed().unwrap();
        assert_eq!(back.limit, 3);
    }

    #[test]
    fn test_non_object_rejected() {
        let err = TaskArgs::try_from(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("array"));
    }
}
