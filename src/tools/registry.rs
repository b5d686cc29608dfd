//! 工具定义
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 注册进 Toolkit 时固化为不可变的 ToolDefinition。闭包可通过 FnTool（同步）或 AsyncFnTool（异步）包装成工具。

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::llm::ToolSchema;
use crate::tools::schema::parameters_for;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 function.name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 中的文本会作为工具错误交回模型
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 注册后的工具：名称、描述、参数 schema 与可调用对象，构造后不可变
#[derive(Clone)]
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
    tool: Arc<dyn Tool>,
}

impl ToolDefinition {
    pub fn new(tool: impl Tool + 'static) -> Self {
        Self::from_arc(Arc::new(tool))
    }

    pub fn from_arc(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
            tool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn tool(&self) -> Arc<dyn Tool> {
        self.tool.clone()
    }

    /// 暴露给模型的函数声明
    pub fn schema(&self) -> ToolSchema {
        ToolSchema::function(&self.name, &self.description, self.parameters.clone())
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// 同步闭包工具
pub struct FnTool<F> {
    name: String,
    description: String,
    parameters: Value,
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<String, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value, f: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            f,
        }
    }
}

/// 参数按类型 A 反序列化，schema 由 schemars 生成
pub fn typed_tool<A, F>(
    name: impl Into<String>,
    description: impl Into<String>,
    f: F,
) -> FnTool<impl Fn(Value) -> Result<String, String> + Send + Sync>
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A) -> Result<String, String> + Send + Sync,
{
    FnTool::new(name, description, parameters_for::<A>(), move |args: Value| {
        let parsed: A = serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        f(parsed)
    })
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> Result<String, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.f)(args)
    }
}

/// 异步闭包工具
pub struct AsyncFnTool<F, Fut> {
    name: String,
    description: String,
    parameters: Value,
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value, f: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for AsyncFnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.f)(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_typed_tool_parses_arguments() {
        let tool = typed_tool("add", "Add two integers", |args: Add| Ok((args.a + args.b).to_string()));
        let def = ToolDefinition::new(tool);
        assert_eq!(def.name(), "add");
        assert_eq!(def.parameters()["required"], json!(["a", "b"]));
        assert_eq!(def.tool().execute(json!({"a": 2, "b": 3})).await.unwrap(), "5");
        let err = def.tool().execute(json!({"a": "x"})).await.unwrap_err();
        assert!(err.starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_async_fn_tool() {
        let tool = AsyncFnTool::new("later", "Answers later", json!({"type": "object"}), |_args| async {
            tokio::task::yield_now().await;
            Ok::<_, String>("done".to_string())
        });
        assert_eq!(tool.execute(json!({})).await.unwrap(), "done");
        let schema = ToolDefinition::new(tool).schema();
        assert_eq!(schema.schema_type, "function");
        assert_eq!(schema.function.name, "later");
    }
}
