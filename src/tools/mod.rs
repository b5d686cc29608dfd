//! 工具层：Tool trait、闭包工具、参数 schema 生成与 Toolkit 并发分发

pub mod echo;
pub mod registry;
pub mod schema;
pub mod toolkit;

pub use echo::EchoTool;
pub use registry::{typed_tool, AsyncFnTool, FnTool, Tool, ToolDefinition};
pub use schema::parameters_for;
pub use toolkit::{ToolOutcome, Toolkit};
