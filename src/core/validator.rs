//! 输入/输出校验器
//!
//! 由「字段名 -> 声明类型」表构成，在任务体运行前后对 TaskArgs 做结构检查；
//! 缺失必填字段或类型不符时快速失败并给出全部违规项。默认校验器接受任何输入。
//! 由 JSON Schema 构造时还会保留编译后的完整 Schema，字段表通过后再做嵌套结构、
//! enum 与数组元素等检查。

use std::fmt;
use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;
use thiserror::Error;

use crate::core::args::json_type_name;
use crate::core::TaskArgs;

/// 声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Null => value.is_null(),
        }
    }

    fn from_schema_name(name: &str) -> Self {
        match name {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            "null" => FieldType::Null,
            _ => FieldType::Any,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Null => "null",
        };
        f.write_str(s)
    }
}

/// 单个字段声明；types 有多个时任一匹配即可（如可空字段 string|null）
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub types: Vec<FieldType>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing { field: String },
    WrongType {
        field: String,
        expected: String,
        found: &'static str,
    },
    /// 完整 Schema 检查失败；path 为 JSON Pointer
    Schema { path: String, message: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing { field } => write!(f, "missing required field '{field}'"),
            Violation::WrongType {
                field,
                expected,
                found,
            } => write!(f, "field '{field}' expected {expected}, found {found}"),
            Violation::Schema { path, message } if path.is_empty() => f.write_str(message),
            Violation::Schema { path, message } => write!(f, "{path}: {message}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 编译后的 JSON Schema
#[derive(Clone)]
struct CompiledSchema(Arc<jsonschema::Validator>);

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledSchema")
    }
}

/// 字段表校验器
#[derive(Debug, Clone, Default)]
pub struct Validator {
    fields: Vec<FieldSpec>,
    schema: Option<CompiledSchema>,
}

impl Validator {
    /// 接受任何输入
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            types: vec![ty],
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            types: vec![ty],
            required: false,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 从 JSON Schema（object 形式）读取 properties / required / type，并编译完整 Schema
    ///
    /// Schema 本身无法编译时只保留字段表检查。
    pub fn from_json_schema(schema: &Value) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let fields = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| FieldSpec {
                        name: name.clone(),
                        types: schema_types(prop),
                        required: required.contains(&name.as_str()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let compiled = match jsonschema::validator_for(schema) {
            Ok(validator) => Some(CompiledSchema(Arc::new(validator))),
            Err(e) => {
                tracing::warn!(error = %e, "invalid JSON schema, falling back to field checks");
                None
            }
        };

        Self {
            fields,
            schema: compiled,
        }
    }

    /// 由 schemars 生成的类型 Schema 推导字段表
    pub fn for_type<T: JsonSchema>() -> Self {
        let schema = schema_for!(T);
        match serde_json::to_value(&schema) {
            Ok(value) => Self::from_json_schema(&value),
            Err(_) => Self::accept_all(),
        }
    }

    pub fn validate(&self, args: &TaskArgs) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        for field in &self.fields {
            match args.get(&field.name) {
                None => {
                    if field.required {
                        violations.push(Violation::Missing {
                            field: field.name.clone(),
                        });
                    }
                }
                // 可选字段显式为 null 等同于缺省
                Some(Value::Null) if !field.required => {}
                Some(value) => {
                    if !field.types.iter().any(|t| t.matches(value)) {
                        violations.push(Violation::WrongType {
                            field: field.name.clone(),
                            expected: field
                                .types
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join("|"),
                            found: json_type_name(value),
                        });
                    }
                }
            }
        }
        if violations.is_empty() {
            violations = self.schema_violations(args);
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

    fn schema_violations(&self, args: &TaskArgs) -> Vec<Violation> {
        let Some(CompiledSchema(schema)) = &self.schema else {
            return Vec::new();
        };
        // 与字段表一致：可选字段为 null 视为缺省
        let mut instance = args.as_map().clone();
        instance.retain(|name, value| {
            !value.is_null() || self.fields.iter().any(|f| f.required && &f.name == name)
        });
        let instance = Value::Object(instance);
        schema
            .iter_errors(&instance)
            .map(|e| Violation::Schema {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect()
    }
}

fn schema_types(prop: &Value) -> Vec<FieldType> {
    match prop.get("type") {
        Some(Value::String(s)) => vec![FieldType::from_schema_name(s)],
        Some(Value::Array(list)) => {
            let types: Vec<FieldType> = list
                .iter()
                .filter_map(Value::as_str)
                .map(FieldType::from_schema_name)
                .collect();
            if types.is_empty() {
                vec![FieldType::Any]
            } else {
                types
            }
        }
        // $ref / anyOf 等复杂声明不做深入检查
        _ => vec![FieldType::Any],
    }
}
