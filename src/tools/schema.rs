//! 工具参数 JSON Schema 生成（schemars 自动生成）

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;

/// 参数类型 T 的 JSON Schema（object 形式，子类型内联），去掉 `$schema` 与 `title`
pub fn parameters_for<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Value::Object(map) = &mut value {
        map.remove("title");
        map.remove("$schema");
        map.remove("definitions");
        map.entry("type").or_insert_with(|| Value::String("object".into()));
        map.entry("properties").or_insert_with(|| Value::Object(Default::default()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 查询用户资料
    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct PropertyQuery {
        /// 要查询的属性，如 birthday
        asked_property: String,
        verbose: Option<bool>,
    }

    #[test]
    fn test_parameters_schema_shape() {
        let schema = parameters_for::<PropertyQuery>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["asked_property"]));
        assert_eq!(schema["properties"]["asked_property"]["type"], "string");
        assert!(schema.get("title").is_none());
        assert!(schema.get("$schema").is_none());
    }
}
