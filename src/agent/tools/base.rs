//! Base trait for investigation tools.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::{classify_tool_error, ToolErrorKind};

/// Context passed to tools during execution.
pub struct ToolContext {
    /// Directory the investigation is rooted in. Tools must not read
    /// outside it.
    pub working_dir: PathBuf,
    /// Signals that the tool should abort gracefully.
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            cancellation: CancellationToken::new(),
        }
    }
}

/// Structured outcome for a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
    /// Structured error classification when available.
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        let error_kind = Some(classify_tool_error(&message));
        Self {
            ok: false,
            output: message.clone(),
            error: Some(message),
            error_kind,
        }
    }
}

/// One declared tool parameter in registry form.
#[derive(Debug, Clone)]
pub struct ToolParam {
    /// JSON Schema type: `string`, `boolean`, `integer`, ...
    pub kind: &'static str,
    pub description: String,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
}

impl ToolParam {
    pub fn required(kind: &'static str, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    pub fn optional(kind: &'static str, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: false,
            enum_values: None,
        }
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// Convert registry-form parameters to the LLM wire representation
/// `{type: "object", properties, required}`.
pub fn wire_schema(params: &[(String, ToolParam)]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<Value> = Vec::new();
    for (name, param) in params {
        let mut prop = json!({
            "type": param.kind,
            "description": param.description,
        });
        if let Some(values) = &param.enum_values {
            prop["enum"] = json!(values);
        }
        properties.insert(name.clone(), prop);
        if param.required {
            required.push(json!(name));
        }
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
    })
}

/// A capability the investigator can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used in function calls.
    fn name(&self) -> &str;

    /// Description of what the tool does.
    fn description(&self) -> &str;

    /// Declared parameters in registry form (ordered).
    fn parameters(&self) -> Vec<(String, ToolParam)>;

    /// Execute the tool with given arguments.
    async fn execute(&self, args: HashMap<String, Value>, ctx: &ToolContext) -> ToolOutcome;

    /// LLM wire definition: `{name, description, parameters}`.
    fn definition(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": wire_schema(&self.parameters()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTool;

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            "mock_tool"
        }

        fn description(&self) -> &str {
            "A mock tool for testing"
        }

        fn parameters(&self) -> Vec<(String, ToolParam)> {
            vec![
                (
                    "input".to_string(),
                    ToolParam::required("string", "Test input"),
                ),
                (
                    "mode".to_string(),
                    ToolParam::optional("string", "Mode").with_enum(&["fast", "slow"]),
                ),
            ]
        }

        async fn execute(&self, args: HashMap<String, Value>, _ctx: &ToolContext) -> ToolOutcome {
            let input = args.get("input").and_then(|v| v.as_str()).unwrap_or("none");
            ToolOutcome::success(format!("executed with: {}", input))
        }
    }

    #[test]
    fn test_wire_schema_shape() {
        let tool = MockTool;
        let def = tool.definition();
        assert_eq!(def["name"], "mock_tool");
        assert_eq!(def["parameters"]["type"], "object");
        assert_eq!(def["parameters"]["properties"]["input"]["type"], "string");
        let required = def["parameters"]["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "input");
        assert_eq!(
            def["parameters"]["properties"]["mode"]["enum"],
            json!(["fast", "slow"])
        );
    }

    #[tokio::test]
    async fn test_mock_tool_execute() {
        let tool = MockTool;
        let ctx = ToolContext::new(".");
        let mut args = HashMap::new();
        args.insert("input".to_string(), json!("hello"));
        let outcome = tool.execute(args, &ctx).await;
        assert!(outcome.ok);
        assert_eq!(outcome.output, "executed with: hello");
    }

    #[test]
    fn test_outcome_failure_classifies() {
        let outcome = ToolOutcome::failure("未找到文件: x.rs");
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.error_kind,
            Some(ToolErrorKind::NotFound(_))
        ));
    }

    #[test]
    fn test_cancellation_token_in_context() {
        let ctx = ToolContext::new("/tmp");
        assert!(!ctx.cancellation.is_cancelled());
        ctx.cancellation.cancel();
        assert!(ctx.cancellation.is_cancelled());
    }
}
