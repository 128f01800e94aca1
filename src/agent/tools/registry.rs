//! Tool registry for dynamic tool management.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::base::{Tool, ToolContext, ToolOutcome};

/// Registry of investigation tools.
///
/// Registration order is preserved so the tool catalog (and therefore the
/// system prompt) is identical across iterations within a run. An optional
/// allowlist/denylist filters registration: a disallowed tool is silently
/// skipped.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    enabled: Option<HashSet<String>>,
    disabled: HashSet<String>,
}

impl ToolRegistry {
    /// Create a registry with no filters.
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            enabled: None,
            disabled: HashSet::new(),
        }
    }

    /// Create a registry with an allowlist and denylist. An empty `enabled`
    /// slice allows everything not denied.
    pub fn with_filters(enabled: &[String], disabled: &[String]) -> Self {
        Self {
            tools: Vec::new(),
            enabled: if enabled.is_empty() {
                None
            } else {
                Some(enabled.iter().cloned().collect())
            },
            disabled: disabled.iter().cloned().collect(),
        }
    }

    fn allowed(&self, name: &str) -> bool {
        if self.disabled.contains(name) {
            return false;
        }
        match &self.enabled {
            Some(set) => set.contains(name),
            None => true,
        }
    }

    /// Register a tool. Disallowed tools are silently skipped; a tool with
    /// the same name replaces the previous registration.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if !self.allowed(tool.name()) {
            return;
        }
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Registered tool names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// LLM wire definitions for all registered tools, in registration order.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name.
    ///
    /// An unknown name produces a failure listing the available tools so the
    /// model can self-correct. Panics are caught so a single tool failure
    /// cannot crash the loop.
    pub async fn execute(
        &self,
        name: &str,
        args: HashMap<String, Value>,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let tool = match self.get(name) {
            Some(t) => t,
            None => {
                return ToolOutcome::failure(format!(
                    "未知工具 \"{}\"。可用工具: {}",
                    name,
                    self.names().join(", ")
                ));
            }
        };

        let fut = std::panic::AssertUnwindSafe(tool.execute(args, ctx));
        match futures_util::FutureExt::catch_unwind(fut).await {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::failure(format!("工具 \"{}\" 执行时发生内部错误", name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::base::ToolParam;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockTool {
        tool_name: String,
    }

    impl MockTool {
        fn new(name: &str) -> Arc<dyn Tool> {
            Arc::new(Self {
                tool_name: name.to_string(),
            })
        }
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.tool_name
        }

        fn description(&self) -> &str {
            "A mock tool for testing"
        }

        fn parameters(&self) -> Vec<(String, ToolParam)> {
            vec![(
                "value".to_string(),
                ToolParam::required("string", "A value"),
            )]
        }

        async fn execute(&self, args: HashMap<String, Value>, _ctx: &ToolContext) -> ToolOutcome {
            let value = args
                .get("value")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            ToolOutcome::success(format!("{}:{}", self.tool_name, value))
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Always panics"
        }
        fn parameters(&self) -> Vec<(String, ToolParam)> {
            vec![]
        }
        async fn execute(&self, _args: HashMap<String, Value>, _ctx: &ToolContext) -> ToolOutcome {
            panic!("boom");
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("alpha"));
        assert!(registry.has("alpha"));
        assert!(!registry.has("beta"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("dup"));
        registry.register(MockTool::new("dup"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_allowlist_skips_unlisted() {
        let mut registry =
            ToolRegistry::with_filters(&["read_file".to_string()], &[]);
        registry.register(MockTool::new("read_file"));
        registry.register(MockTool::new("ripgrep"));
        assert!(registry.has("read_file"));
        assert!(!registry.has("ripgrep"));
    }

    #[test]
    fn test_denylist_skips_listed() {
        let mut registry = ToolRegistry::with_filters(&[], &["ripgrep".to_string()]);
        registry.register(MockTool::new("read_file"));
        registry.register(MockTool::new("ripgrep"));
        assert!(registry.has("read_file"));
        assert!(!registry.has("ripgrep"));
    }

    #[test]
    fn test_definitions_preserve_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("b"));
        registry.register(MockTool::new("a"));
        let names: Vec<String> = registry
            .definitions()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_execute_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("echo"));
        let ctx = ToolContext::new(".");
        let mut args = HashMap::new();
        args.insert("value".to_string(), json!("hello"));

        let outcome = registry.execute("echo", args, &ctx).await;
        assert!(outcome.ok);
        assert_eq!(outcome.output, "echo:hello");
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_lists_available() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("read_file"));
        registry.register(MockTool::new("think"));
        let ctx = ToolContext::new(".");

        let outcome = registry.execute("magic_wand", HashMap::new(), &ctx).await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("magic_wand"));
        assert!(outcome.output.contains("read_file"));
        assert!(outcome.output.contains("think"));
    }

    #[tokio::test]
    async fn test_execute_panicking_tool_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanickingTool));
        let ctx = ToolContext::new(".");

        let outcome = registry.execute("boom", HashMap::new(), &ctx).await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("boom"));
    }
}
