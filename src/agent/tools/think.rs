//! Self-check tool: a scratchpad the model must use before concluding.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use super::base::{Tool, ToolContext, ToolOutcome, ToolParam};

/// Records a self-check thought. Calling this tool is the precondition for
/// ending the investigation with the completion sentinel.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "在结束调查前对你的发现进行自检: 逐条核对结论是否有工具结果支持、是否有遗漏的线索。"
    }

    fn parameters(&self) -> Vec<(String, ToolParam)> {
        vec![(
            "thought".to_string(),
            ToolParam::required("string", "自检内容: 核对结论与证据的对应关系"),
        )]
    }

    async fn execute(&self, args: HashMap<String, Value>, _ctx: &ToolContext) -> ToolOutcome {
        let thought = args.get("thought").and_then(|v| v.as_str()).unwrap_or("");
        if thought.trim().is_empty() {
            return ToolOutcome::failure("缺少 thought 参数");
        }
        ToolOutcome::success(
            "自检已记录。确认所有结论都有工具结果支持后，输出 [INVESTIGATION_COMPLETE] 并给出调查结论。",
        )
    }
}
