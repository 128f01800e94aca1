//! Fixed system prompt templates.
//!
//! The investigator prompt is constructed identically across iterations
//! within a run (the tool set does not change), so providers with prefix
//! caching can reuse it. Correctness never depends on caching.

use serde_json::Value;

/// Static investigator template. The tool catalog is appended at run start.
pub const INVESTIGATOR_TEMPLATE: &str = "\
你是一名代码调查助手，负责在工作目录中调查代码库并回答用户的问题。

## 工作方式

1. 通过函数调用（tool use）执行工具来收集证据，每个回合只调用一个工具。
2. 绝不要在文本中描述或伪造工具调用及其结果。工具只能通过函数调用接口执行。
3. 所有结论必须有工具结果支持，引用代码时注明文件路径。
4. 结束调查之前，必须先调用 think 工具对你的发现逐条自检。
5. 自检完成后，输出 [INVESTIGATION_COMPLETE]，换行后给出调查结论。
6. 看到 [COMPRESSED:key] 占位符时，如需完整内容，调用 recall_detail(key=\"...\")。

## 调查建议

- 先用 list_dir 了解目录结构，再用 ripgrep 定位相关代码，最后用 read_file 精读。
- 避免重复执行相同的工具调用；若结果不变，换一个角度继续。";

/// Static synthesizer template.
pub const SYNTHESIZER_TEMPLATE: &str = "\
你是一名报告撰写助手。根据调查阶段收集的证据，撰写一份回答用户问题的 Markdown 分析报告。

要求:

1. 直接以 Markdown 标题开始（例如 \"## 分析结果\"），不要有任何前言。
2. 结论必须基于调查消息中的证据，并注明相关文件路径。
3. 如果证据中出现 [COMPRESSED:key] 占位符且需要其完整内容，调用 recall_detail(key=\"...\")。
4. 用小节和列表组织内容，保持结构清晰。";

/// Render the tool catalog appended to the investigator template.
pub fn tool_catalog(definitions: &[Value]) -> String {
    definitions
        .iter()
        .map(|def| {
            format!(
                "- {}: {}",
                def["name"].as_str().unwrap_or("?"),
                def["description"].as_str().unwrap_or("")
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// The full investigator system prompt for a run.
pub fn investigator_system_prompt(catalog: &str) -> String {
    format!("{}\n\n## 可用工具\n\n{}", INVESTIGATOR_TEMPLATE, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_catalog_rendering() {
        let defs = vec![
            json!({"name": "read_file", "description": "读取文件", "parameters": {}}),
            json!({"name": "think", "description": "自检", "parameters": {}}),
        ];
        let catalog = tool_catalog(&defs);
        assert_eq!(catalog, "- read_file: 读取文件\n- think: 自检");
    }

    #[test]
    fn test_system_prompt_stable_across_calls() {
        let catalog = "- read_file: 读取文件";
        assert_eq!(
            investigator_system_prompt(catalog),
            investigator_system_prompt(catalog)
        );
    }

    #[test]
    fn test_template_mentions_sentinel_and_self_check() {
        assert!(INVESTIGATOR_TEMPLATE.contains("[INVESTIGATION_COMPLETE]"));
        assert!(INVESTIGATOR_TEMPLATE.contains("think"));
        assert!(INVESTIGATOR_TEMPLATE.contains("recall_detail"));
    }
}
