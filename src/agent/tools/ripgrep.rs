//! Code search via the ripgrep binary.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::base::{Tool, ToolContext, ToolOutcome, ToolParam};
use super::filesystem::resolve_in_workdir;

const DEFAULT_MAX_MATCH_LINES: usize = 100;

/// Tool that searches file contents with `rg`.
pub struct RipgrepTool {
    max_match_lines: usize,
}

impl RipgrepTool {
    pub fn new(max_match_lines: usize) -> Self {
        Self { max_match_lines }
    }
}

impl Default for RipgrepTool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MATCH_LINES)
    }
}

#[async_trait]
impl Tool for RipgrepTool {
    fn name(&self) -> &str {
        "ripgrep"
    }

    fn description(&self) -> &str {
        "使用 ripgrep (rg) 按正则表达式搜索文件内容，返回 文件:行号:内容 格式的匹配行。"
    }

    fn parameters(&self) -> Vec<(String, ToolParam)> {
        vec![
            (
                "pattern".to_string(),
                ToolParam::required("string", "要搜索的正则表达式"),
            ),
            (
                "path".to_string(),
                ToolParam::optional("string", "搜索范围（文件或目录，默认工作目录）"),
            ),
            (
                "file_type".to_string(),
                ToolParam::optional("string", "文件类型过滤，例如 'rs'、'go'、'py'"),
            ),
            (
                "case_sensitive".to_string(),
                ToolParam::optional("boolean", "是否区分大小写（默认区分）"),
            ),
        ]
    }

    async fn execute(&self, args: HashMap<String, Value>, ctx: &ToolContext) -> ToolOutcome {
        let pattern = match args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) if !p.is_empty() => p,
            _ => return ToolOutcome::failure("缺少 pattern 参数"),
        };

        let raw_path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let search_path = match resolve_in_workdir(&ctx.working_dir, raw_path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::failure(e),
        };

        let mut cmd = Command::new("rg");
        cmd.arg("--line-number")
            .arg("--no-heading")
            .arg("--color")
            .arg("never")
            .arg("--max-columns")
            .arg("500");
        if let Some(ft) = args.get("file_type").and_then(|v| v.as_str()) {
            cmd.arg("--type").arg(ft);
        }
        if args
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .map(|b| !b)
            .unwrap_or(false)
        {
            cmd.arg("--ignore-case");
        }
        cmd.arg("--").arg(pattern).arg(&search_path);
        cmd.current_dir(&ctx.working_dir);
        cmd.kill_on_drop(true);

        let output = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return ToolOutcome::failure("搜索已取消");
            }
            out = cmd.output() => out,
        };

        let output = match output {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutcome::failure(
                    "未找到 ripgrep (rg) 可执行文件。请先安装: apt install ripgrep (Linux) \
                     或 brew install ripgrep (macOS)",
                );
            }
            Err(e) => return ToolOutcome::failure(format!("执行 rg 失败: {}", e)),
        };

        // rg exit codes: 0 = matches, 1 = no matches, 2 = error.
        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let work_prefix = format!("{}/", ctx.working_dir.display());
                let lines: Vec<&str> = stdout.lines().collect();
                let shown = lines.len().min(self.max_match_lines);
                let mut body = lines[..shown]
                    .iter()
                    .copied()
                    .map(|l| l.strip_prefix(work_prefix.as_str()).unwrap_or(l))
                    .collect::<Vec<&str>>()
                    .join("\n");
                if lines.len() > shown {
                    body.push_str(&format!(
                        "\n[已截断: 共 {} 行匹配，显示前 {} 行]",
                        lines.len(),
                        shown
                    ));
                }
                ToolOutcome::success(body)
            }
            Some(1) => ToolOutcome::success(format!("没有找到匹配 \"{}\" 的内容", pattern)),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ToolOutcome::failure(format!("rg 执行失败: {}", stderr.trim()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, ToolContext) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("lib.rs"),
            "pub fn alpha() {}\npub fn beta() {}\n",
        )
        .unwrap();
        let ctx = ToolContext::new(tmp.path());
        (tmp, ctx)
    }

    fn rg_available() -> bool {
        std::process::Command::new("rg")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_missing_pattern_fails() {
        let (_tmp, ctx) = workspace();
        let outcome = RipgrepTool::default().execute(HashMap::new(), &ctx).await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("pattern"));
    }

    #[tokio::test]
    async fn test_search_finds_matches() {
        if !rg_available() {
            return;
        }
        let (_tmp, ctx) = workspace();
        let mut args = HashMap::new();
        args.insert("pattern".to_string(), json!("pub fn"));
        let outcome = RipgrepTool::default().execute(args, &ctx).await;
        assert!(outcome.ok);
        assert!(outcome.output.contains("alpha"));
        assert!(outcome.output.contains("lib.rs"));
    }

    #[tokio::test]
    async fn test_search_no_matches_is_success() {
        if !rg_available() {
            return;
        }
        let (_tmp, ctx) = workspace();
        let mut args = HashMap::new();
        args.insert("pattern".to_string(), json!("nothing_matches_this"));
        let outcome = RipgrepTool::default().execute(args, &ctx).await;
        assert!(outcome.ok);
        assert!(outcome.output.contains("没有找到匹配"));
    }

    #[tokio::test]
    async fn test_truncation_caps_output() {
        if !rg_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let many: String = (0..50).map(|i| format!("match line {}\n", i)).collect();
        std::fs::write(tmp.path().join("big.txt"), many).unwrap();
        let ctx = ToolContext::new(tmp.path());

        let mut args = HashMap::new();
        args.insert("pattern".to_string(), json!("match line"));
        let outcome = RipgrepTool::new(10).execute(args, &ctx).await;
        assert!(outcome.ok);
        assert!(outcome.output.contains("[已截断"));
    }
}
