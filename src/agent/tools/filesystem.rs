//! File system tools: read and list, confined to the working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::base::{Tool, ToolContext, ToolOutcome, ToolParam};

/// Resolve a tool path argument against the working directory and reject
/// paths that escape it.
pub(crate) fn resolve_in_workdir(working_dir: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        working_dir.join(raw)
    };

    if !candidate.exists() {
        return Err(format!(
            "未找到路径: {}。请先用 list_dir 查看目录内容确认路径。",
            raw
        ));
    }

    let canonical = candidate
        .canonicalize()
        .map_err(|e| format!("无法解析路径 {}: {}", raw, e))?;
    let work_canonical = working_dir
        .canonicalize()
        .map_err(|e| format!("无法解析工作目录: {}", e))?;

    if !canonical.starts_with(&work_canonical) {
        return Err(format!("路径越界: {} 不在工作目录内", raw));
    }

    Ok(canonical)
}

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

/// Tool to read file contents, optionally a 1-indexed line range.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "读取文件内容。可选 lines 参数按 1 起始的行号范围读取，例如 \"10:50\"。"
    }

    fn parameters(&self) -> Vec<(String, ToolParam)> {
        vec![
            (
                "path".to_string(),
                ToolParam::required("string", "要读取的文件路径（相对工作目录）"),
            ),
            (
                "lines".to_string(),
                ToolParam::optional(
                    "string",
                    "可选的行号范围，格式 \"start:end\"（1 起始，含端点），省略则读取整个文件",
                ),
            ),
        ]
    }

    async fn execute(&self, args: HashMap<String, Value>, ctx: &ToolContext) -> ToolOutcome {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutcome::failure("缺少 path 参数"),
        };

        let file_path = match resolve_in_workdir(&ctx.working_dir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::failure(e),
        };
        if !file_path.is_file() {
            return ToolOutcome::failure(format!(
                "不是文件: {}。该路径是目录，请改用 list_dir。",
                path
            ));
        }

        // Read raw bytes first for binary detection.
        let bytes = match tokio::fs::read(&file_path).await {
            Ok(b) => b,
            Err(e) => {
                return if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ToolOutcome::failure(format!("权限不足，无法读取: {}", path))
                } else {
                    ToolOutcome::failure(format!("读取文件失败: {}", e))
                }
            }
        };

        // Binary detection: null bytes in the first 512 bytes.
        let check_len = bytes.len().min(512);
        if bytes[..check_len].contains(&0u8) {
            return ToolOutcome::success(format!("[二进制文件: {}, {} 字节]", path, bytes.len()));
        }

        let content = String::from_utf8_lossy(&bytes).to_string();
        let total_lines = content.lines().count();

        let (body, start, end) = match args.get("lines").and_then(|v| v.as_str()) {
            Some(range) => match extract_line_range(&content, range) {
                Ok(v) => v,
                Err(e) => return ToolOutcome::failure(e),
            },
            None => (content.clone(), 1, total_lines.max(1)),
        };

        ToolOutcome::success(format!("File: {}\nLines: {}-{}\n\n{}", path, start, end, body))
    }
}

/// Extract a line range from content.
///
/// `range` format: "start:end" (1-indexed, inclusive) or "start:" (to end).
fn extract_line_range(content: &str, range: &str) -> Result<(String, usize, usize), String> {
    let parts: Vec<&str> = range.splitn(2, ':').collect();
    if parts.len() != 2 {
        return Err(format!(
            "无效的 lines 格式 '{}'，应为 \"start:end\"（例如 \"10:50\"）",
            range
        ));
    }

    let start: usize = match parts[0].trim().parse() {
        Ok(n) if n >= 1 => n,
        _ => return Err(format!("无效的起始行号 '{}'，必须是正整数", parts[0])),
    };

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();

    let end: usize = if parts[1].trim().is_empty() {
        total
    } else {
        match parts[1].trim().parse::<usize>() {
            Ok(n) => n.min(total),
            _ => return Err(format!("无效的结束行号 '{}'，必须是正整数", parts[1])),
        }
    };

    if start > total {
        return Err(format!("起始行号 {} 超出文件长度（共 {} 行）", start, total));
    }
    if start > end {
        return Err(format!("起始行号 {} 在结束行号 {} 之后", start, end));
    }

    Ok((lines[start - 1..end].join("\n"), start, end))
}

// ---------------------------------------------------------------------------
// ListDirTool
// ---------------------------------------------------------------------------

/// Tool to list directory contents.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "列出目录内容，目录标注 [dir]，文件标注 [file]。"
    }

    fn parameters(&self) -> Vec<(String, ToolParam)> {
        vec![(
            "path".to_string(),
            ToolParam::required("string", "要列出的目录路径（相对工作目录，\".\" 为根目录）"),
        )]
    }

    async fn execute(&self, args: HashMap<String, Value>, ctx: &ToolContext) -> ToolOutcome {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutcome::failure("缺少 path 参数"),
        };

        let dir_path = match resolve_in_workdir(&ctx.working_dir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::failure(e),
        };
        if !dir_path.is_dir() {
            return ToolOutcome::failure(format!(
                "不是目录: {}。该路径是文件，请改用 read_file。",
                path
            ));
        }

        let mut entries = match tokio::fs::read_dir(&dir_path).await {
            Ok(e) => e,
            Err(e) => {
                return if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ToolOutcome::failure(format!("权限不足，无法列出: {}", path))
                } else {
                    ToolOutcome::failure(format!("读取目录失败: {}", e))
                }
            }
        };

        let mut items: Vec<(bool, String)> = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|ft| ft.is_dir())
                        .unwrap_or(false);
                    items.push((is_dir, name));
                }
                Ok(None) => break,
                Err(e) => return ToolOutcome::failure(format!("读取目录失败: {}", e)),
            }
        }

        if items.is_empty() {
            return ToolOutcome::success(format!("目录 {} 为空", path));
        }

        items.sort_by(|a, b| a.1.cmp(&b.1));

        let lines: Vec<String> = items
            .into_iter()
            .map(|(is_dir, name)| {
                if is_dir {
                    format!("[dir]  {}", name)
                } else {
                    format!("[file] {}", name)
                }
            })
            .collect();

        ToolOutcome::success(lines.join("\n"))
    }
}
