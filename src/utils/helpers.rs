//! Utility functions for codescout.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref().to_path_buf();
    if !path.exists() {
        let _ = fs::create_dir_all(&path);
    }
    path
}

/// Get the codescout data directory (~/.codescout).
pub fn get_data_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(home.join(".codescout"))
}

/// Get current timestamp in ISO format.
pub fn timestamp() -> String {
    Local::now().to_rfc3339()
}

/// A short opaque hex identifier of `len` characters.
pub fn short_id(len: usize) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..len.min(id.len())].to_string()
}

/// Truncate a string to max length, adding a suffix if truncated.
///
/// UTF-8 safe: cuts at a character boundary.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    let suffix = "...";
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= suffix.len() {
        return s.chars().take(max_len).collect();
    }
    let mut result: String = s.chars().take(max_len - suffix.len()).collect();
    result.push_str(suffix);
    result
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(rest)
    } else if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate_string("hello world", 8), "hello...");
    }

    #[test]
    fn test_truncate_multibyte_safe() {
        let s = "调查代码库并回答问题";
        let t = truncate_string(s, 6);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), 6);
    }

    #[test]
    fn test_short_id_length_and_charset() {
        let id = short_id(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_id_unique() {
        assert_ne!(short_id(8), short_id(8));
    }

    #[test]
    fn test_expand_tilde() {
        let p = expand_tilde("~/foo/bar");
        assert!(p.ends_with("foo/bar"));
        assert!(!p.to_string_lossy().contains('~'));
    }
}
