//! Reference tool set: `read_file`, `write_file`, `glob`, `grep`, `bash`.
//!
//! These exist so the permission manager and path validator have something
//! real to gate, built on the same `Tool`/`ToolBuilder` machinery any caller
//! uses to register their own tools. They are reference implementations,
//! not a general-purpose toolbox.

use crate::permission::{PathValidator, ToolCategory};
use crate::tools::{tool, Tool};
use crate::{Error, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Timeout applied to the `bash` tool, matching the agent loop's per-tool
/// execution ceiling.
const BASH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed category mapping for the reference tool set.
pub fn category_for(tool_name: &str) -> ToolCategory {
    match tool_name {
        "read_file" | "glob" | "grep" => ToolCategory::Safe,
        "write_file" => ToolCategory::Ask,
        "bash" => ToolCategory::Dangerous,
        _ => ToolCategory::Ask,
    }
}

pub fn read_file_tool(validator: Arc<PathValidator>) -> Tool {
    tool("read_file", "Read the contents of a file as UTF-8 text")
        .param("path", "string")
        .build(move |args| {
            let validator = validator.clone();
            async move {
                let path = args["path"]
                    .as_str()
                    .ok_or_else(|| Error::invalid_input("read_file requires a string 'path'"))?;
                let resolved = validator.validate(path)?;
                let contents = tokio::fs::read_to_string(&resolved)
                    .await
                    .map_err(|e| Error::tool(format!("failed to read {}: {e}", resolved.display())))?;
                Ok(serde_json::json!({ "content": contents }))
            }
        })
}

pub fn write_file_tool(validator: Arc<PathValidator>) -> Tool {
    tool("write_file", "Write UTF-8 text to a file, creating or overwriting it")
        .param("path", "string")
        .param("content", "string")
        .build(move |args| {
            let validator = validator.clone();
            async move {
                let path = args["path"]
                    .as_str()
                    .ok_or_else(|| Error::invalid_input("write_file requires a string 'path'"))?;
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| Error::invalid_input("write_file requires a string 'content'"))?;
                let resolved = validator.validate(path)?;
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::tool(format!("failed to create {}: {e}", parent.display())))?;
                }
                tokio::fs::write(&resolved, content)
                    .await
                    .map_err(|e| Error::tool(format!("failed to write {}: {e}", resolved.display())))?;
                Ok(serde_json::json!({ "bytes_written": content.len() }))
            }
        })
}

pub fn glob_tool() -> Tool {
    tool("glob", "Find files matching a glob pattern, e.g. 'src/**/*.rs'")
        .param("pattern", "string")
        .build(|args| async move {
            let pattern = args["pattern"]
                .as_str()
                .ok_or_else(|| Error::invalid_input("glob requires a string 'pattern'"))?;
            let mut matches = Vec::new();
            for entry in glob::glob(pattern)
                .map_err(|e| Error::invalid_input(format!("invalid glob pattern: {e}")))?
            {
                match entry {
                    Ok(path) => matches.push(path.to_string_lossy().to_string()),
                    Err(_) => continue,
                }
            }
            Ok(serde_json::json!({ "matches": matches }))
        })
}

pub fn grep_tool() -> Tool {
    tool("grep", "Search files under a path for lines matching a regular expression")
        .param("pattern", "string")
        .param("path", "string")
        .build(|args| async move {
            let pattern = args["pattern"]
                .as_str()
                .ok_or_else(|| Error::invalid_input("grep requires a string 'pattern'"))?;
            let path = args["path"].as_str().unwrap_or(".");
            let regex = regex::Regex::new(pattern)
                .map_err(|e| Error::invalid_input(format!("invalid grep pattern: {e}")))?;

            let mut hits = Vec::new();
            for entry in walk_files(std::path::Path::new(path)) {
                let Ok(contents) = std::fs::read_to_string(&entry) else {
                    continue;
                };
                for (line_no, line) in contents.lines().enumerate() {
                    if regex.is_match(line) {
                        hits.push(serde_json::json!({
                            "file": entry.to_string_lossy(),
                            "line": line_no + 1,
                            "text": line,
                        }));
                    }
                }
            }
            Ok(serde_json::json!({ "matches": hits }))
        })
}

fn walk_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            if dir.is_file() {
                out.push(dir);
            }
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

pub fn bash_tool() -> Tool {
    tool("bash", "Run a shell command and capture its stdout/stderr")
        .param("command", "string")
        .build(|args| async move {
            let command = args["command"]
                .as_str()
                .ok_or_else(|| Error::invalid_input("bash requires a string 'command'"))?
                .to_string();

            let child = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| Error::tool(format!("failed to spawn shell: {e}")))?;

            let output = tokio::time::timeout(BASH_TIMEOUT, child.wait_with_output())
                .await
                .map_err(|_| Error::timeout())?
                .map_err(|e| Error::tool(format!("shell execution failed: {e}")))?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

            Ok(serde_json::json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": output.status.code(),
            }))
        })
}

/// Builds the full reference tool set, routing `read_file`/`write_file`
/// through `validator`.
pub fn reference_tools(validator: Arc<PathValidator>) -> Vec<Tool> {
    vec![
        read_file_tool(validator.clone()),
        write_file_tool(validator),
        glob_tool(),
        grep_tool(),
        bash_tool(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_file_roundtrip() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let validator = Arc::new(PathValidator::new(dir.path()).unwrap());
        let tool = read_file_tool(validator);
        let result = tool.execute(serde_json::json!({ "path": "a.txt" })).await.unwrap();
        assert_eq!(result["content"], "hello");
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let dir = tempdir().unwrap();
        let validator = Arc::new(PathValidator::new(dir.path()).unwrap());
        let write = write_file_tool(validator.clone());
        write
            .execute(serde_json::json!({ "path": "b.txt", "content": "world" }))
            .await
            .unwrap();

        let read = read_file_tool(validator);
        let result = read.execute(serde_json::json!({ "path": "b.txt" })).await.unwrap();
        assert_eq!(result["content"], "world");
    }

    #[tokio::test]
    async fn test_write_file_rejects_traversal() {
        let dir = tempdir().unwrap();
        let validator = Arc::new(PathValidator::new(dir.path()).unwrap());
        let write = write_file_tool(validator);
        let result = write
            .execute(serde_json::json!({ "path": "../escape.txt", "content": "x" }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_grep_finds_matching_line() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "fn main() {}\nlet x = 1;\n").unwrap();
        let tool = grep_tool();
        let result = tool
            .execute(serde_json::json!({ "pattern": "fn main", "path": dir.path().to_string_lossy() }))
            .await
            .unwrap();
        assert_eq!(result["matches"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bash_captures_stdout() {
        let tool = bash_tool();
        let result = tool.execute(serde_json::json!({ "command": "echo hi" })).await.unwrap();
        assert_eq!(result["stdout"], "hi\n");
        assert_eq!(result["exit_code"], 0);
    }

    #[test]
    fn test_category_for_matches_fixed_mapping() {
        assert_eq!(category_for("read_file"), ToolCategory::Safe);
        assert_eq!(category_for("glob"), ToolCategory::Safe);
        assert_eq!(category_for("grep"), ToolCategory::Safe);
        assert_eq!(category_for("write_file"), ToolCategory::Ask);
        assert_eq!(category_for("bash"), ToolCategory::Dangerous);
    }
}
