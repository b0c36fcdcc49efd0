//! Filesystem executor for authorized tool requests

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tracing::debug;

use super::{Operation, ToolExecutor, ToolRequest, json_schema, search, shell};
use crate::providers::ToolDefinition;

const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Runs file operations and shell commands relative to a base directory.
/// Containment is the permission engine's job; this type only executes.
#[derive(Debug, Clone)]
pub struct FileSystemExecutor {
    base_dir: PathBuf,
}

impl FileSystemExecutor {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn content<'a>(request: &'a ToolRequest, what: &str) -> Result<&'a str> {
        request
            .content
            .as_deref()
            .ok_or_else(|| anyhow!("Missing {} for {}", what, request.operation))
    }

    async fn read(&self, path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("File not found: {}", path.display()))?;
        if metadata.len() > MAX_READ_BYTES {
            bail!(
                "File too large ({} bytes, max {} bytes)",
                metadata.len(),
                MAX_READ_BYTES
            );
        }
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn list(&self, path: &Path) -> Result<String> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to read directory: {}", path.display()))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(format!("{name} ({} B)", metadata.len()));
            }
        }
        entries.sort();
        if entries.is_empty() {
            return Ok("Directory is empty.".to_string());
        }
        Ok(entries.join("\n"))
    }

    async fn write(&self, path: &Path, content: &str, create_new: bool) -> Result<String> {
        if create_new && tokio::fs::try_exists(path).await.unwrap_or(false) {
            bail!("File already exists: {}", path.display());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
    }

    async fn delete(&self, path: &Path) -> Result<String> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .with_context(|| format!("Not found: {}", path.display()))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir(path)
                .await
                .with_context(|| format!("Failed to remove directory {} (must be empty)", path.display()))?;
        } else {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(format!("Deleted {}", path.display()))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<String> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
        Ok(format!("Moved {} to {}", from.display(), to.display()))
    }

    #[cfg(unix)]
    async fn chmod(&self, path: &Path, mode: &str) -> Result<String> {
        use std::os::unix::fs::PermissionsExt;

        let bits = u32::from_str_radix(mode.trim().trim_start_matches("0o"), 8)
            .with_context(|| format!("Invalid octal mode '{mode}'"))?;
        if bits > 0o7777 {
            bail!("Invalid octal mode '{}'", mode);
        }
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(bits))
            .await
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
        Ok(format!("Set mode {:o} on {}", bits, path.display()))
    }

    #[cfg(not(unix))]
    async fn chmod(&self, _path: &Path, _mode: &str) -> Result<String> {
        bail!("chmod is only supported on Unix")
    }
}

#[async_trait]
impl ToolExecutor for FileSystemExecutor {
    async fn execute(&self, request: &ToolRequest) -> Result<String> {
        let path = self.resolve(&request.path);
        debug!("Executing {} on {}", request.operation, path.display());

        match &request.operation {
            Operation::Read => self.read(&path).await,
            Operation::List => self.list(&path).await,
            Operation::Search => {
                let query = Self::content(request, "query")?.to_string();
                tokio::task::spawn_blocking(move || search::search_dir(&path, &query))
                    .await
                    .context("search task panicked")?
            }
            Operation::Create => {
                let content = request.content.as_deref().unwrap_or_default();
                self.write(&path, content, true).await
            }
            Operation::Write => {
                let content = Self::content(request, "content")?;
                self.write(&path, content, false).await
            }
            Operation::Delete => self.delete(&path).await,
            Operation::Move => {
                let dest = self.resolve(Path::new(Self::content(request, "destination")?));
                self.rename(&path, &dest).await
            }
            Operation::Chmod => self.chmod(&path, Self::content(request, "mode")?).await,
            Operation::Execute => shell::run_command(Self::content(request, "command")?, &path).await,
            Operation::Other(name) => Err(anyhow!("Unknown tool: {}", name)),
        }
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let path = serde_json::json!({"type": "string", "description": "Path relative to the project root"});
        let def = |name: &str, description: &str, schema| ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: schema,
        };
        vec![
            def(
                "read_file",
                "Read a text file",
                json_schema(serde_json::json!({"path": path}), vec!["path"]),
            ),
            def(
                "list_files",
                "List a directory",
                json_schema(serde_json::json!({"path": path}), vec![]),
            ),
            def(
                "search",
                "Search files under a directory for a keyword (case-insensitive)",
                json_schema(
                    serde_json::json!({"query": {"type": "string"}, "path": path}),
                    vec!["query"],
                ),
            ),
            def(
                "create_file",
                "Create a new file",
                json_schema(
                    serde_json::json!({"path": path, "content": {"type": "string"}}),
                    vec!["path", "content"],
                ),
            ),
            def(
                "write_file",
                "Overwrite an existing file",
                json_schema(
                    serde_json::json!({"path": path, "content": {"type": "string"}}),
                    vec!["path", "content"],
                ),
            ),
            def(
                "delete_file",
                "Delete a file or empty directory",
                json_schema(serde_json::json!({"path": path}), vec!["path"]),
            ),
            def(
                "move_file",
                "Move or rename a file",
                json_schema(
                    serde_json::json!({"path": path, "destination": {"type": "string"}}),
                    vec!["path", "destination"],
                ),
            ),
            def(
                "chmod",
                "Change file permissions",
                json_schema(
                    serde_json::json!({"path": path, "mode": {"type": "string", "description": "Octal mode, e.g. 644"}}),
                    vec!["path", "mode"],
                ),
            ),
            def(
                "shell",
                "Execute a shell command",
                json_schema(
                    serde_json::json!({"command": {"type": "string"}, "working_dir": path}),
                    vec!["command"],
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor() -> (TempDir, FileSystemExecutor) {
        let temp = TempDir::new().unwrap();
        let exec = FileSystemExecutor::new(temp.path());
        (temp, exec)
    }

    #[tokio::test]
    async fn test_create_read_write() {
        let (temp, exec) = executor();
        let create = ToolRequest::new(Operation::Create, "notes/a.txt").with_content("one");
        exec.execute(&create).await.unwrap();
        assert!(exec.execute(&create).await.is_err());

        let read = ToolRequest::new(Operation::Read, "notes/a.txt");
        assert_eq!(exec.execute(&read).await.unwrap(), "one");

        let write = ToolRequest::new(Operation::Write, "notes/a.txt").with_content("two");
        exec.execute(&write).await.unwrap();
        assert_eq!(std::fs::read_to_string(temp.path().join("notes/a.txt")).unwrap(), "two");
    }

    #[tokio::test]
    async fn test_list() {
        let (temp, exec) = executor();
        std::fs::write(temp.path().join("b.rs"), "x").unwrap();
        std::fs::create_dir(temp.path().join("a")).unwrap();
        let out = exec.execute(&ToolRequest::new(Operation::List, ".")).await.unwrap();
        assert_eq!(out, "a/\nb.rs (1 B)");
    }

    #[tokio::test]
    async fn test_search() {
        let (temp, exec) = executor();
        std::fs::write(temp.path().join("main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        let req = ToolRequest::new(Operation::Search, ".").with_content("RUN");
        assert_eq!(exec.execute(&req).await.unwrap(), "main.rs:2: run();");
        assert!(exec.execute(&ToolRequest::new(Operation::Search, ".")).await.is_err());
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let (temp, exec) = executor();
        std::fs::write(temp.path().join("old.txt"), "x").unwrap();
        let mv = ToolRequest::new(Operation::Move, "old.txt").with_content("sub/new.txt");
        exec.execute(&mv).await.unwrap();
        assert!(!temp.path().join("old.txt").exists());
        assert!(temp.path().join("sub/new.txt").exists());

        let rm = ToolRequest::new(Operation::Delete, "sub/new.txt");
        exec.execute(&rm).await.unwrap();
        assert!(!temp.path().join("sub/new.txt").exists());
        assert!(exec.execute(&rm).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_chmod() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, exec) = executor();
        std::fs::write(temp.path().join("run.sh"), "#!/bin/sh").unwrap();
        let req = ToolRequest::new(Operation::Chmod, "run.sh").with_content("755");
        exec.execute(&req).await.unwrap();
        let mode = std::fs::metadata(temp.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let bad = ToolRequest::new(Operation::Chmod, "run.sh").with_content("rwx");
        assert!(exec.execute(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_runs_in_path() {
        let (temp, exec) = executor();
        std::fs::write(temp.path().join("here.txt"), "x").unwrap();
        let req = ToolRequest::new(Operation::Execute, ".").with_content("ls");
        let out = exec.execute(&req).await.unwrap();
        assert!(out.contains("here.txt"));
    }

    #[tokio::test]
    async fn test_missing_content_and_unknown_tool() {
        let (_temp, exec) = executor();
        let write = ToolRequest::new(Operation::Write, "a.txt");
        assert!(exec.execute(&write).await.is_err());
        let other = ToolRequest::new(Operation::Other("fetch".into()), ".");
        let err = exec.execute(&other).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[test]
    fn test_list_tools() {
        let (_temp, exec) = executor();
        let names: Vec<String> = exec.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 9);
        for name in &names {
            assert_ne!(Operation::from_tool_name(name), Operation::Other(name.clone()));
        }
    }
}
