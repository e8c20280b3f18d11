use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use kb_mcp_core::{text_result, McpResult, McpTool};
use serde_json::{json, Value};

use crate::errors::{required_str, ToolError, ToolResult};
use crate::root::SandboxRoot;

pub struct ListFilesTool {
    root: Arc<SandboxRoot>,
}

impl ListFilesTool {
    pub fn new(root: Arc<SandboxRoot>) -> Self {
        Self { root }
    }

    pub fn list(&self, path: &str) -> ToolResult<String> {
        let target = self.root.resolve(path)?;
        if !target.exists() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        if target.is_file() {
            return Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default());
        }

        let mut entries = fs::read_dir(&target)
            .map_err(|err| ToolError::io("read directory", &target, err))?
            .map(|entry| {
                let entry = entry.map_err(|err| ToolError::io("read directory", &target, err))?;
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.path().is_dir() {
                    name.push('/');
                }
                Ok(name)
            })
            .collect::<ToolResult<Vec<_>>>()?;
        entries.sort();
        Ok(entries.join("\n"))
    }
}

#[async_trait]
impl McpTool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in the sandbox directory. Directories end with '/'."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let path = params.get("path").and_then(Value::as_str).unwrap_or(".");
        Ok(text_result(self.list(path)?))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the sandbox root",
                    "default": "."
                }
            },
            "additionalProperties": false
        })
    }
}

pub struct ReadFileTool {
    root: Arc<SandboxRoot>,
}

impl ReadFileTool {
    pub fn new(root: Arc<SandboxRoot>) -> Self {
        Self { root }
    }

    pub fn read(&self, path: &str) -> ToolResult<String> {
        let target = self.root.resolve(path)?;
        if !target.is_file() {
            return Err(ToolError::NotAFile(path.to_string()));
        }
        fs::read_to_string(&target).map_err(|err| ToolError::io("read file", &target, err))
    }
}

#[async_trait]
impl McpTool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the sandbox directory."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let path = required_str(&params, "path")?;
        Ok(text_result(self.read(path)?))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }
}

pub struct WriteFileTool {
    root: Arc<SandboxRoot>,
}

impl WriteFileTool {
    pub fn new(root: Arc<SandboxRoot>) -> Self {
        Self { root }
    }

    pub async fn write(&self, path: &str, content: &str, append: bool) -> ToolResult<String> {
        let target = self.root.resolve(path)?;
        let _guard = self.root.lock().await?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ToolError::io("create parent directories", parent, err))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)
            .map_err(|err| ToolError::io("open file", &target, err))?;
        file.write_all(content.as_bytes())
            .map_err(|err| ToolError::io("write file", &target, err))?;

        Ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            self.root.relative(&target)
        ))
    }
}

#[async_trait]
impl McpTool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file into the sandbox directory, creating parent directories."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let path = required_str(&params, "path")?;
        let content = required_str(&params, "content")?;
        let append = params
            .get("append")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(text_result(self.write(path, content, append).await?))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "append": {"type": "boolean", "default": false}
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }
}

pub struct MakeDirTool {
    root: Arc<SandboxRoot>,
}

impl MakeDirTool {
    pub fn new(root: Arc<SandboxRoot>) -> Self {
        Self { root }
    }

    pub async fn make(&self, path: &str) -> ToolResult<String> {
        let target = self.root.resolve(path)?;
        let _guard = self.root.lock().await?;
        fs::create_dir_all(&target).map_err(|err| ToolError::io("create directory", &target, err))?;
        Ok(format!("Created {}", self.root.relative(&target)))
    }
}

#[async_trait]
impl McpTool for MakeDirTool {
    fn name(&self) -> &str {
        "make_dir"
    }

    fn description(&self) -> &str {
        "Create a directory (and its parents) inside the sandbox."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let path = required_str(&params, "path")?;
        Ok(text_result(self.make(path).await?))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn sandbox() -> (TempDir, Arc<SandboxRoot>) {
        let dir = tempdir().unwrap();
        let root = Arc::new(SandboxRoot::open(dir.path().join("sandbox")).unwrap());
        (dir, root)
    }

    #[tokio::test]
    async fn write_creates_intermediate_directories() {
        let (_dir, root) = sandbox();
        let writer = WriteFileTool::new(Arc::clone(&root));

        let message = writer.write("a/b/c.txt", "x", false).await.unwrap();
        assert_eq!(message, "Wrote 1 bytes to a/b/c.txt");
        assert_eq!(
            fs::read_to_string(root.path().join("a/b/c.txt")).unwrap(),
            "x"
        );
    }

    #[tokio::test]
    async fn write_outside_root_is_a_path_escape() {
        let (dir, root) = sandbox();
        let writer = WriteFileTool::new(root);

        let err = writer.write("../escape.txt", "x", false).await.unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_through_dangling_symlink_is_a_path_escape() {
        let (dir, root) = sandbox();
        let outside = dir.path().join("outside.txt");
        std::os::unix::fs::symlink(&outside, root.path().join("link")).unwrap();
        let writer = WriteFileTool::new(root);

        let err = writer.write("link", "pwned", false).await.unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(!outside.exists());
    }

    #[tokio::test]
    async fn append_keeps_existing_content() {
        let (_dir, root) = sandbox();
        let writer = WriteFileTool::new(Arc::clone(&root));
        writer.write("log.txt", "one\n", false).await.unwrap();
        writer.write("log.txt", "two\n", true).await.unwrap();

        let reader = ReadFileTool::new(root);
        assert_eq!(reader.read("log.txt").unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn list_marks_directories_and_sorts() {
        let (_dir, root) = sandbox();
        MakeDirTool::new(Arc::clone(&root)).make("src").await.unwrap();
        fs::write(root.path().join("b.txt"), "").unwrap();
        fs::write(root.path().join("a.txt"), "").unwrap();

        let lister = ListFilesTool::new(Arc::clone(&root));
        assert_eq!(lister.list(".").unwrap(), "a.txt\nb.txt\nsrc/");
        assert_eq!(lister.list("a.txt").unwrap(), "a.txt");
        assert!(matches!(lister.list("missing"), Err(ToolError::NotFound(_))));
    }

    #[test]
    fn reading_a_directory_fails() {
        let (_dir, root) = sandbox();
        fs::create_dir_all(root.path().join("docs")).unwrap();
        let reader = ReadFileTool::new(root);
        assert!(matches!(reader.read("docs"), Err(ToolError::NotAFile(_))));
    }

    #[tokio::test]
    async fn make_dir_reports_relative_path() {
        let (_dir, root) = sandbox();
        let maker = MakeDirTool::new(Arc::clone(&root));
        assert_eq!(maker.make("x/y").await.unwrap(), "Created x/y");
        assert!(root.path().join("x/y").is_dir());
    }
}
