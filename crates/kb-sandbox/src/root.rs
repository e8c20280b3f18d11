use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::errors::{ToolError, ToolResult};

const MAX_SYMLINK_HOPS: usize = 40;

/// The single directory every sandbox tool is confined to.
///
/// Paths handed in by the remote agent are resolved component by component.
/// Every symlink on the way is expanded through `read_link`, dangling ones
/// included, so the boundary check sees the path the OS would open.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    root: PathBuf,
    lock_path: PathBuf,
}

impl SandboxRoot {
    /// Creates the directory if needed and canonicalizes it.
    pub fn open(root: impl AsRef<Path>) -> ToolResult<Self> {
        let raw = root.as_ref();
        fs::create_dir_all(raw).map_err(|err| ToolError::io("create sandbox root", raw, err))?;
        let root = raw
            .canonicalize()
            .map_err(|err| ToolError::io("canonicalize sandbox root", raw, err))?;
        let lock_path = lock_path_for(&root);
        Ok(Self { root, lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw_path: &str) -> ToolResult<PathBuf> {
        let raw_path = if raw_path.trim().is_empty() {
            "."
        } else {
            raw_path
        };

        if raw_path.contains('\0') {
            return Err(ToolError::InvalidArguments(
                "Null byte detected in path".into(),
            ));
        }

        let candidate = Path::new(raw_path);
        if candidate.is_absolute()
            || candidate.has_root()
            || candidate
                .components()
                .any(|component| matches!(component, Component::Prefix(_)))
        {
            return Err(ToolError::AbsolutePath(raw_path.to_string()));
        }

        // Components still to walk, last one at the bottom.
        let mut pending: Vec<PathBuf> = split_components(candidate);
        let mut resolved = self.root.clone();
        let mut hops = 0;
        while let Some(part) = pending.pop() {
            let Some(component) = part.components().next() else {
                continue;
            };
            match component {
                Component::Normal(name) => {
                    let next = resolved.join(name);
                    let is_link = fs::symlink_metadata(&next)
                        .map(|meta| meta.file_type().is_symlink())
                        .unwrap_or(false);
                    if !is_link {
                        resolved = next;
                        continue;
                    }

                    // Dangling links are followed too; the target decides.
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(ToolError::InvalidArguments(format!(
                            "too many levels of symbolic links in '{raw_path}'"
                        )));
                    }
                    let target = fs::read_link(&next)
                        .map_err(|err| ToolError::io("read symlink", next.clone(), err))?;
                    if target.is_absolute() {
                        resolved = PathBuf::new();
                    }
                    pending.extend(split_components(&target));
                }
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    resolved.push(component.as_os_str());
                }
            }
        }

        if !resolved.starts_with(&self.root) {
            return Err(ToolError::PathEscape(raw_path.to_string()));
        }

        Ok(resolved)
    }

    /// Path relative to the root for display; the root itself renders as `.`.
    pub fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Exclusive advisory lock shared by every process working on this root.
    /// Held for the duration of one mutating tool call.
    pub async fn lock(&self) -> ToolResult<SandboxLock> {
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || SandboxLock::acquire(lock_path))
            .await
            .map_err(|err| {
                ToolError::io(
                    "acquire sandbox lock",
                    PathBuf::new(),
                    std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
                )
            })?
    }
}

/// Components of `path` as single-component paths, reversed for use as a stack.
fn split_components(path: &Path) -> Vec<PathBuf> {
    path.components()
        .rev()
        .map(|component| PathBuf::from(component.as_os_str()))
        .collect()
}

fn lock_path_for(root: &Path) -> PathBuf {
    match (root.parent(), root.file_name()) {
        (Some(parent), Some(name)) => {
            parent.join(format!(".{}.lock", name.to_string_lossy()))
        }
        _ => root.join(".kb-sandbox.lock"),
    }
}

pub struct SandboxLock {
    file: File,
}

impl SandboxLock {
    fn acquire(path: PathBuf) -> ToolResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| ToolError::io("open sandbox lock", &path, err))?;
        file.lock_exclusive()
            .map_err(|err| ToolError::io("lock sandbox", &path, err))?;
        debug!(lock = %path.display(), "sandbox lock acquired");
        Ok(Self { file })
    }
}

impl Drop for SandboxLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
