//! Capability-gated filesystem and shell toolkit bound to one workspace root.
//!
//! Every operation resolves its path argument through [`ToolSandbox::confine`]
//! before touching the filesystem: the candidate is resolved against the
//! workspace root, normalized (`.`, `..`, duplicate separators, symlink
//! expansion of existing ancestors) and rejected unless the result still has
//! the canonicalized root as a prefix.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::exec::ShellOutput;
use crate::exec::run_shell;

/// Default byte cap for `read_file`.
const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;
/// Default hard timeout for `execute_shell`.
const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap for captured shell output, per stream.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const DEFAULT_SHELL_ALLOW_LIST: &[&str] = &[
    "cargo", "cat", "echo", "find", "git", "grep", "head", "ls", "make", "node", "npm", "pnpm",
    "pytest", "python", "python3", "rg", "sed", "sort", "tail", "wc", "yarn",
];

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_read_bytes: u64,
    pub shell_timeout: Duration,
    pub max_output_bytes: usize,
    pub max_patch_bytes: usize,
    pub shell_allow_list: Vec<String>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_patch_bytes: crate::config::DEFAULT_MAX_PATCH_BYTES,
            shell_allow_list: DEFAULT_SHELL_ALLOW_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadFileOutput {
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct WriteFileOutput {
    pub size: u64,
}

pub struct ToolSandbox {
    root: PathBuf,
    limits: SandboxLimits,
}

impl ToolSandbox {
    /// `root` must exist; it is canonicalized once so later prefix checks are
    /// not fooled by a symlinked workspace directory.
    pub fn new(root: &Path, limits: SandboxLimits) -> Result<Self> {
        let root = root.canonicalize()?;
        Ok(Self { root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Resolve `path` inside the workspace or fail. No filesystem access is
    /// performed on the target before the check passes; only existing
    /// ancestors are canonicalized (to expand symlinks that could otherwise
    /// smuggle the path outside the root).
    pub fn confine(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let normalized = normalize_lexically(&joined)
            .ok_or_else(|| GatewayErr::PathEscapesWorkspace(path.to_string()))?;

        let resolved = resolve_existing_ancestors(&normalized);
        if resolved.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(GatewayErr::PathEscapesWorkspace(path.to_string()))
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<ReadFileOutput> {
        let target = self.confine(path)?;
        let metadata = tokio::fs::metadata(&target).await?;
        if metadata.len() > self.limits.max_read_bytes {
            return Err(GatewayErr::Sandbox(format!(
                "file exceeds read cap of {} bytes: {path}",
                self.limits.max_read_bytes
            )));
        }
        let content = tokio::fs::read_to_string(&target).await?;
        Ok(ReadFileOutput {
            size: metadata.len(),
            content,
        })
    }

    /// Writes the entire new content; parent directories are created. There
    /// are no partial-write semantics at this layer.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<WriteFileOutput> {
        let target = self.confine(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!(path, bytes = content.len(), "sandbox write");
        Ok(WriteFileOutput {
            size: content.len() as u64,
        })
    }

    /// Non-recursive listings return immediate entries with directories
    /// suffixed `/`. Recursive listings walk depth-first and emit paths
    /// relative to `path`. Symlinks are listed but never followed.
    pub async fn list_directory(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let target = self.confine(path)?;
        let mut entries = Vec::new();
        if recursive {
            walk(&target, &target, &mut entries).await?;
        } else {
            let mut dir = tokio::fs::read_dir(&target).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    entries.push(format!("{name}/"));
                } else {
                    entries.push(name);
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub async fn delete_path(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.confine(path)?;
        let metadata = tokio::fs::symlink_metadata(&target).await?;
        if metadata.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_dir(&target).await?;
            }
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    pub async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let source = self.confine(from)?;
        let dest = self.confine(to)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &dest).await?;
        Ok(())
    }

    /// Runs `command` through the shell inside the workspace. Only commands
    /// whose first whitespace-delimited token is on the allow-list are
    /// executed. Output capture is capped per stream; the timeout and the
    /// cancellation token both kill the child.
    pub async fn execute_shell(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput> {
        let Some(first_token) = command.split_whitespace().next() else {
            return Err(GatewayErr::Sandbox("empty command".to_string()));
        };
        if !self
            .limits
            .shell_allow_list
            .iter()
            .any(|allowed| allowed == first_token)
        {
            return Err(GatewayErr::Sandbox(format!(
                "command not on the allow-list: {first_token}"
            )));
        }

        run_shell(
            command,
            &self.root,
            self.limits.shell_timeout,
            self.limits.max_output_bytes,
            cancel,
        )
        .await
    }

    /// Apply a unified-diff patch to the workspace. Patches above the byte
    /// cap are rejected outright; a patch that fails to apply leaves the
    /// working tree unchanged.
    pub async fn apply_patch(&self, patch: &str) -> Result<()> {
        if patch.len() > self.limits.max_patch_bytes {
            return Err(GatewayErr::Sandbox(format!(
                "patch exceeds cap of {} bytes",
                self.limits.max_patch_bytes
            )));
        }
        crate::workspace::git_apply(&self.root, patch)
            .await
            .map_err(|e| GatewayErr::Sandbox(e.to_string()))
    }
}

/// Lexical normalization: strips `.`, collapses `..` against prior
/// components, and refuses to walk above the path's root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root means the path escapes everything.
                if !normalized.pop() {
                    return None;
                }
                if normalized.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// remaining (not yet created) components.
fn resolve_existing_ancestors(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut suffix = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result = resolved;
                for part in suffix.iter().rev() {
                    result.push(part);
                }
                return result;
            }
            Err(_) => match existing.file_name() {
                Some(name) => {
                    suffix.push(name.to_os_string());
                    existing.pop();
                }
                None => return path.to_path_buf(),
            },
        }
    }
}

async fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                out.push(format!("{relative}/"));
                pending.push(path);
            } else {
                out.push(relative);
            }
        }
    }
    Ok(())
}
