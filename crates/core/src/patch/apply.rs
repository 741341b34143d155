//! Patch execution against a project tree.

use super::{FileOperation, Hunk, Patch, PatchError, PatchLine};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Primitive text-file access used by the engine.
///
/// The proxy implements this over forwarded read/write tool calls, so patch
/// application is observable upstream like any other edit; [`LocalFileStore`]
/// goes straight to the filesystem. Paths are project-relative.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_text(&self, path: &str) -> anyhow::Result<String>;
    async fn write_text(&self, path: &str, text: &str) -> anyhow::Result<()>;
}

/// Direct filesystem implementation of [`FileStore`].
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read_text(&self, path: &str) -> anyhow::Result<String> {
        Ok(tokio::fs::read_to_string(self.root.join(path)).await?)
    }

    async fn write_text(&self, path: &str, text: &str) -> anyhow::Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, text).await?;
        Ok(())
    }
}

/// Applies parsed patches in document order.
///
/// Renames and deletes go through git so history attribution survives; when
/// git refuses (untracked file, no repository) the engine falls back to plain
/// filesystem operations. There is no cross-operation rollback: operations
/// before a failure stay applied.
pub struct PatchEngine<'a> {
    project_root: PathBuf,
    store: &'a dyn FileStore,
}

impl<'a> PatchEngine<'a> {
    pub fn new(project_root: impl Into<PathBuf>, store: &'a dyn FileStore) -> Self {
        Self {
            project_root: project_root.into(),
            store,
        }
    }

    /// Execute every operation, returning one summary line per operation.
    pub async fn apply(&self, patch: &Patch) -> Result<Vec<String>, PatchError> {
        let mut summary = Vec::with_capacity(patch.operations.len());
        for op in &patch.operations {
            summary.push(self.apply_operation(op).await?);
        }
        Ok(summary)
    }

    async fn apply_operation(&self, op: &FileOperation) -> Result<String, PatchError> {
        match op {
            FileOperation::Add { path, lines } => {
                let mut text = lines.join("\n");
                if !text.is_empty() {
                    text.push('\n');
                }
                self.write(path, &text).await?;
                Ok(format!("A {}", path))
            }
            FileOperation::Delete { path } => {
                self.remove(path).await?;
                Ok(format!("D {}", path))
            }
            FileOperation::Update {
                path,
                move_to,
                hunks,
            } => {
                // Rename before editing so hunks apply at the destination.
                let target = match move_to {
                    Some(dest) => {
                        self.rename(path, dest).await?;
                        dest
                    }
                    None => path,
                };
                let text = self
                    .store
                    .read_text(target)
                    .await
                    .map_err(|e| PatchError::Read {
                        path: target.clone(),
                        message: format!("{:#}", e),
                    })?;
                let patched = apply_hunks(&text, hunks).map_err(|line| PatchError::HunkMismatch {
                    path: target.clone(),
                    line,
                })?;
                self.write(target, &patched).await?;
                match move_to {
                    Some(dest) => Ok(format!("U {} -> {}", path, dest)),
                    None => Ok(format!("U {}", path)),
                }
            }
        }
    }

    async fn write(&self, path: &str, text: &str) -> Result<(), PatchError> {
        self.store
            .write_text(path, text)
            .await
            .map_err(|e| PatchError::Write {
                path: path.to_string(),
                message: format!("{:#}", e),
            })
    }

    async fn remove(&self, path: &str) -> Result<(), PatchError> {
        if self.git(&["rm", "-q", "--", path]).await {
            return Ok(());
        }
        debug!(path, "git rm refused, falling back to filesystem remove");
        tokio::fs::remove_file(self.project_root.join(path))
            .await
            .map_err(|e| PatchError::FileSystem {
                op: "removing",
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), PatchError> {
        // git mv needs the destination directory to exist.
        if let Some(parent) = Path::new(to).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(self.project_root.join(parent))
                    .await
                    .map_err(|e| PatchError::FileSystem {
                        op: "preparing directory for",
                        path: to.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }
        if self.git(&["mv", from, to]).await {
            return Ok(());
        }
        debug!(from, to, "git mv refused, falling back to filesystem rename");
        tokio::fs::rename(self.project_root.join(from), self.project_root.join(to))
            .await
            .map_err(|e| PatchError::FileSystem {
                op: "renaming",
                path: from.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a git subcommand against the project root; false on any failure.
    async fn git(&self, args: &[&str]) -> bool {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.project_root)
            .args(args)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                debug!(
                    args = ?args,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "git command failed"
                );
                false
            }
            Err(e) => {
                warn!(%e, "git not runnable");
                false
            }
        }
    }
}

/// Apply hunks to file text with a strict forward-scanning matcher.
///
/// The write cursor starts at line 0. Each hunk's context/remove lines must
/// match verbatim at some position at or after the cursor; the first match
/// is replaced by the hunk's context/add lines and the cursor advances past
/// the replacement. On mismatch the offending line is returned and nothing
/// is persisted by the caller.
fn apply_hunks(text: &str, hunks: &[Hunk]) -> Result<String, String> {
    let had_trailing_newline = text.ends_with('\n');
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    let mut cursor = 0usize;

    for hunk in hunks {
        let pattern: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                PatchLine::Context(s) | PatchLine::Remove(s) => Some(s.as_str()),
                PatchLine::Add(_) => None,
            })
            .collect();
        let replacement: Vec<String> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                PatchLine::Context(s) | PatchLine::Add(s) => Some(s.clone()),
                PatchLine::Remove(_) => None,
            })
            .collect();

        let at = if pattern.is_empty() {
            // Pure insertion: splice at the cursor.
            cursor
        } else {
            find_verbatim(&lines, cursor, &pattern)
                .ok_or_else(|| pattern.first().map(|s| s.to_string()).unwrap_or_default())?
        };

        lines.splice(at..at + pattern.len(), replacement.iter().cloned());
        cursor = at + replacement.len();
    }

    let mut out = lines.join("\n");
    if !out.is_empty() && (had_trailing_newline || text.is_empty()) {
        out.push('\n');
    }
    Ok(out)
}

fn find_verbatim(lines: &[String], from: usize, pattern: &[&str]) -> Option<usize> {
    if pattern.len() > lines.len() {
        return None;
    }
    (from..=lines.len() - pattern.len())
        .find(|&i| lines[i..i + pattern.len()].iter().zip(pattern).all(|(a, b)| a == b))
}
