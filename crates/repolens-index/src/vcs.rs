//! Version-control access: tracked files, pending changes, commit ids and file contents.

use std::path::{Path, PathBuf};

use repolens_store::BoxFuture;
use tokio::process::Command;

use crate::error::{IndexError, Result};

/// Read-only view of a repository's files and history.
///
/// All paths are relative to [`VersionControl::root`] and use `/` separators.
pub trait VersionControl: Send + Sync {
    fn root(&self) -> &Path;

    /// Files currently tracked by the repository.
    fn list_tracked_files(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Files with staged or unstaged changes relative to the last commit.
    /// Renamed files are reported under both their old and new paths.
    fn list_modified_files(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Identifier of the current commit, `None` for a repository with no commits.
    fn latest_commit_hash(&self) -> BoxFuture<'_, Result<Option<String>>>;

    /// Contents of `path` at `commit`, or in the working tree when `commit` is `None`.
    /// Returns `Ok(None)` when the file does not exist there.
    fn read_file_at(
        &self,
        path: &str,
        commit: Option<&str>,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;
}

async fn read_working_file(root: &Path, path: &str) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(root.join(path)).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        // A directory or similar at the path: treat as absent.
        Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// [`VersionControl`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    /// Open the repository containing `path`.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::NotFound` if `path` is not inside a git working tree,
    /// or `IndexError::Vcs` if `git` cannot be executed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .map_err(|e| IndexError::Vcs(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            return Err(IndexError::NotFound(format!(
                "{} is not a git repository",
                path.display()
            )));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        tracing::debug!(root = %root, "opened git repository");
        Ok(Self {
            root: PathBuf::from(root),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .await
            .map_err(|e| IndexError::Vcs(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            return Err(IndexError::Vcs(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
}

/// Paths from `git status --porcelain -z` output.
fn parse_porcelain(bytes: &[u8]) -> Vec<String> {
    let mut paths = Vec::new();
    let mut entries = split_nul(bytes);
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        let status = status.trim_end();
        if status == "??" || status == "!!" {
            continue;
        }
        paths.push(path.to_owned());
        // Renames and copies carry the source path as the next entry.
        if status.contains('R') || status.contains('C') {
            let source = entries.next();
            if status.contains('R') {
                paths.extend(source);
            }
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

impl VersionControl for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_tracked_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let out = self.git(&["ls-files", "-z"]).await?;
            Ok(split_nul(&out).collect())
        })
    }

    fn list_modified_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let out = self
                .git(&["status", "--porcelain", "-z", "--untracked-files=no"])
                .await?;
            Ok(parse_porcelain(&out))
        })
    }

    fn latest_commit_hash(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            match self.git(&["rev-parse", "--verify", "-q", "HEAD"]).await {
                Ok(out) => {
                    let hash = String::from_utf8_lossy(&out).trim().to_owned();
                    Ok((!hash.is_empty()).then_some(hash))
                }
                Err(IndexError::Vcs(msg)) => {
                    tracing::debug!(error = %msg, "no commits yet");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn read_file_at(
        &self,
        path: &str,
        commit: Option<&str>,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let path = path.to_owned();
        let commit = commit.map(str::to_owned);
        Box::pin(async move {
            match commit {
                None => read_working_file(&self.root, &path).await,
                Some(commit) => {
                    let spec = format!("{commit}:{path}");
                    match self.git(&["show", spec.as_str()]).await {
                        Ok(bytes) => Ok(Some(bytes)),
                        Err(IndexError::Vcs(msg)) => {
                            tracing::debug!(path = %path, commit = %commit, error = %msg, "file not in commit");
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        })
    }
}

/// [`VersionControl`] for a plain directory: every non-ignored file is tracked,
/// nothing is ever modified and there are no commits.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn walk_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?;
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            Some(parts.join("/"))
        })
        .collect();
    files.sort();
    files
}

impl VersionControl for WorkingTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_tracked_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let root = self.root.clone();
        Box::pin(async move { Ok(tokio::task::spawn_blocking(move || walk_files(&root)).await?) })
    }

    fn list_modified_files(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn latest_commit_hash(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async { Ok(None) })
    }

    fn read_file_at(
        &self,
        path: &str,
        commit: Option<&str>,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let path = path.to_owned();
        let has_commit = commit.is_some();
        Box::pin(async move {
            if has_commit {
                return Ok(None);
            }
            read_working_file(&self.root, &path).await
        })
    }
}

/// Open `path` as a git repository, falling back to a plain directory walk.
///
/// # Errors
///
/// Returns `IndexError::NotFound` if `path` is not an existing directory.
pub async fn open_repository(path: impl AsRef<Path>) -> Result<Box<dyn VersionControl>> {
    let path = path.as_ref();
    if !tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return Err(IndexError::NotFound(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    match GitCli::open(path).await {
        Ok(git) => Ok(Box::new(git)),
        Err(e) => {
            tracing::info!(path = %path.display(), reason = %e, "not a git repository, indexing working tree");
            Ok(Box::new(WorkingTree::new(path)))
        }
    }
}
