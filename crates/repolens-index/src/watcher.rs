use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use repolens_llm::EmbeddingProvider;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::indexer::RepositoryIndexer;
use crate::languages::should_index;

/// Re-indexes files of one repository as they change on disk.
///
/// Dropping the watcher stops the debouncer and the indexing task.
pub struct IndexWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Repository-relative, `/`-joined form of `path`, if it lies under one of `roots`.
fn relative_path(roots: &[PathBuf], path: &Path) -> Option<String> {
    let rel = roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

impl IndexWatcher {
    /// Watch `root` recursively and call `index_single_file` for every
    /// indexable path that settles for `debounce`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start<E: EmbeddingProvider + 'static>(
        root: &Path,
        repo_id: &str,
        indexer: Arc<RepositoryIndexer<E>>,
        debounce: Duration,
    ) -> Result<Self> {
        let mut roots = vec![root.to_path_buf()];
        if let Ok(canonical) = root.canonicalize()
            && canonical != root
        {
            roots.push(canonical);
        }

        let (notify_tx, mut notify_rx) = mpsc::channel::<String>(64);
        let filter_roots = roots.clone();

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<Vec<DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let paths: HashSet<String> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .filter_map(|e| relative_path(&filter_roots, &e.path))
                    .filter(|rel| should_index(Path::new(rel)))
                    .collect();

                for path in paths {
                    if notify_tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        let repo_id = repo_id.to_owned();
        tracing::info!(root = %root.display(), repo_id = %repo_id, "watching for changes");
        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(path) = notify_rx.recv().await {
                match indexer.index_single_file(&repo_id, &path, true).await {
                    Ok(chunks) => tracing::debug!(path = %path, chunks, "re-indexed changed file"),
                    Err(e) => tracing::warn!(path = %path, "reindex failed: {e:#}"),
                }
            }
        });

        Ok(Self { handle })
    }
}
