//! Watches files, such as mounted TLS certificates, and calls back on changes.
//!
//! Directories holding the files are watched rather than the files themselves: Kubernetes
//! updates mounted secrets by swapping a `..data` symlink, which replaces every file at once.

use std::{collections::HashSet, future::Future, path::PathBuf};

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use stopper::Stopper;

/// Entry swapped by the Kubernetes atomic writer on secret and config map updates.
const ATOMIC_WRITER_DATA: &str = "..data";

pub struct FileWatcher<H> {
    handler: H,
    buffer: usize,
    stopper: Stopper,
    files: HashSet<PathBuf>,
}

impl<H> FileWatcher<H> {
    pub fn new(handler: H, buffer: usize, stopper: Stopper) -> Self {
        Self {
            handler,
            buffer,
            stopper,
            files: Default::default(),
        }
    }

    pub fn watch(&mut self, path: PathBuf) {
        self.files.insert(path);
    }

    fn directories(&self) -> HashSet<PathBuf> {
        self.files
            .iter()
            .map(|file| match file.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            })
            .collect()
    }
}

/// Tells whether the event touches one of the watched files.
fn is_relevant(event: &notify::Event, files: &HashSet<PathBuf>) -> bool {
    if event.kind.is_access() {
        return false;
    }
    event.paths.iter().any(|path| {
        files.contains(path)
            || path.file_name().map(|name| name == ATOMIC_WRITER_DATA).unwrap_or(false)
    })
}

impl<H, F> FileWatcher<H>
where
    H: Fn() -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    /// Starts watching in the background. The handler runs once per relevant event.
    pub fn spawn(self) -> Result<()> {
        let (sender, mut receiver) = tokio::sync::mpsc::channel(self.buffer);

        let mut watcher = notify::recommended_watcher(move |event_res| {
            let _ = sender.blocking_send(event_res);
        })?;
        for dir in self.directories() {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
        }

        tokio::spawn(async move {
            // Dropping the watcher stops the notifications.
            let _watcher = watcher;
            while let Some(Some(event_res)) = self.stopper.stop_future(receiver.recv()).await {
                match event_res {
                    Ok(event) if is_relevant(&event, &self.files) => {
                        tracing::debug!(paths = ?event.paths, kind = ?event.kind, "watched file changed");
                        (self.handler)().await;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::error!(%error, "failed to watch files");
                    }
                }
            }
        });

        Ok(())
    }
}
