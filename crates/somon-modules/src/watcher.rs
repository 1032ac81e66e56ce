// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! File watching for module dependency sets
//!
//! Each session owns one OS watcher subscribed to the directories that
//! contain its files, so files that do not exist yet can still be watched.
//! Events are forwarded through a channel to a task that invokes the
//! session's callback.

use crate::error::{ModuleError, Result};
use crate::module_system::normalize;
use notify::event::ModifyKind;
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What happened to a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// File appeared
    Created,
    /// File contents or metadata changed
    Modified,
    /// File was renamed
    Renamed,
    /// File was deleted
    Removed,
}

impl ChangeKind {
    fn from_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
            EventKind::Modify(_) => Some(ChangeKind::Modified),
            EventKind::Remove(_) => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

/// A change to one watched file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Kind of change
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Watched file that changed
    pub file_path: PathBuf,
}

/// Invoked once per change event
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// A live subscription to changes of a set of files
pub struct WatchSession {
    id: Uuid,
    watched_paths: Vec<PathBuf>,
    directories: Vec<PathBuf>,
    closed: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("id", &self.id)
            .field("watched_paths", &self.watched_paths)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Key under which notify reports events for `path`
fn watch_key(path: &Path) -> PathBuf {
    let path = normalize(path);
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => path,
        },
        _ => path,
    }
}

impl WatchSession {
    /// Start watching `paths`. Must be called within a tokio runtime.
    ///
    /// Paths that do not exist are accepted; their directory is watched if it
    /// exists so that the file appearing is reported.
    pub fn start(paths: Vec<PathBuf>, on_change: ChangeCallback) -> Result<Arc<Self>> {
        let watched: Vec<PathBuf> = paths.iter().map(|p| watch_key(p)).collect();
        let lookup: HashSet<PathBuf> = watched.iter().cloned().collect();
        let directories: BTreeSet<PathBuf> = watched
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;

        let mut subscribed = Vec::new();
        for dir in directories {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "Directory does not exist; not subscribed");
                continue;
            }
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            subscribed.push(dir);
        }

        let id = Uuid::new_v4();
        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(session = %id, error = %e, "Watch error");
                        continue;
                    }
                };
                let Some(kind) = ChangeKind::from_event(&event.kind) else {
                    continue;
                };
                for path in event.paths {
                    if !lookup.contains(&path) {
                        continue;
                    }
                    debug!(session = %id, path = %path.display(), ?kind, "File changed");
                    let change = ChangeEvent {
                        kind,
                        file_path: path,
                    };
                    if catch_unwind(AssertUnwindSafe(|| on_change(change))).is_err() {
                        error!(session = %id, "Change callback panicked");
                    }
                }
            }
        });

        debug!(session = %id, files = watched.len(), "Watch session started");
        Ok(Arc::new(Self {
            id,
            watched_paths: watched,
            directories: subscribed,
            closed: AtomicBool::new(false),
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
        }))
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Files this session reports on
    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched_paths
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop watching. Later calls do nothing.
    ///
    /// Every subscription is released even if unsubscribing one of them
    /// fails; the failures are reported together.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut failures = Vec::new();
        if let Some(mut watcher) = self.watcher.lock().take() {
            for dir in &self.directories {
                if let Err(e) = watcher.unwatch(dir) {
                    failures.push(format!("{}: {}", dir.display(), e));
                }
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(session = %self.id, "Watch session closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::Watch(failures.join("; ")))
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(session = %self.id, error = %e, "Watch session closed with errors");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn channel_callback() -> (ChangeCallback, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ChangeCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    async fn next_for(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>, path: &Path) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("watch channel closed");
                if event.file_path == path {
                    return event;
                }
            }
        })
        .await
        .expect("no change event")
    }

    #[tokio::test]
    async fn test_reports_changes_to_watched_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.som");
        fs::write(&file, "чоп.сабт(1);").unwrap();
        let (callback, mut rx) = channel_callback();

        let session = WatchSession::start(vec![file.clone()], callback).unwrap();
        let key = watch_key(&file);
        assert_eq!(session.watched_paths(), &[key.clone()]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&file, "чоп.сабт(2);").unwrap();
        let event = next_for(&mut rx, &key).await;
        assert!(matches!(event.kind, ChangeKind::Modified | ChangeKind::Created));

        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_can_be_watched() {
        let dir = tempfile::tempdir().unwrap();
        let later = dir.path().join("later.som");
        let nowhere = dir.path().join("no/such/dir/x.som");
        let (callback, mut rx) = channel_callback();

        let session = WatchSession::start(vec![later.clone(), nowhere], callback).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&later, "").unwrap();
        let event = next_for(&mut rx, &watch_key(&later)).await;
        assert_eq!(event.file_path, watch_key(&later));
        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (callback, _rx) = channel_callback();
        let session = WatchSession::start(vec![dir.path().join("a.som")], callback).unwrap();
        assert!(!session.is_closed());
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
    }

    #[test]
    fn test_change_kinds() {
        use notify::event::{CreateKind, DataChange, RenameMode};
        assert_eq!(
            ChangeKind::from_event(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            ChangeKind::from_event(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            ChangeKind::from_event(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(ChangeKind::Renamed)
        );
        assert_eq!(ChangeKind::from_event(&EventKind::Any), None);

        let json = serde_json::to_value(ChangeEvent {
            kind: ChangeKind::Removed,
            file_path: PathBuf::from("/a.som"),
        })
        .unwrap();
        assert_eq!(json["type"], "removed");
        assert_eq!(json["filePath"], "/a.som");
    }
}
