//! Directory snapshots, diffs and the per-server debounced watcher.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::supervisor::events::ServerEvent;
use crate::utils::system_time_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative to the server root, `/`-separated.
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// None for directories.
    pub size: Option<u64>,
    /// Unix millis.
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: String,
    /// The new entry; absent for deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<FileEntry>,
}

pub(crate) fn entry_for(root: &Path, path: &Path) -> std::io::Result<FileEntry> {
    let meta = std::fs::symlink_metadata(path)?;
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let is_dir = meta.is_dir();
    Ok(FileEntry {
        path: rel,
        name,
        kind: if is_dir { FileKind::Directory } else { FileKind::File },
        size: if is_dir { None } else { Some(meta.len()) },
        modified: meta.modified().map(system_time_millis).unwrap_or(0),
    })
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // 스캔 도중 삭제된 파일은 건너뜀
        let file = match entry_for(root, &path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let is_dir = file.kind == FileKind::Directory;
        out.push(file);
        if is_dir {
            walk(root, &path, out)?;
        }
    }
    Ok(())
}

/// Full recursive listing, sorted by path. Symlinks are listed, not followed.
pub fn snapshot(root: &Path) -> std::io::Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Compare two sorted snapshots by path; modified means size or mtime changed.
pub fn diff(old: &[FileEntry], new: &[FileEntry]) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        let order = match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) => a.path.cmp(&b.path),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Less => {
                changes.push(FileChange {
                    kind: ChangeKind::Deleted,
                    path: old[i].path.clone(),
                    entry: None,
                });
                i += 1;
            }
            Ordering::Greater => {
                changes.push(FileChange {
                    kind: ChangeKind::Added,
                    path: new[j].path.clone(),
                    entry: Some(new[j].clone()),
                });
                j += 1;
            }
            Ordering::Equal => {
                let (a, b) = (&old[i], &new[j]);
                if a.size != b.size || a.modified != b.modified || a.kind != b.kind {
                    changes.push(FileChange {
                        kind: ChangeKind::Modified,
                        path: b.path.clone(),
                        entry: Some(b.clone()),
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    changes
}

/// A full listing plus the revision of the last diff it already contains.
#[derive(Debug, Clone)]
pub struct Listing {
    pub entries: Vec<FileEntry>,
    pub revision: u64,
}

#[derive(Default)]
struct Baseline {
    entries: Vec<FileEntry>,
    primed: bool,
    revision: u64,
}

/// Holds the last known listing of one server directory and broadcasts diffs.
/// Each broadcast diff carries a revision number, so a consumer that took a
/// [`Listing`] can skip the diffs it already contains.
pub struct FileWatcher {
    name: String,
    root: std::path::PathBuf,
    last: Mutex<Baseline>,
    events: broadcast::Sender<ServerEvent>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    debounce: Duration,
}

impl FileWatcher {
    pub fn new(
        name: &str,
        root: &Path,
        events: broadcast::Sender<ServerEvent>,
        debounce: Duration,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            last: Mutex::new(Baseline::default()),
            events,
            trigger_tx,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
            debounce,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn scan(&self) -> std::io::Result<Vec<FileEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if root.is_dir() {
                snapshot(&root)
            } else {
                Ok(Vec::new())
            }
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    /// Record the current listing as the baseline without emitting anything.
    /// A no-op once a baseline exists.
    pub async fn prime(&self) -> std::io::Result<()> {
        let mut last = self.last.lock().await;
        if !last.primed {
            last.entries = self.scan().await?;
            last.primed = true;
        }
        Ok(())
    }

    /// Rescan, broadcast the diff (if any) and return the full listing.
    /// The first scan only sets the baseline.
    pub async fn refresh(&self) -> std::io::Result<Listing> {
        let mut last = self.last.lock().await;
        let entries = self.scan().await?;
        if last.primed {
            let changes = diff(&last.entries, &entries);
            if !changes.is_empty() {
                last.revision += 1;
                tracing::debug!("[{}] {} file change(s), revision {}", self.name, changes.len(), last.revision);
                let _ = self.events.send(ServerEvent::Files { changes, revision: last.revision });
            }
        }
        last.entries = entries.clone();
        last.primed = true;
        Ok(Listing { entries, revision: last.revision })
    }

    /// Request a rescan; bursts within the debounce window collapse into one pass.
    pub fn invalidate(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Run the periodic + on-demand rescan loop until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let trigger_rx = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        tokio::spawn(async move {
            let Some(mut trigger_rx) = trigger_rx else {
                tracing::warn!("[{}] File watcher already running", self.name);
                return;
            };
            if let Err(e) = self.prime().await {
                tracing::warn!("[{}] Initial file scan failed: {}", self.name, e);
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    Some(()) = trigger_rx.recv() => {
                        tokio::time::sleep(self.debounce).await;
                        while trigger_rx.try_recv().is_ok() {}
                    }
                }
                if let Err(e) = self.refresh().await {
                    tracing::warn!("[{}] File scan failed: {}", self.name, e);
                }
            }
            tracing::debug!("[{}] File watcher stopped", self.name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64, modified: u64) -> FileEntry {
        FileEntry {
            path: path.into(),
            name: path.rsplit('/').next().unwrap().into(),
            kind: FileKind::File,
            size: Some(size),
            modified,
        }
    }

    #[test]
    fn diff_detects_all_kinds() {
        let old = vec![file("a.txt", 1, 10), file("b.txt", 2, 10), file("c.txt", 3, 10)];
        let new = vec![file("a.txt", 1, 10), file("b.txt", 5, 10), file("d.txt", 4, 10)];
        let changes = diff(&old, &new);
        let summary: Vec<(ChangeKind, &str)> =
            changes.iter().map(|c| (c.kind, c.path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Modified, "b.txt"),
                (ChangeKind::Deleted, "c.txt"),
                (ChangeKind::Added, "d.txt"),
            ]
        );
        assert!(changes[1].entry.is_none());
    }

    #[test]
    fn mtime_alone_counts_as_modified() {
        let changes = diff(&[file("a", 1, 10)], &[file("a", 1, 11)]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn snapshot_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("world/region")).unwrap();
        std::fs::write(dir.path().join("world/region/r.0.0.mca"), b"abc").unwrap();
        std::fs::write(dir.path().join("server.properties"), b"x=1").unwrap();

        let entries = snapshot(dir.path()).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["server.properties", "world", "world/region", "world/region/r.0.0.mca"]);
        assert_eq!(entries[1].kind, FileKind::Directory);
        assert_eq!(entries[1].size, None);
        assert_eq!(entries[3].size, Some(3));
        assert_eq!(entries[3].name, "r.0.0.mca");
    }

    #[test]
    fn snapshot_twice_without_changes_is_empty_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("plugins")).unwrap();
        std::fs::write(dir.path().join("plugins/a.jar"), b"jar").unwrap();
        let first = snapshot(dir.path()).unwrap();
        let second = snapshot(dir.path()).unwrap();
        assert!(diff(&first, &second).is_empty());
    }

    #[tokio::test]
    async fn refresh_broadcasts_only_the_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let watcher = FileWatcher::new("s1", dir.path(), tx, Duration::from_millis(10));
        watcher.prime().await.unwrap();

        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let listing = watcher.refresh().await.unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.revision, 1);
        match rx.try_recv().unwrap() {
            ServerEvent::Files { changes, revision } => {
                assert_eq!(revision, 1);
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].kind, ChangeKind::Added);
                assert_eq!(changes[0].path, "b.txt");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // 변경 없으면 이벤트 없음
        assert_eq!(watcher.refresh().await.unwrap().revision, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_refresh_only_sets_the_baseline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let watcher = FileWatcher::new("s1", dir.path(), tx, Duration::from_millis(10));

        // prime 전에 refresh 가 먼저 실행되어도 전체 목록이 added 로 나가지 않음
        let listing = watcher.refresh().await.unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.revision, 0);
        assert!(rx.try_recv().is_err());

        watcher.prime().await.unwrap();
        std::fs::write(dir.path().join("c.txt"), b"c").unwrap();
        watcher.refresh().await.unwrap();
        match rx.try_recv().unwrap() {
            ServerEvent::Files { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].path, "c.txt");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalidate_triggers_debounced_scan() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let watcher = Arc::new(FileWatcher::new("s1", dir.path(), tx, Duration::from_millis(50)));
        let shutdown = CancellationToken::new();
        let handle = watcher.clone().spawn(Duration::from_secs(3600), shutdown.clone());
        // 초기 스캔이 끝날 시간
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        watcher.invalidate();
        watcher.invalidate();
        watcher.invalidate();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        match event {
            ServerEvent::Files { changes, .. } => assert_eq!(changes.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
        shutdown.cancel();
        handle.await.unwrap();
    }
}
