//! Sandboxed file operations under one server's root directory.
//!
//! Every path is relative to the server root. Absolute paths and `..`
//! segments are rejected with `InvalidPath` before anything is touched.
//! Each mutation invalidates the server's [`FileWatcher`] so attached
//! clients receive a `file_update`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::supervisor::error::{Result, SupervisorError};

pub mod watcher;

pub use watcher::{ChangeKind, FileChange, FileEntry, FileKind, FileWatcher, Listing};

/// Resolve `rel` under `root`. An empty path (or `.`) is the root itself.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let invalid = || SupervisorError::InvalidPath(rel.to_string());
    if rel.contains('\0') {
        return Err(invalid());
    }
    // 백슬래시 구분자도 검사 (윈도우 스타일 경로가 일반 컴포넌트로 취급되는 것 방지)
    if rel.split(|c| c == '/' || c == '\\').any(|seg| seg == "..") {
        return Err(invalid());
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }

    ensure_no_symlink_escape(root, &resolved).map_err(|_| invalid())?;
    Ok(resolved)
}

/// Like [`resolve`] but refuses the root itself (for delete/move/etc.).
pub fn resolve_entry(root: &Path, rel: &str) -> Result<PathBuf> {
    let path = resolve(root, rel)?;
    if path == root {
        return Err(SupervisorError::InvalidPath(format!("'{}' refers to the server root", rel)));
    }
    Ok(path)
}

/// The deepest existing ancestor must canonicalize to somewhere inside the root.
fn ensure_no_symlink_escape(root: &Path, path: &Path) -> std::result::Result<(), ()> {
    let Ok(canonical_root) = root.canonicalize() else {
        return Ok(());
    };
    let mut ancestor = path;
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            return if canonical.starts_with(&canonical_root) { Ok(()) } else { Err(()) };
        }
        match ancestor.parent() {
            Some(parent) if parent.starts_with(root) => ancestor = parent,
            _ => return Ok(()),
        }
    }
}

fn not_found(rel: &str) -> SupervisorError {
    SupervisorError::NotFound(format!("file '{}'", rel))
}

fn already_exists(rel: &str) -> SupervisorError {
    SupervisorError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("'{}' already exists", rel),
    ))
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("blocking task failed: {}", e)))?
}

/// File operations for one server, scoped to its root.
pub struct FileManager {
    root: PathBuf,
    watcher: Arc<FileWatcher>,
}

impl FileManager {
    pub fn new(watcher: Arc<FileWatcher>) -> Self {
        Self { root: watcher.root().to_path_buf(), watcher }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watcher(&self) -> &Arc<FileWatcher> {
        &self.watcher
    }

    /// Direct children of a directory, directories first then by name.
    pub async fn list(&self, rel: &str) -> Result<Vec<FileEntry>> {
        let dir = resolve(&self.root, rel)?;
        let root = self.root.clone();
        let rel = rel.to_string();
        blocking(move || {
            if !dir.is_dir() {
                return Err(not_found(&rel));
            }
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                entries.push(watcher::entry_for(&root, &entry?.path())?);
            }
            entries.sort_by(|a, b| {
                (a.kind != FileKind::Directory, &a.name).cmp(&(b.kind != FileKind::Directory, &b.name))
            });
            Ok(entries)
        })
        .await
    }

    /// Text content (lossy UTF-8).
    pub async fn read(&self, rel: &str) -> Result<String> {
        let bytes = self.download(rel).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn write(&self, rel: &str, content: &str) -> Result<()> {
        self.upload(rel, content.as_bytes()).await
    }

    /// Create an empty file; fails if it exists.
    pub async fn create(&self, rel: &str) -> Result<()> {
        let path = resolve_entry(&self.root, rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(already_exists(rel)),
            Err(e) => return Err(e.into()),
        }
        self.watcher.invalidate();
        Ok(())
    }

    pub async fn create_folder(&self, rel: &str) -> Result<()> {
        let path = resolve_entry(&self.root, rel)?;
        if path.exists() {
            return Err(already_exists(rel));
        }
        tokio::fs::create_dir_all(&path).await?;
        self.watcher.invalidate();
        Ok(())
    }

    /// Delete a file or a directory tree.
    pub async fn delete(&self, rel: &str) -> Result<()> {
        let path = resolve_entry(&self.root, rel)?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(rel)),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        self.watcher.invalidate();
        Ok(())
    }

    /// Copy a file or directory tree; the destination must not exist.
    pub async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = resolve_entry(&self.root, from)?;
        let dst = resolve_entry(&self.root, to)?;
        if !src.exists() {
            return Err(not_found(from));
        }
        if dst.exists() {
            return Err(already_exists(to));
        }
        if dst.starts_with(&src) {
            return Err(SupervisorError::InvalidPath(format!("cannot copy '{}' into itself", from)));
        }
        blocking(move || {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_recursive(&src, &dst)?;
            Ok(())
        })
        .await?;
        self.watcher.invalidate();
        Ok(())
    }

    /// Move or rename; the destination must not exist.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = resolve_entry(&self.root, from)?;
        let dst = resolve_entry(&self.root, to)?;
        if !src.exists() {
            return Err(not_found(from));
        }
        if dst.exists() {
            return Err(already_exists(to));
        }
        if dst.starts_with(&src) {
            return Err(SupervisorError::InvalidPath(format!("cannot move '{}' into itself", from)));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        self.watcher.invalidate();
        Ok(())
    }

    /// Write raw bytes, creating parent directories and replacing any existing file.
    pub async fn upload(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = resolve_entry(&self.root, rel)?;
        if path.is_dir() {
            return Err(SupervisorError::InvalidPath(format!("'{}' is a directory", rel)));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        self.watcher.invalidate();
        Ok(())
    }

    /// Write a streamed upload through a hidden sibling file, then move it into
    /// place. Fails with `TooLarge` past `limit` bytes and leaves no partial file.
    pub async fn upload_stream<S, B, E>(&self, rel: &str, mut chunks: S, limit: u64) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let path = resolve_entry(&self.root, rel)?;
        if path.is_dir() {
            return Err(SupervisorError::InvalidPath(format!("'{}' is a directory", rel)));
        }
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(SupervisorError::InvalidPath(rel.to_string()));
        };
        tokio::fs::create_dir_all(parent).await?;
        let partial = parent.join(format!(".{}.upload", file_name.to_string_lossy()));

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut written: u64 = 0;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| {
                    SupervisorError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                })?;
                let chunk = chunk.as_ref();
                written += chunk.len() as u64;
                if written > limit {
                    return Err(SupervisorError::TooLarge(format!(
                        "upload to '{}' exceeds {} bytes",
                        rel, limit
                    )));
                }
                file.write_all(chunk).await?;
            }
            file.flush().await?;
            Ok::<u64, SupervisorError>(written)
        }
        .await;

        match written {
            Ok(written) => {
                tokio::fs::rename(&partial, &path).await?;
                self.watcher.invalidate();
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    pub async fn download(&self, rel: &str) -> Result<Vec<u8>> {
        let path = resolve_entry(&self.root, rel)?;
        if !path.is_file() {
            return Err(not_found(rel));
        }
        Ok(tokio::fs::read(&path).await?)
    }

    /// Pack `paths` (files or directories) into the archive at `dest`.
    pub async fn zip(&self, paths: &[String], dest: &str) -> Result<()> {
        if paths.is_empty() {
            return Err(SupervisorError::InvalidSpec("nothing to zip".into()));
        }
        let archive = resolve_entry(&self.root, dest)?;
        let mut sources = Vec::with_capacity(paths.len());
        for rel in paths {
            let path = resolve_entry(&self.root, rel)?;
            if !path.exists() {
                return Err(not_found(rel));
            }
            sources.push(path);
        }

        let root = self.root.clone();
        blocking(move || {
            // 아카이브 자신이 포함되지 않도록 먼저 목록을 만든 뒤 작성
            let mut entries: Vec<FileEntry> = Vec::new();
            for src in &sources {
                entries.push(watcher::entry_for(&root, src)?);
                if src.is_dir() {
                    let nested = watcher::snapshot(src)?;
                    let prefix = watcher::entry_for(&root, src)?.path;
                    entries.extend(nested.into_iter().map(|mut e| {
                        e.path = format!("{}/{}", prefix, e.path);
                        e
                    }));
                }
            }

            if let Some(parent) = archive.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&archive)?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for entry in entries {
                let abs = root.join(&entry.path);
                if abs == archive {
                    continue;
                }
                match entry.kind {
                    FileKind::Directory => writer
                        .add_directory(format!("{}/", entry.path), options)
                        .context("adding directory to archive")?,
                    FileKind::File => {
                        writer
                            .start_file(entry.path.clone(), options)
                            .context("adding file to archive")?;
                        let mut input = File::open(&abs)?;
                        std::io::copy(&mut input, &mut writer)?;
                    }
                }
            }
            writer.finish().context("finishing archive")?.flush()?;
            Ok(())
        })
        .await?;
        self.watcher.invalidate();
        Ok(())
    }

    /// Extract an archive into `dest` (a directory, created if missing).
    /// Returns the extracted paths relative to the server root. Entries escaping `dest` abort the whole operation.
    pub async fn unzip(&self, archive: &str, dest: &str) -> Result<Vec<String>> {
        let archive_path = resolve_entry(&self.root, archive)?;
        let dest_path = resolve(&self.root, dest)?;
        if !archive_path.is_file() {
            return Err(not_found(archive));
        }

        let archive_name = archive.to_string();
        let root = self.root.clone();
        let extracted = blocking(move || {
            let file = File::open(&archive_path)?;
            let mut zip = zip::ZipArchive::new(file).context("opening archive")?;

            // 먼저 전체 엔트리를 검증. 하나라도 벗어나면 아무것도 쓰지 않음
            let mut plan = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                let entry = zip.by_index(i).context("reading archive entry")?;
                let Some(name) = entry.enclosed_name().map(Path::to_path_buf) else {
                    return Err(SupervisorError::InvalidPath(format!(
                        "archive '{}' contains unsafe entry '{}'",
                        archive_name,
                        entry.name()
                    )));
                };
                plan.push((i, name, entry.is_dir()));
            }

            let mut written = Vec::with_capacity(plan.len());
            for (i, name, is_dir) in plan {
                let out = dest_path.join(&name);
                if is_dir {
                    std::fs::create_dir_all(&out)?;
                } else {
                    if let Some(parent) = out.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut entry = zip.by_index(i).context("reading archive entry")?;
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf)?;
                    std::fs::write(&out, buf)?;
                }
                let rel = out.strip_prefix(&root).unwrap_or(&name);
                written.push(rel.to_string_lossy().replace('\\', "/"));
            }
            Ok(written)
        })
        .await?;
        self.watcher.invalidate();
        Ok(extracted)
    }
}
