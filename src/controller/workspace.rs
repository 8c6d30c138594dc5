use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{openat, AtFlags, OFlag, AT_FDCWD};
use nix::sys::stat::{fchmod, fstatat, mkdirat, FileStat, Mode, SFlag};
use nix::unistd::{fchown, Gid, Uid};
use serde::Serialize;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::CompressionMethod;

use super::registry::SessionRegistry;
use crate::shared::error::{LabError, LabResult};
use crate::shared::models::constants::MAX_FILE_READ_BYTES;
use crate::shared::models::LabStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Relative to the workspace root, `/`-separated.
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Sandboxed file access to each lab's host-side workspace directory,
/// which is bind-mounted into the container.
///
/// Every access walks the tree one component at a time relative to an open
/// directory descriptor, refusing symlinks, so a link swapped in by the
/// container mid-operation cannot redirect host I/O outside the workspace.
pub struct WorkspaceFileManager {
    registry: Arc<SessionRegistry>,
    root: PathBuf,
    mount_path: String,
    owner: Option<(u32, u32)>,
}

impl WorkspaceFileManager {
    pub fn new(registry: Arc<SessionRegistry>, root: PathBuf, mount_path: String) -> Self {
        Self {
            registry,
            root,
            mount_path,
            owner: None,
        }
    }

    /// Hand workspace directories and new files to this uid/gid. Without an
    /// owner they are made world-writable instead so the container user can
    /// still write to the bind mount.
    pub fn with_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.owner = owner;
        self
    }

    pub fn workspace_dir(&self, lab_id: &str) -> PathBuf {
        self.root.join(lab_id)
    }

    /// Create the lab's workspace directory before its container starts.
    pub async fn prepare(&self, lab_id: &str) -> LabResult<PathBuf> {
        let dir = self.workspace_dir(lab_id);
        tokio::fs::create_dir_all(&dir).await?;
        let dir = tokio::fs::canonicalize(&dir).await?;
        let owner = self.owner;
        let opened = dir.clone();
        tokio::task::spawn_blocking(move || -> LabResult<()> {
            let tree = WorkspaceTree::open(&opened, owner)?;
            tree.adopt(&tree.root, true);
            Ok(())
        })
        .await
        .map_err(join_error)??;
        info!("Workspace for lab {} at {}", lab_id, dir.display());
        Ok(dir)
    }

    pub async fn read(&self, lab_id: &str, path: &str) -> LabResult<Vec<u8>> {
        let raw = path.to_string();
        self.with_tree(lab_id, path, move |tree, relative| tree.read(&relative, &raw))
            .await
    }

    pub async fn write(&self, lab_id: &str, path: &str, data: &[u8]) -> LabResult<()> {
        let raw = path.to_string();
        let data = data.to_vec();
        let len = data.len();
        self.with_tree(lab_id, path, move |tree, relative| {
            tree.write(&relative, &raw, &data)
        })
        .await?;
        debug!("Wrote {} bytes to {} in lab {}", len, path, lab_id);
        Ok(())
    }

    /// Recursive listing under `prefix` (empty for the whole workspace),
    /// sorted by path. Symlinks are reported, never followed.
    pub async fn list(&self, lab_id: &str, prefix: &str) -> LabResult<Vec<FileInfo>> {
        let raw = prefix.to_string();
        self.with_tree(lab_id, prefix, move |tree, relative| tree.list(&relative, &raw))
            .await
    }

    /// Deterministic zip of the whole workspace: entries sorted by path,
    /// fixed timestamps, symlinks skipped.
    pub async fn zip(&self, lab_id: &str) -> LabResult<Bytes> {
        let archive = self.with_tree(lab_id, "", |tree, _| tree.zip()).await?;
        info!("Packed workspace of lab {} ({} bytes)", lab_id, archive.len());
        Ok(archive)
    }

    async fn with_tree<T, F>(&self, lab_id: &str, raw: &str, op: F) -> LabResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&WorkspaceTree, PathBuf) -> LabResult<T> + Send + 'static,
    {
        let root = self.ready_root(lab_id).await?;
        let relative = normalize(raw, &self.mount_path)?;
        let owner = self.owner;
        tokio::task::spawn_blocking(move || op(&WorkspaceTree::open(&root, owner)?, relative))
            .await
            .map_err(join_error)?
    }

    async fn ready_root(&self, lab_id: &str) -> LabResult<PathBuf> {
        let lab = self.registry.get(lab_id).await?;
        if lab.status != LabStatus::Running {
            return Err(LabError::SessionNotReady {
                id: lab_id.to_string(),
                status: lab.status,
            });
        }
        Ok(lab
            .persistent_storage_path
            .unwrap_or_else(|| self.workspace_dir(lab_id)))
    }
}

/// An open workspace root. All lookups below it go through `openat` with
/// `O_NOFOLLOW`, so symlinks inside the workspace are refused rather than
/// resolved.
struct WorkspaceTree {
    root: OwnedFd,
    owner: Option<(u32, u32)>,
}

impl WorkspaceTree {
    fn open(root: &Path, owner: Option<(u32, u32)>) -> LabResult<Self> {
        let root = openat(AT_FDCWD, root, dir_flags(), Mode::empty()).map_err(os_error)?;
        Ok(Self { root, owner })
    }

    fn read(&self, relative: &Path, raw: &str) -> LabResult<Vec<u8>> {
        let (parent, name) = split_file(relative)?;
        let dir = self.open_dir(parent, false, raw)?;
        let fd = openat(&dir, name, read_flags(), Mode::empty())
            .map_err(|e| classify(&dir, name, e, raw))?;
        let file = File::from(fd);
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(LabError::Validation(format!("'{}' is a directory", raw)));
        }
        if !meta.is_file() {
            return Err(LabError::Validation(format!("'{}' is not a regular file", raw)));
        }
        if meta.len() > MAX_FILE_READ_BYTES {
            return Err(too_large(raw, meta.len()));
        }

        let mut data = Vec::with_capacity(meta.len() as usize);
        file.take(MAX_FILE_READ_BYTES + 1).read_to_end(&mut data)?;
        if data.len() as u64 > MAX_FILE_READ_BYTES {
            return Err(too_large(raw, data.len() as u64));
        }
        Ok(data)
    }

    fn write(&self, relative: &Path, raw: &str, data: &[u8]) -> LabResult<()> {
        let (parent, name) = split_file(relative)?;
        let dir = self.open_dir(parent, true, raw)?;
        let created = openat(
            &dir,
            name,
            write_flags() | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o644),
        );
        let (fd, created) = match created {
            Ok(fd) => (fd, true),
            // O_EXCL refuses an existing name, links included; reopen it
            // without following
            Err(Errno::EEXIST) => {
                let fd = openat(&dir, name, write_flags() | OFlag::O_TRUNC, Mode::empty())
                    .map_err(|e| classify(&dir, name, e, raw))?;
                (fd, false)
            }
            Err(e) => return Err(classify(&dir, name, e, raw)),
        };
        let mut file = File::from(fd);
        if !file.metadata()?.is_file() {
            return Err(LabError::Validation(format!("'{}' is not a regular file", raw)));
        }
        if created {
            self.adopt(&file, false);
        }
        file.write_all(data)?;
        Ok(())
    }

    fn list(&self, relative: &Path, raw: &str) -> LabResult<Vec<FileInfo>> {
        let mut out = Vec::new();
        let mut collect = |_: &OwnedFd, _: &OsStr, info: &FileInfo| -> LabResult<()> {
            out.push(info.clone());
            Ok(())
        };

        match relative.file_name() {
            None => walk(&self.root, "", &mut collect)?,
            Some(name) => {
                let parent = self.open_dir(relative.parent().unwrap_or(Path::new("")), false, raw)?;
                let stat = fstatat(&parent, name, AtFlags::AT_SYMLINK_NOFOLLOW)
                    .map_err(|e| classify(&parent, name, e, raw))?;
                let path = slash_path(relative);
                let Some(info) = file_info(path.clone(), &stat) else {
                    return Err(LabError::Validation(format!(
                        "'{}' is not a file or directory",
                        raw
                    )));
                };
                collect(&parent, name, &info)?;
                if info.kind == FileKind::Directory {
                    let dir = openat(&parent, name, dir_flags(), Mode::empty())
                        .map_err(|e| classify(&parent, name, e, raw))?;
                    walk(&dir, &path, &mut collect)?;
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn zip(&self) -> LabResult<Bytes> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);
        let dir_options = options.unix_permissions(0o755);

        walk(&self.root, "", &mut |dir, name, info| {
            match info.kind {
                FileKind::Directory => writer
                    .add_directory(format!("{}/", info.path), dir_options)
                    .map_err(zip_error),
                FileKind::File => {
                    let fd = match openat(dir, name, read_flags(), Mode::empty()) {
                        Ok(fd) => fd,
                        // Replaced by a link or removed since the listing
                        Err(Errno::ELOOP | Errno::ENOENT) => return Ok(()),
                        Err(e) => return Err(os_error(e)),
                    };
                    let mut file = File::from(fd);
                    if !file.metadata()?.is_file() {
                        return Ok(());
                    }
                    writer.start_file(info.path.as_str(), options).map_err(zip_error)?;
                    std::io::copy(&mut file, &mut writer)?;
                    Ok(())
                }
                FileKind::Symlink => Ok(()),
            }
        })?;
        let cursor = writer.finish().map_err(zip_error)?;
        Ok(Bytes::from(cursor.into_inner()))
    }

    /// Open the directory at `relative`, one component at a time. With
    /// `create`, missing components are made as they are reached.
    fn open_dir(&self, relative: &Path, create: bool, raw: &str) -> LabResult<OwnedFd> {
        let mut dir = self.root.try_clone()?;
        for component in relative.components() {
            let name = component.as_os_str();
            dir = match openat(&dir, name, dir_flags(), Mode::empty()) {
                Ok(child) => child,
                Err(Errno::ENOENT) if create => {
                    let made = match mkdirat(&dir, name, Mode::from_bits_truncate(0o755)) {
                        Ok(()) => true,
                        Err(Errno::EEXIST) => false,
                        Err(e) => return Err(classify(&dir, name, e, raw)),
                    };
                    let child = openat(&dir, name, dir_flags(), Mode::empty())
                        .map_err(|e| classify(&dir, name, e, raw))?;
                    if made {
                        self.adopt(&child, true);
                    }
                    child
                }
                Err(e) => return Err(classify(&dir, name, e, raw)),
            };
        }
        Ok(dir)
    }

    fn adopt<Fd: AsFd>(&self, fd: Fd, is_dir: bool) {
        let result = match self.owner {
            Some((uid, gid)) => fchown(fd, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))),
            None => fchmod(fd, Mode::from_bits_truncate(if is_dir { 0o777 } else { 0o666 })),
        };
        if let Err(e) = result {
            warn!("Failed to hand workspace entry to the lab user: {}", e);
        }
    }
}

type Visit<'a> = dyn FnMut(&OwnedFd, &OsStr, &FileInfo) -> LabResult<()> + 'a;

/// Depth-first walk of `dir`, siblings in byte order. Directories are
/// entered through `O_NOFOLLOW` descriptors; special files are skipped.
fn walk(dir: &OwnedFd, prefix: &str, visit: &mut Visit<'_>) -> LabResult<()> {
    let mut names: Vec<OsString> = Vec::new();
    let mut listing = Dir::openat(dir, ".", dir_flags(), Mode::empty()).map_err(os_error)?;
    for entry in listing.iter() {
        let entry = entry.map_err(os_error)?;
        let name = OsStr::from_bytes(entry.file_name().to_bytes());
        if name != "." && name != ".." {
            names.push(name.to_os_string());
        }
    }
    drop(listing);
    names.sort();

    for name in names {
        let stat = match fstatat(dir, name.as_os_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(stat) => stat,
            Err(Errno::ENOENT) => continue,
            Err(e) => return Err(os_error(e)),
        };
        let path = if prefix.is_empty() {
            name.to_string_lossy().into_owned()
        } else {
            format!("{}/{}", prefix, name.to_string_lossy())
        };
        let Some(info) = file_info(path, &stat) else {
            continue;
        };
        visit(dir, name.as_os_str(), &info)?;
        if info.kind == FileKind::Directory {
            match openat(dir, name.as_os_str(), dir_flags(), Mode::empty()) {
                Ok(child) => walk(&child, &info.path, visit)?,
                Err(Errno::ENOENT | Errno::ENOTDIR | Errno::ELOOP) => continue,
                Err(e) => return Err(os_error(e)),
            }
        }
    }
    Ok(())
}

fn file_info(path: String, stat: &FileStat) -> Option<FileInfo> {
    let format = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
    let kind = if format == SFlag::S_IFREG {
        FileKind::File
    } else if format == SFlag::S_IFDIR {
        FileKind::Directory
    } else if format == SFlag::S_IFLNK {
        FileKind::Symlink
    } else {
        return None;
    };
    Some(FileInfo {
        path,
        kind,
        size: if kind == FileKind::File { stat.st_size as u64 } else { 0 },
        modified: DateTime::<Utc>::from_timestamp(stat.st_mtime as i64, stat.st_mtime_nsec as u32),
    })
}

/// Map a failed lookup of `name` under `parent` onto the API's errors.
fn classify<Fd: AsFd>(parent: Fd, name: &OsStr, errno: Errno, raw: &str) -> LabError {
    match errno {
        Errno::ENOENT => LabError::FileNotFound(raw.to_string()),
        Errno::EISDIR => LabError::Validation(format!("'{}' is a directory", raw)),
        // O_NOFOLLOW on a final component that is a link
        Errno::ELOOP => symlink_refused(raw),
        // O_DIRECTORY on a link reports ENOTDIR, tell it apart from a file
        Errno::ENOTDIR => match fstatat(parent, name, AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(stat) if file_info(String::new(), &stat).map(|i| i.kind) == Some(FileKind::Symlink) => {
                symlink_refused(raw)
            }
            _ => LabError::Validation(format!("'{}' crosses a non-directory", raw)),
        },
        other => os_error(other),
    }
}

fn symlink_refused(raw: &str) -> LabError {
    warn!("Refused symlink in workspace path {}", raw);
    LabError::PathTraversal(raw.to_string())
}

fn split_file(relative: &Path) -> LabResult<(&Path, &OsStr)> {
    let name = relative
        .file_name()
        .ok_or_else(|| LabError::Validation("path must name a file".into()))?;
    Ok((relative.parent().unwrap_or(Path::new("")), name))
}

fn too_large(raw: &str, len: u64) -> LabError {
    LabError::Validation(format!(
        "'{}' is {} bytes, reads are limited to {}",
        raw, len, MAX_FILE_READ_BYTES
    ))
}

fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC
}

// O_NONBLOCK keeps a FIFO planted by the container from hanging the open
fn read_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC
}

fn write_flags() -> OFlag {
    OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC
}

/// Lexically normalize a client path to a relative path inside the
/// workspace. Absolute paths are accepted only under `mount_path`.
pub fn normalize(raw: &str, mount_path: &str) -> LabResult<PathBuf> {
    if raw.contains('\0') {
        return Err(LabError::Validation("path contains a NUL byte".into()));
    }
    let mount = mount_path.trim_end_matches('/');
    let relative = if raw.starts_with('/') {
        if raw == mount {
            ""
        } else if let Some(rest) = raw.strip_prefix(mount).and_then(|r| r.strip_prefix('/')) {
            rest
        } else {
            return Err(LabError::PathTraversal(raw.to_string()));
        }
    } else {
        raw
    };

    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(LabError::PathTraversal(raw.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(LabError::PathTraversal(raw.to_string()))
            }
        }
    }
    Ok(parts.iter().collect())
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn os_error(e: Errno) -> LabError {
    LabError::Io(std::io::Error::from(e))
}

fn zip_error(e: zip::result::ZipError) -> LabError {
    LabError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn join_error(e: tokio::task::JoinError) -> LabError {
    LabError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::ImageCatalog;
    use crate::shared::models::{LabConfig, LabConfigRequest};
    use std::io::Read;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<SessionRegistry>,
        files: WorkspaceFileManager,
        lab_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let files = WorkspaceFileManager::new(
            registry.clone(),
            dir.path().join("workspaces"),
            "/workspace".into(),
        );
        let req = LabConfigRequest {
            language: "python".into(),
            ..Default::default()
        };
        let cfg = LabConfig::from_request(req, 1.0, 1 << 30, &ImageCatalog::default()).unwrap();
        let lab_id = registry.create("alice", "cs101", cfg).await;
        files.prepare(&lab_id).await.unwrap();
        registry
            .transition(&lab_id, &[LabStatus::Creating], LabStatus::Starting, None)
            .await
            .unwrap();
        registry
            .transition(&lab_id, &[LabStatus::Starting], LabStatus::Running, None)
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            registry,
            files,
            lab_id,
        }
    }

    #[test]
    fn normalize_handles_dots_and_mount_prefix() {
        assert_eq!(normalize("a/./b/../c.py", "/workspace").unwrap(), PathBuf::from("a/c.py"));
        assert_eq!(normalize("/workspace/src/x", "/workspace").unwrap(), PathBuf::from("src/x"));
        assert_eq!(normalize("/workspace", "/workspace").unwrap(), PathBuf::new());
        assert_eq!(normalize("", "/workspace").unwrap(), PathBuf::new());
    }

    #[test]
    fn normalize_rejects_escapes() {
        for bad in [
            "../../etc/passwd",
            "..",
            "a/../../b",
            "/etc/passwd",
            "/workspace/../etc/passwd",
            "/workspacefoo/x",
        ] {
            assert!(
                matches!(normalize(bad, "/workspace"), Err(LabError::PathTraversal(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn traversal_writes_do_no_io() {
        let f = fixture().await;
        let outside = f.files.root.join("escaped.txt");
        for bad in ["../escaped.txt", "../../etc/passwd", "/etc/passwd"] {
            let err = f.files.write(&f.lab_id, bad, b"x").await.unwrap_err();
            assert!(matches!(err, LabError::PathTraversal(_)));
        }
        assert!(!outside.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escapes_are_rejected() {
        let f = fixture().await;
        let outside = tempfile::tempdir().unwrap();
        let ws = f.files.workspace_dir(&f.lab_id);
        std::os::unix::fs::symlink(outside.path(), ws.join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("new.txt"), ws.join("dangling")).unwrap();

        let err = f.files.write(&f.lab_id, "link/pwned.txt", b"x").await.unwrap_err();
        assert!(matches!(err, LabError::PathTraversal(_)));
        let err = f.files.write(&f.lab_id, "dangling", b"x").await.unwrap_err();
        assert!(matches!(err, LabError::PathTraversal(_)));
        let err = f.files.read(&f.lab_id, "link/anything").await.unwrap_err();
        assert!(matches!(err, LabError::PathTraversal(_)));
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn symlinks_inside_the_workspace_are_refused() {
        let f = fixture().await;
        f.files.write(&f.lab_id, "src/main.py", b"print(1)").await.unwrap();
        let ws = f.files.workspace_dir(&f.lab_id);
        std::os::unix::fs::symlink(ws.join("src"), ws.join("alias")).unwrap();
        std::os::unix::fs::symlink(ws.join("src/main.py"), ws.join("main.py")).unwrap();

        for path in ["alias/main.py", "main.py"] {
            assert!(matches!(
                f.files.read(&f.lab_id, path).await,
                Err(LabError::PathTraversal(_))
            ));
        }
        assert!(matches!(
            f.files.write(&f.lab_id, "main.py", b"x").await,
            Err(LabError::PathTraversal(_))
        ));
        assert_eq!(
            std::fs::read(ws.join("src/main.py")).unwrap(),
            b"print(1)"
        );

        let listed = f.files.list(&f.lab_id, "").await.unwrap();
        let alias = listed.iter().find(|e| e.path == "alias").unwrap();
        assert_eq!(alias.kind, FileKind::Symlink);
        assert!(!listed.iter().any(|e| e.path.starts_with("alias/")));
    }

    #[tokio::test]
    async fn swapping_a_directory_for_a_link_never_escapes() {
        let f = fixture().await;
        let outside = tempfile::tempdir().unwrap();
        let ws = f.files.workspace_dir(&f.lab_id);
        let target = outside.path().to_path_buf();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let swapper = {
            let stop = stop.clone();
            let d = ws.join("d");
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = std::fs::create_dir(&d);
                    let _ = std::fs::remove_dir_all(&d);
                    let _ = std::os::unix::fs::symlink(&target, &d);
                    let _ = std::fs::remove_file(&d);
                }
            })
        };

        for i in 0..500 {
            let _ = f.files.write(&f.lab_id, &format!("d/x{}.txt", i), b"x").await;
            let _ = f.files.read(&f.lab_id, "d/x0.txt").await;
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        swapper.join().unwrap();

        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn special_files_are_not_opened() {
        let f = fixture().await;
        let ws = f.files.workspace_dir(&f.lab_id);
        nix::unistd::mkfifo(&ws.join("pipe"), Mode::from_bits_truncate(0o644)).unwrap();

        assert!(matches!(
            f.files.read(&f.lab_id, "pipe").await,
            Err(LabError::Validation(_))
        ));
        let listed = f.files.list(&f.lab_id, "").await.unwrap();
        assert!(listed.iter().all(|e| e.path != "pipe"));
    }

    #[tokio::test]
    async fn new_entries_are_writable_by_the_container_user() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture().await;
        f.files.write(&f.lab_id, "src/app.py", b"x").await.unwrap();
        let ws = f.files.workspace_dir(&f.lab_id);
        let mode = |p: PathBuf| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;

        assert_eq!(mode(ws.clone()), 0o777);
        assert_eq!(mode(ws.join("src")), 0o777);
        assert_eq!(mode(ws.join("src/app.py")), 0o666);
    }

    #[tokio::test]
    async fn round_trips_empty_and_binary_content() {
        let f = fixture().await;
        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        f.files.write(&f.lab_id, "empty.txt", b"").await.unwrap();
        f.files.write(&f.lab_id, "/workspace/bin/blob.dat", &binary).await.unwrap();
        assert_eq!(f.files.read(&f.lab_id, "empty.txt").await.unwrap(), b"");
        assert_eq!(f.files.read(&f.lab_id, "bin/blob.dat").await.unwrap(), binary);
    }

    #[tokio::test]
    async fn missing_file_and_directory_reads_fail() {
        let f = fixture().await;
        assert!(matches!(
            f.files.read(&f.lab_id, "nope.py").await,
            Err(LabError::FileNotFound(_))
        ));
        f.files.write(&f.lab_id, "dir/a.txt", b"a").await.unwrap();
        assert!(matches!(
            f.files.read(&f.lab_id, "dir").await,
            Err(LabError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_recursive_and_sorted() {
        let f = fixture().await;
        f.files.write(&f.lab_id, "b.txt", b"bb").await.unwrap();
        f.files.write(&f.lab_id, "a/z.py", b"z").await.unwrap();
        f.files.write(&f.lab_id, "a/c.py", b"ccc").await.unwrap();

        let all = f.files.list(&f.lab_id, "").await.unwrap();
        let paths: Vec<_> = all.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/c.py", "a/z.py", "b.txt"]);
        assert_eq!(all[0].kind, FileKind::Directory);
        assert_eq!(all[1].size, 3);

        let sub = f.files.list(&f.lab_id, "a").await.unwrap();
        let paths: Vec<_> = sub.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/c.py", "a/z.py"]);

        assert!(matches!(
            f.files.list(&f.lab_id, "missing").await,
            Err(LabError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn zip_is_deterministic_and_complete() {
        let f = fixture().await;
        f.files.write(&f.lab_id, "src/app.py", b"print('hi')").await.unwrap();
        f.files.write(&f.lab_id, "README.md", b"# lab").await.unwrap();

        let first = f.files.zip(&f.lab_id).await.unwrap();
        let second = f.files.zip(&f.lab_id).await.unwrap();
        assert_eq!(first, second);

        let mut archive = zip::ZipArchive::new(Cursor::new(first.to_vec())).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["README.md", "src/", "src/app.py"]);
        let mut content = String::new();
        archive
            .by_name("src/app.py")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "print('hi')");
    }

    #[tokio::test]
    async fn operations_require_running_lab() {
        let f = fixture().await;
        f.registry
            .transition(&f.lab_id, &[LabStatus::Running], LabStatus::Stopping, None)
            .await
            .unwrap();
        assert!(matches!(
            f.files.write(&f.lab_id, "a.txt", b"x").await,
            Err(LabError::SessionNotReady {
                status: LabStatus::Stopping,
                ..
            })
        ));
        assert!(matches!(
            f.files.zip(&f.lab_id).await,
            Err(LabError::SessionNotReady { .. })
        ));
    }
}
