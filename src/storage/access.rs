//! Guarded filesystem calls.
//!
//! Every call the document store makes against disk goes through here so that
//! failures reach the user as one of four actionable messages instead of a raw
//! OS error code.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
}

impl fmt::Display for AccessIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessIntent::Read => f.write_str("read"),
            AccessIntent::Write => f.write_str("write"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::File => f.write_str("file"),
            PathKind::Directory => f.write_str("directory"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AccessRequest {
    pub intent: AccessIntent,
    pub create_if_missing: bool,
    pub kind: PathKind,
}

impl AccessRequest {
    pub fn read_dir() -> Self {
        Self {
            intent: AccessIntent::Read,
            create_if_missing: false,
            kind: PathKind::Directory,
        }
    }

    /// Writable directory, created (recursively) when missing.
    pub fn write_dir() -> Self {
        Self {
            intent: AccessIntent::Write,
            create_if_missing: true,
            kind: PathKind::Directory,
        }
    }

    pub fn read_file() -> Self {
        Self {
            intent: AccessIntent::Read,
            create_if_missing: false,
            kind: PathKind::File,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error(
        "Permission denied while trying to {intent} {}. Grant your user {intent} access to it \
         (for example `chmod u+rw \"{}\"`) or choose a different projects folder.",
        .path.display(),
        .path.display()
    )]
    PermissionDenied { path: PathBuf, intent: AccessIntent },

    #[error(
        "{} does not exist. Create it, or point the projects folder at an existing directory.",
        .path.display()
    )]
    MissingPath { path: PathBuf },

    #[error(
        "{} is not a {expected}. Move or rename whatever is at that path so a {expected} can be used there.",
        .path.display()
    )]
    WrongKind { path: PathBuf, expected: PathKind },

    #[error(
        "Could not access {}: {source}. Check that the path is valid and not locked by another program.",
        .path.display()
    )]
    Generic {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AccessError {
    pub fn path(&self) -> &Path {
        match self {
            AccessError::PermissionDenied { path, .. }
            | AccessError::MissingPath { path }
            | AccessError::WrongKind { path, .. }
            | AccessError::Generic { path, .. } => path,
        }
    }
}

/// Map an OS error for `path` onto the externally visible shapes.
pub fn classify(path: &Path, intent: AccessIntent, expected: PathKind, err: io::Error) -> AccessError {
    let path = path.to_path_buf();
    match err.kind() {
        io::ErrorKind::PermissionDenied => return AccessError::PermissionDenied { path, intent },
        io::ErrorKind::NotFound => return AccessError::MissingPath { path },
        // create_dir_all on top of an existing file
        io::ErrorKind::AlreadyExists if expected == PathKind::Directory => {
            return AccessError::WrongKind { path, expected }
        }
        _ => {}
    }

    #[cfg(unix)]
    {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => {
                return AccessError::PermissionDenied { path, intent }
            }
            Some(libc::ENOTDIR) => {
                return AccessError::WrongKind {
                    path,
                    expected: PathKind::Directory,
                }
            }
            Some(libc::EISDIR) => {
                return AccessError::WrongKind {
                    path,
                    expected: PathKind::File,
                }
            }
            _ => {}
        }
    }

    AccessError::Generic { path, source: err }
}

/// Verify that `path` exists as the requested kind and is usable for the requested
/// intent, creating missing directories when asked to.
pub async fn ensure_access(path: &Path, request: AccessRequest) -> Result<(), AccessError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if !(request.create_if_missing && request.kind == PathKind::Directory) {
                return Err(AccessError::MissingPath {
                    path: path.to_path_buf(),
                });
            }
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| classify(path, AccessIntent::Write, PathKind::Directory, e))?;
            tokio::fs::metadata(path)
                .await
                .map_err(|e| classify(path, request.intent, request.kind, e))?
        }
        Err(err) => return Err(classify(path, request.intent, request.kind, err)),
    };

    let is_expected_kind = match request.kind {
        PathKind::Directory => metadata.is_dir(),
        PathKind::File => metadata.is_file(),
    };
    if !is_expected_kind {
        return Err(AccessError::WrongKind {
            path: path.to_path_buf(),
            expected: request.kind,
        });
    }

    check_mode(path, &metadata, request)
}

#[cfg(unix)]
fn check_mode(path: &Path, _metadata: &std::fs::Metadata, request: AccessRequest) -> Result<(), AccessError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return Err(AccessError::Generic {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
        });
    };
    let mut mode = match request.intent {
        AccessIntent::Read => libc::R_OK,
        AccessIntent::Write => libc::R_OK | libc::W_OK,
    };
    if request.kind == PathKind::Directory {
        mode |= libc::X_OK;
    }
    if unsafe { libc::access(c_path.as_ptr(), mode) } != 0 {
        let err = io::Error::last_os_error();
        return Err(classify(path, request.intent, request.kind, err));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(path: &Path, metadata: &std::fs::Metadata, request: AccessRequest) -> Result<(), AccessError> {
    if request.intent == AccessIntent::Write
        && request.kind == PathKind::File
        && metadata.permissions().readonly()
    {
        return Err(AccessError::PermissionDenied {
            path: path.to_path_buf(),
            intent: request.intent,
        });
    }
    Ok(())
}

/// One entry of a directory listing.
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
}

/// Read a file, treating a missing file as `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, AccessError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(classify(path, AccessIntent::Read, PathKind::File, err)),
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename, after ensuring
/// the parent directory exists and is writable.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AccessError> {
    if let Some(parent) = path.parent() {
        ensure_access(parent, AccessRequest::write_dir()).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| classify(&tmp_path, AccessIntent::Write, PathKind::File, e))?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(classify(path, AccessIntent::Write, PathKind::File, err));
    }
    Ok(())
}

pub async fn create_dir_all(path: &Path) -> Result<(), AccessError> {
    ensure_access(path, AccessRequest::write_dir()).await
}

/// Remove a file; `false` when it was already gone.
pub async fn remove_file(path: &Path) -> Result<bool, AccessError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(classify(path, AccessIntent::Write, PathKind::File, err)),
    }
}

/// Remove a directory tree; `false` when it was already gone.
pub async fn remove_dir_all(path: &Path) -> Result<bool, AccessError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(classify(path, AccessIntent::Write, PathKind::Directory, err)),
    }
}

/// Remove an empty directory; `false` when it was already gone.
pub async fn remove_dir(path: &Path) -> Result<bool, AccessError> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(classify(path, AccessIntent::Write, PathKind::Directory, err)),
    }
}

pub async fn rename(from: &Path, to: &Path) -> Result<(), AccessError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| classify(from, AccessIntent::Write, PathKind::Directory, e))
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// List a directory. A missing directory lists as empty.
pub async fn read_dir(path: &Path) -> Result<Vec<DirEntryInfo>, AccessError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(classify(path, AccessIntent::Read, PathKind::Directory, err)),
    };

    let mut out = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => return Err(classify(path, AccessIntent::Read, PathKind::Directory, err)),
        };
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        out.push(DirEntryInfo {
            path: entry.path(),
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            len: metadata.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_missing_directory_when_requested() {
        let temp = TempDir::new().expect("tempdir");
        let target = temp.path().join("a").join("b");
        ensure_access(&target, AccessRequest::write_dir())
            .await
            .expect("directory should be created");
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn reports_missing_path_without_create() {
        let temp = TempDir::new().expect("tempdir");
        let target = temp.path().join("nope");
        let err = ensure_access(&target, AccessRequest::read_dir())
            .await
            .expect_err("missing directory should fail");
        assert!(matches!(err, AccessError::MissingPath { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn reports_file_where_directory_expected() {
        let temp = TempDir::new().expect("tempdir");
        let target = temp.path().join("projects");
        std::fs::write(&target, "not a dir").expect("seed file");

        let err = ensure_access(&target, AccessRequest::write_dir())
            .await
            .expect_err("file should not satisfy a directory request");
        assert!(matches!(
            err,
            AccessError::WrongKind {
                expected: PathKind::Directory,
                ..
            }
        ));
        assert!(err.to_string().contains("Move or rename"));
    }

    #[test]
    fn classifies_permission_errors() {
        let err = classify(
            Path::new("/root/projects"),
            AccessIntent::Write,
            PathKind::Directory,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, AccessError::PermissionDenied { .. }));
        let message = err.to_string();
        assert!(message.contains("/root/projects"));
        assert!(message.contains("chmod"));
    }

    #[test]
    fn unknown_errors_fall_back_to_generic() {
        let err = classify(
            Path::new("/tmp/x"),
            AccessIntent::Read,
            PathKind::File,
            io::Error::new(io::ErrorKind::Other, "disk on fire"),
        );
        assert!(matches!(err, AccessError::Generic { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn write_atomic_creates_parent_and_leaves_no_temp_file() {
        let temp = TempDir::new().expect("tempdir");
        let target = temp.path().join("branches").join("b1.json");
        write_atomic(&target, b"{}").await.expect("write");

        assert_eq!(std::fs::read_to_string(&target).expect("read back"), "{}");
        let names: Vec<_> = std::fs::read_dir(temp.path().join("branches"))
            .expect("list")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b1.json".to_string()]);
    }

    #[tokio::test]
    async fn remove_dir_only_drops_empty_directories() {
        let temp = TempDir::new().expect("tempdir");
        let empty = temp.path().join("frames");
        std::fs::create_dir(&empty).expect("seed dir");
        assert!(remove_dir(&empty).await.expect("remove"));
        assert!(!remove_dir(&empty).await.expect("already gone"));

        let full = temp.path().join("canvases");
        std::fs::create_dir(&full).expect("seed dir");
        std::fs::write(full.join("c1.json"), "{}").expect("seed file");
        assert!(remove_dir(&full).await.is_err());
        assert!(full.join("c1.json").is_file());
    }
}
