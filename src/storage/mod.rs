//! Directory-per-project document store.
//!
//! ```text
//! <projects-dir>/<project name>/
//!   meta.json                 project document
//!   branches/<id>.json
//!   canvases/<id>.json        frames embedded
//!   conversations/<id>.json   messages embedded
//!   files/ previews/ assets/  opaque to the store
//! ```
//!
//! The directory name follows the project name and may differ from the id; the
//! id -> directory map lives only in memory and is rebuilt by scanning.
//! There is no locking: two concurrent updates of one document resolve as
//! last-write-wins.

pub mod access;
pub mod migrate;
pub mod models;

mod branches;
mod canvases;
mod conversations;
mod projects;

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::AppConfig;
use crate::error::{Result, WorkspaceError};
use access::AccessRequest;
use migrate::{migrate_project, Migrated, MigrationError};
use models::Project;

pub const META_FILE: &str = "meta.json";
pub const FILES_DIR: &str = "files";
pub const CANVASES_DIR: &str = "canvases";
pub const CONVERSATIONS_DIR: &str = "conversations";
pub const PREVIEWS_DIR: &str = "previews";
pub const ASSETS_DIR: &str = "assets";
pub const BRANCHES_DIR: &str = "branches";
/// Project-level frame files written before frames were embedded in canvases.
pub const LEGACY_FRAMES_DIR: &str = "frames";

pub const PROJECT_SUBDIRS: [&str; 6] = [
    FILES_DIR,
    CANVASES_DIR,
    CONVERSATIONS_DIR,
    PREVIEWS_DIR,
    ASSETS_DIR,
    BRANCHES_DIR,
];

pub const DEFAULT_ASSET_HINT_BYTES: u64 = 200 * 1024 * 1024;
const UNTITLED_PROJECT: &str = "Untitled Project";

type Migrate<T> = fn(Value) -> std::result::Result<Migrated<T>, MigrationError>;

pub struct DocumentStore {
    root: PathBuf,
    index: Mutex<HashMap<String, PathBuf>>,
    asset_dirs_checked: Mutex<HashSet<PathBuf>>,
    asset_hint_bytes: u64,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(HashMap::new()),
            asset_dirs_checked: Mutex::new(HashSet::new()),
            asset_hint_bytes: DEFAULT_ASSET_HINT_BYTES,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.projects_dir.clone()).with_asset_hint_threshold(config.asset_size_hint_bytes())
    }

    pub fn with_asset_hint_threshold(mut self, bytes: u64) -> Self {
        self.asset_hint_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make sure the projects root exists and is writable.
    pub async fn ensure_root(&self) -> Result<()> {
        access::ensure_access(&self.root, AccessRequest::write_dir()).await?;
        Ok(())
    }

    /// Current directory of a project, if it exists.
    pub async fn project_dir(&self, project_id: &str) -> Result<Option<PathBuf>> {
        self.resolve_project_dir(project_id).await
    }

    /// Rescan the root and replace the id -> directory index. Returns the number of
    /// projects found.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let projects = self.scan_projects().await?;
        let mut index = self.index();
        index.clear();
        for (dir, project) in projects {
            index.insert(project.id, dir);
        }
        Ok(index.len())
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn index_insert(&self, project_id: &str, dir: PathBuf) {
        self.index().insert(project_id.to_string(), dir);
    }

    pub(crate) fn index_remove(&self, project_id: &str) {
        self.index().remove(project_id);
    }

    pub(crate) async fn resolve_project_dir(&self, project_id: &str) -> Result<Option<PathBuf>> {
        let cached = self.index().get(project_id).cloned();
        if let Some(dir) = cached {
            if access::exists(&dir.join(META_FILE)).await {
                return Ok(Some(dir));
            }
        }
        self.rebuild_index().await?;
        Ok(self.index().get(project_id).cloned())
    }

    /// Resolve a project's directory and repair its layout, or fail with `NotFound`.
    pub(crate) async fn require_project_dir(&self, project_id: &str) -> Result<PathBuf> {
        let dir = self
            .resolve_project_dir(project_id)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("project", project_id))?;
        self.ensure_project_structure(&dir).await?;
        Ok(dir)
    }

    /// Like `require_project_dir`, but a missing project is `None`.
    pub(crate) async fn optional_project_dir(&self, project_id: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = self.resolve_project_dir(project_id).await? else {
            return Ok(None);
        };
        self.ensure_project_structure(&dir).await?;
        Ok(Some(dir))
    }

    /// Every `(directory, project)` pair under the root with a readable `meta.json`.
    pub(crate) async fn scan_projects(&self) -> Result<Vec<(PathBuf, Project)>> {
        let mut found: Vec<(PathBuf, Project)> = Vec::new();
        for entry in access::read_dir(&self.root).await? {
            if !entry.is_dir {
                continue;
            }
            let meta = entry.path.join(META_FILE);
            let Some(project) = self.load_document(&meta, "project", migrate_project).await? else {
                continue;
            };
            if let Some((other, _)) = found.iter().find(|(_, p)| p.id == project.id) {
                tracing::warn!(
                    "project {} found in both {} and {}; ignoring the latter",
                    project.id,
                    other.display(),
                    entry.path.display()
                );
                continue;
            }
            found.push((entry.path, project));
        }
        Ok(found)
    }

    /// Create any missing standard subdirectory of a project.
    pub(crate) async fn ensure_project_structure(&self, project_dir: &Path) -> Result<()> {
        for sub in PROJECT_SUBDIRS {
            let dir = project_dir.join(sub);
            access::ensure_access(&dir, AccessRequest::write_dir()).await?;
            if sub == ASSETS_DIR {
                self.check_asset_sizes(&dir).await;
            }
        }
        Ok(())
    }

    /// Warn once per directory about assets large enough to bloat the project
    /// folder. Returns the oversized files found on the first check.
    pub(crate) async fn check_asset_sizes(&self, assets_dir: &Path) -> Vec<PathBuf> {
        {
            let mut checked = self.asset_dirs_checked.lock().unwrap_or_else(|p| p.into_inner());
            if !checked.insert(assets_dir.to_path_buf()) {
                return Vec::new();
            }
        }
        let entries = match access::read_dir(assets_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!("skipping asset size check: {err}");
                return Vec::new();
            }
        };
        let mut oversized = Vec::new();
        for entry in entries {
            if entry.is_dir || entry.len < self.asset_hint_bytes {
                continue;
            }
            tracing::warn!(
                "asset {} is {} MB; consider storing it outside the project folder and symlinking it into {}",
                entry.name,
                entry.len / (1024 * 1024),
                assets_dir.display()
            );
            oversized.push(entry.path);
        }
        oversized
    }

    /// Directory for a project named `name`: the sanitized name, or the first free
    /// `"name (n)"` variant. `own_dir` is treated as free so that renaming a project
    /// to its current name resolves to where it already is.
    pub(crate) async fn unique_project_dir(&self, name: &str, own_dir: Option<&Path>) -> PathBuf {
        let base = sanitize_dir_name(name);
        let mut candidate = self.root.join(&base);
        let mut n = 1;
        loop {
            if own_dir == Some(candidate.as_path()) || !access::exists(&candidate).await {
                return candidate;
            }
            candidate = self.root.join(format!("{base} ({n})"));
            n += 1;
        }
    }

    /// Read one document, upgrading and rewriting it when its stored shape is old.
    /// Unparseable or invalid documents are logged and reported as absent.
    pub(crate) async fn load_document<T: Serialize>(
        &self,
        path: &Path,
        kind: &'static str,
        migrate: Migrate<T>,
    ) -> Result<Option<T>> {
        let Some(bytes) = access::read_optional(path).await? else {
            return Ok(None);
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("skipping unreadable {kind} {}: {err}", path.display());
                return Ok(None);
            }
        };
        match migrate(value) {
            Ok(Migrated::Current(doc)) => Ok(Some(doc)),
            Ok(Migrated::Upgraded(doc)) => {
                tracing::info!("migrated {kind} {} to the current format", path.display());
                self.write_json(path, &doc).await?;
                Ok(Some(doc))
            }
            Err(err) => {
                tracing::warn!("skipping {kind} {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    /// Load every `*.json` document in `dir`, skipping the ones that fail to load.
    pub(crate) async fn load_documents<T: Serialize>(
        &self,
        dir: &Path,
        kind: &'static str,
        migrate: Migrate<T>,
    ) -> Result<Vec<T>> {
        let mut docs = Vec::new();
        for entry in access::read_dir(dir).await? {
            if entry.is_dir || entry.name.starts_with('.') || !entry.name.ends_with(".json") {
                continue;
            }
            if let Some(doc) = self.load_document(&entry.path, kind, migrate).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    pub(crate) async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, doc: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(doc)?;
        bytes.push(b'\n');
        access::write_atomic(path, &bytes).await?;
        Ok(())
    }
}

/// File name for a document id, refusing ids that could address another path.
pub(crate) fn document_file(dir: &Path, id: &str) -> Result<PathBuf> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(WorkspaceError::InvalidPath(format!("invalid document id: {id:?}")));
    }
    Ok(dir.join(format!("{id}.json")))
}

/// Turn a project name into a portable directory name.
pub fn sanitize_dir_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    let trimmed = replaced
        .trim_start()
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return UNTITLED_PROJECT.to_string();
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return format!("{trimmed}_");
    }
    trimmed.to_string()
}
