use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, WorkspaceError};
use crate::util::{join_within, to_forward_slash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Add,
    Change,
    Remove,
}

/// One filesystem change, with paths relative to the project root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    #[serde(rename = "type")]
    pub kind: FileEventKind,
    pub paths: Vec<String>,
}

type Callback = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Watches part of a project tree and forwards every OS event to one callback.
///
/// There is no debouncing or coalescing: an editor save may show up as several
/// events, and consumers are expected to treat them as idempotent hints.
pub struct FileWatcher {
    project_root: PathBuf,
    callback: Arc<Mutex<Option<Callback>>>,
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let project_root = std::fs::canonicalize(&project_root).unwrap_or(project_root);
        Self {
            project_root,
            callback: Arc::new(Mutex::new(None)),
            watcher: None,
        }
    }

    /// Register the event callback, replacing any previous one.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(FileEvent) + Send + Sync + 'static,
    {
        let mut guard = self.callback.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Arc::new(callback));
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Begin watching `root_relative_path` (relative to the project root; `""` for
    /// the whole project). A previous watch is replaced.
    pub fn start(&mut self, root_relative_path: &str, recursive: bool, excludes: &[String]) -> Result<()> {
        let target = join_within(&self.project_root, root_relative_path).ok_or_else(|| {
            WorkspaceError::InvalidPath(format!("{root_relative_path} escapes the project root"))
        })?;
        let excludes = build_excludes(excludes)?;

        self.watcher = None;
        let project_root = self.project_root.clone();
        let callback = self.callback.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => dispatch(&project_root, &excludes, &callback, event),
                Err(err) => tracing::warn!("file watcher error: {err}"),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| WorkspaceError::Custom(format!("watcher init failed: {e}")))?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&target, mode)
            .map_err(|e| WorkspaceError::Custom(format!("failed to watch {}: {e}", target.display())))?;
        tracing::debug!(path = %target.display(), recursive, "file watcher started");
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Release the OS watch handles and forget the callback.
    pub fn stop(&mut self) {
        self.watcher = None;
        let mut guard = self.callback.lock().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_matches('/');
        if pattern.is_empty() {
            continue;
        }
        let is_glob = pattern.contains(['*', '?', '[', '{']);
        let variants = if is_glob {
            vec![pattern.to_string(), format!("{pattern}/**")]
        } else {
            // Bare names match that path component anywhere in the tree.
            vec![
                pattern.to_string(),
                format!("{pattern}/**"),
                format!("**/{pattern}"),
                format!("**/{pattern}/**"),
            ]
        };
        for variant in variants {
            let glob = Glob::new(&variant)
                .map_err(|e| WorkspaceError::Custom(format!("invalid exclude pattern {pattern}: {e}")))?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|e| WorkspaceError::Custom(format!("invalid exclude patterns: {e}")))
}

fn dispatch(project_root: &Path, excludes: &GlobSet, callback: &Mutex<Option<Callback>>, event: Event) {
    let callback = match callback.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let Some(callback) = callback else {
        return;
    };
    for file_event in translate(project_root, excludes, event) {
        callback(file_event);
    }
}

/// Map a notify event onto zero or more relative file events.
fn translate(project_root: &Path, excludes: &GlobSet, event: Event) -> Vec<FileEvent> {
    let relative = |paths: &[PathBuf]| -> Vec<String> {
        paths
            .iter()
            .filter_map(|p| p.strip_prefix(project_root).ok())
            .map(to_forward_slash)
            .filter(|p| !p.is_empty() && !excludes.is_match(p))
            .collect()
    };
    let single = |kind: FileEventKind, paths: &[PathBuf]| -> Vec<FileEvent> {
        let paths = relative(paths);
        if paths.is_empty() {
            Vec::new()
        } else {
            vec![FileEvent { kind, paths }]
        }
    };

    match event.kind {
        EventKind::Create(_) => single(FileEventKind::Add, &event.paths),
        EventKind::Remove(_) => single(FileEventKind::Remove, &event.paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            single(FileEventKind::Remove, &event.paths)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(FileEventKind::Add, &event.paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut out = single(FileEventKind::Remove, &event.paths[..1]);
            out.extend(single(FileEventKind::Add, &event.paths[1..]));
            out
        }
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            single(FileEventKind::Change, &event.paths)
        }
        EventKind::Access(_) => Vec::new(),
    }
}
