//! Sandbox provider surface.
//!
//! Call sites talk to a [`SandboxProvider`] so that the local implementation here
//! and a remote hosted one are interchangeable. [`LocalProvider`] runs the dev
//! server on this machine through the [`RuntimeRegistry`] and serves files from
//! the project's `files/` tree.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::{Result, WorkspaceError};
use crate::runtime::{
    LogEntry, LogLevel, LogSubscription, ProcessSupervisor, RuntimeRegistry, SupervisorPhase, SupervisorStatus,
};
use crate::storage::access;
use crate::storage::models::ProjectPatch;
use crate::storage::{DocumentStore, FILES_DIR};
use crate::util::{join_within, to_forward_slash};

/// A running dev server, as handed to the editor.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub sandbox_id: String,
    pub port: u16,
    pub preview_url: String,
    pub project_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command was terminated by a signal.
    pub exit_code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative to the project's `files/` directory, `/`-separated.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Handle on a project's dev-server task.
#[derive(Clone)]
pub struct DevTask {
    supervisor: ProcessSupervisor,
}

impl DevTask {
    pub async fn run(&self) -> Result<()> {
        self.supervisor.ensure_started().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.supervisor.restart().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    pub fn logs(&self, filter: Option<LogLevel>) -> Vec<LogEntry> {
        self.supervisor.logs().get_logs(filter)
    }

    pub fn subscribe<F>(&self, filter: Option<LogLevel>, callback: F) -> LogSubscription
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.supervisor.logs().subscribe(filter, callback)
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Make sure the project's dev server is up and describe how to reach it.
    async fn create_session(&self, project_id: &str) -> Result<Session>;

    async fn dev_task(&self, project_id: &str) -> Result<DevTask>;

    async fn run_command(&self, project_id: &str, command: &str) -> Result<CommandOutput>;

    async fn list_files(&self, project_id: &str, dir: &str) -> Result<Vec<FileEntry>>;

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<Vec<u8>>>;

    async fn write_file(&self, project_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool>;

    async fn rename_file(&self, project_id: &str, from: &str, to: &str) -> Result<()>;

    /// Stop the dev server and release its supervisor.
    async fn stop_project(&self, project_id: &str) -> Result<()>;

    /// Stop the dev server but keep its supervisor (and log history) around.
    async fn pause_project(&self, project_id: &str) -> Result<()>;
}

pub struct LocalProvider {
    config: AppConfig,
    store: Arc<DocumentStore>,
    registry: Arc<RuntimeRegistry>,
}

impl LocalProvider {
    pub fn new(config: AppConfig, store: Arc<DocumentStore>, registry: Arc<RuntimeRegistry>) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn from_config(config: AppConfig) -> Self {
        let store = Arc::new(DocumentStore::from_config(&config));
        Self::new(config, store, Arc::new(RuntimeRegistry::new()))
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    async fn files_root(&self, project_id: &str) -> Result<PathBuf> {
        let dir = self
            .store
            .project_dir(project_id)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("project", project_id))?;
        Ok(dir.join(FILES_DIR))
    }

    async fn resolve(&self, project_id: &str, relative: &str) -> Result<PathBuf> {
        let root = self.files_root(project_id).await?;
        join_within(&root, relative)
            .ok_or_else(|| WorkspaceError::InvalidPath(format!("{relative} is outside the project files")))
    }

    /// The project's supervisor. An idle supervisor left over from before a
    /// project rename is replaced so the next start runs in the current folder.
    /// One that still owns a process is kept; a stop in flight is awaited first.
    async fn supervisor(&self, project_id: &str) -> Result<ProcessSupervisor> {
        let root = self.files_root(project_id).await?;
        while let Some(existing) = self.registry.get(project_id) {
            if existing.project_path() == root {
                return Ok(existing);
            }
            match existing.phase() {
                SupervisorPhase::Idle => {
                    self.registry.remove(project_id);
                    break;
                }
                SupervisorPhase::Stopping => existing.stop().await?,
                SupervisorPhase::Starting | SupervisorPhase::Running => return Ok(existing),
            }
        }
        Ok(self
            .registry
            .get_or_create(project_id, root, self.config.supervisor_options()))
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn initialize(&self) -> Result<()> {
        self.store.ensure_root().await?;
        let projects = self.store.rebuild_index().await?;
        tracing::info!(root = %self.store.root().display(), projects, "local provider ready");
        Ok(())
    }

    async fn create_session(&self, project_id: &str) -> Result<Session> {
        let supervisor = self.supervisor(project_id).await?;
        supervisor.ensure_started().await?;
        let port = supervisor
            .port()
            .ok_or_else(|| WorkspaceError::Spawn("dev server exited before it was ready".to_string()))?;
        let preview_url = format!("http://localhost:{port}");

        self.store
            .update_project(
                project_id,
                ProjectPatch {
                    sandbox_id: Some(project_id.to_string()),
                    sandbox_url: Some(preview_url.clone()),
                    ..ProjectPatch::default()
                },
            )
            .await?;

        Ok(Session {
            sandbox_id: project_id.to_string(),
            port,
            preview_url,
            project_path: supervisor.project_path().to_path_buf(),
        })
    }

    async fn dev_task(&self, project_id: &str) -> Result<DevTask> {
        Ok(DevTask {
            supervisor: self.supervisor(project_id).await?,
        })
    }

    async fn run_command(&self, project_id: &str, command: &str) -> Result<CommandOutput> {
        let root = self.files_root(project_id).await?;
        access::ensure_access(&root, access::AccessRequest::write_dir()).await?;

        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd.exe");
            cmd.arg("/C").arg(command);
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
            cmd
        };
        cmd.current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(project_id, command, "running command");
        let output = cmd
            .output()
            .await
            .map_err(|e| WorkspaceError::Spawn(format!("failed to run `{command}`: {e}")))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn list_files(&self, project_id: &str, dir: &str) -> Result<Vec<FileEntry>> {
        let root = self.files_root(project_id).await?;
        let target = self.resolve(project_id, dir).await?;
        let mut entries: Vec<FileEntry> = access::read_dir(&target)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let relative = entry.path.strip_prefix(&root).ok()?;
                Some(FileEntry {
                    path: to_forward_slash(relative),
                    is_dir: entry.is_dir,
                    size: entry.len,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(project_id, path).await?;
        Ok(access::read_optional(&target).await?)
    }

    async fn write_file(&self, project_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let target = self.resolve(project_id, path).await?;
        access::write_atomic(&target, contents).await?;
        Ok(())
    }

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let target = self.resolve(project_id, path).await?;
        if target == self.files_root(project_id).await? {
            return Err(WorkspaceError::InvalidPath("refusing to delete the project files root".to_string()));
        }
        let is_dir = tokio::fs::metadata(&target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let removed = if is_dir {
            access::remove_dir_all(&target).await?
        } else {
            access::remove_file(&target).await?
        };
        Ok(removed)
    }

    async fn rename_file(&self, project_id: &str, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(project_id, from).await?;
        let target = self.resolve(project_id, to).await?;
        if !access::exists(&source).await {
            return Err(WorkspaceError::not_found("file", from));
        }
        if let Some(parent) = target.parent() {
            access::create_dir_all(parent).await?;
        }
        access::rename(&source, &target).await?;
        Ok(())
    }

    async fn stop_project(&self, project_id: &str) -> Result<()> {
        self.registry.teardown(project_id).await
    }

    async fn pause_project(&self, project_id: &str) -> Result<()> {
        match self.registry.get(project_id) {
            Some(supervisor) => supervisor.stop().await,
            None => Ok(()),
        }
    }
}
