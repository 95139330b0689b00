use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::runtime::supervisor::{ProcessSupervisor, SupervisorOptions};

/// Holds at most one supervisor per project id for the lifetime of the host
/// process. Entries are only dropped by an explicit `remove`/`teardown`, so a
/// dev server survives UI reconnects.
///
/// Hosts create one registry at startup and pass it around; tests build their own.
#[derive(Default)]
pub struct RuntimeRegistry {
    supervisors: Mutex<HashMap<String, ProcessSupervisor>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the supervisor for `project_id`, creating it (idle) on first access.
    /// `project_path` and `options` are only used when a new supervisor is built.
    pub fn get_or_create(
        &self,
        project_id: &str,
        project_path: impl Into<PathBuf>,
        options: SupervisorOptions,
    ) -> ProcessSupervisor {
        let mut map = self.map();
        if let Some(existing) = map.get(project_id) {
            return existing.clone();
        }
        let supervisor = ProcessSupervisor::new(project_id, project_path, options);
        tracing::debug!(project_id, "registered dev server supervisor");
        map.insert(project_id.to_string(), supervisor.clone());
        supervisor
    }

    pub fn get(&self, project_id: &str) -> Option<ProcessSupervisor> {
        self.map().get(project_id).cloned()
    }

    /// Drop the registry entry without touching the process.
    pub fn remove(&self, project_id: &str) -> Option<ProcessSupervisor> {
        self.map().remove(project_id)
    }

    /// Stop the project's dev server, then forget its supervisor.
    pub async fn teardown(&self, project_id: &str) -> Result<()> {
        let Some(supervisor) = self.get(project_id) else {
            return Ok(());
        };
        supervisor.stop().await?;
        self.remove(project_id);
        Ok(())
    }

    /// Stop every dev server. Used when the host process shuts down.
    pub async fn shutdown_all(&self) {
        let supervisors: Vec<ProcessSupervisor> = self.map().values().cloned().collect();
        for supervisor in supervisors {
            if let Err(err) = supervisor.stop().await {
                tracing::warn!(sandbox = supervisor.sandbox_id(), "failed to stop dev server: {err}");
            }
        }
        self.map().clear();
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, ProcessSupervisor>> {
        self.supervisors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
