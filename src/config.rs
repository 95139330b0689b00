use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WorkspaceError};
use crate::runtime::SupervisorOptions;
use crate::util::expand_tilde;

pub const CONFIG_VERSION: u32 = 1;
const PROJECTS_DIR_ENV: &str = "DEVCANVAS_PROJECTS_DIR";

/// Settings shared by the CLI and any embedding host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub version: u32,
    pub projects_dir: PathBuf,
    pub dev_command: Vec<String>,
    pub preferred_port: u16,
    pub max_port_attempts: u16,
    pub log_capacity: usize,
    pub stop_timeout_secs: u64,
    pub asset_size_hint_mb: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let projects_dir = dirs::home_dir()
            .map(|h| h.join("DevCanvas Projects"))
            .unwrap_or_else(|| PathBuf::from("DevCanvas Projects"));
        Self {
            version: CONFIG_VERSION,
            projects_dir,
            dev_command: default_dev_command(),
            preferred_port: 3000,
            max_port_attempts: 10,
            log_capacity: 200,
            stop_timeout_secs: 5,
            asset_size_hint_mb: 200,
        }
    }
}

/// `npm run dev`; Windows needs the `.cmd` shim to spawn npm without a shell.
fn default_dev_command() -> Vec<String> {
    let npm = if cfg!(target_os = "windows") { "npm.cmd" } else { "npm" };
    vec![npm.to_string(), "run".to_string(), "dev".to_string()]
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".devcanvas").join("config.json"))
}

impl AppConfig {
    /// Load `~/.devcanvas/config.json`, falling back to defaults when it is absent
    /// or unreadable, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = config_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| match serde_json::from_str::<AppConfig>(&content) {
                Ok(config) => Some(config),
                Err(err) => {
                    tracing::warn!("ignoring malformed config file: {err}");
                    None
                }
            })
            .unwrap_or_default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(PROJECTS_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.projects_dir = PathBuf::from(dir);
            }
        }
        // Expand tilde so paths are always absolute
        self.projects_dir = expand_tilde(&self.projects_dir.to_string_lossy());
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()
            .ok_or_else(|| WorkspaceError::Custom("Cannot find home directory".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn asset_size_hint_bytes(&self) -> u64 {
        self.asset_size_hint_mb * 1024 * 1024
    }

    /// Supervisor options derived from these settings.
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let mut command = self.dev_command.clone();
        let program = if command.is_empty() {
            default_dev_command().remove(0)
        } else {
            command.remove(0)
        };
        SupervisorOptions {
            program,
            args: command,
            env: Vec::new(),
            preferred_port: self.preferred_port,
            max_port_attempts: self.max_port_attempts,
            log_capacity: self.log_capacity,
            stop_timeout: self.stop_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "projectsDir": "/srv/projects", "preferredPort": 4100 }"#)
                .expect("partial config should parse");
        assert_eq!(config.projects_dir, PathBuf::from("/srv/projects"));
        assert_eq!(config.preferred_port, 4100);
        assert_eq!(config.log_capacity, 200);
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn supervisor_options_split_program_and_args() {
        let config = AppConfig {
            dev_command: vec!["bun".into(), "run".into(), "dev".into()],
            ..AppConfig::default()
        };
        let options = config.supervisor_options();
        assert_eq!(options.program, "bun");
        assert_eq!(options.args, vec!["run".to_string(), "dev".to_string()]);
        assert_eq!(options.preferred_port, 3000);
    }
}
