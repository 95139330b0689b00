use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{config_path, AppConfig};
use crate::provider::{LocalProvider, SandboxProvider};
use crate::runtime::LogLevel;
use crate::storage::models::{NewProject, ProjectPatch};
use crate::watcher::FileWatcher;

const DEFAULT_WATCH_EXCLUDES: [&str; 4] = ["node_modules", ".git", ".next", "dist"];

#[derive(Debug, Parser)]
#[command(name = "devcanvas", version, about = "Local projects and dev servers for the visual editor")]
pub struct Cli {
    /// Use this projects directory instead of the configured one.
    #[arg(long, global = true, value_name = "PATH")]
    projects_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List projects, most recently updated first.
    Projects {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Rename a project (moves its folder).
    Rename { id: String, name: String },
    Delete { id: String },
    /// Start the project's dev server and stream its output until Ctrl-C.
    Dev {
        id: String,
        /// Only show warnings and errors.
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    /// Print file events under the project folder until Ctrl-C.
    Watch {
        id: String,
        /// Subdirectory to watch, relative to the project folder.
        #[arg(long, default_value = "")]
        path: String,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },
    /// Show the effective configuration.
    Config {
        /// Write the effective configuration back to the config file.
        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load();
    if let Some(dir) = cli.projects_dir {
        config.projects_dir = dir;
    }
    let provider = Arc::new(LocalProvider::from_config(config.clone()));
    provider.initialize().await?;
    run_with(&provider, config, cli.command).await
}

/// Run one command, then stop every dev server it left behind, whether or not
/// the command succeeded.
async fn run_with(provider: &LocalProvider, config: AppConfig, command: Commands) -> Result<()> {
    let result = execute(provider, config, command).await;
    provider.registry().shutdown_all().await;
    result
}

async fn execute(provider: &LocalProvider, config: AppConfig, command: Commands) -> Result<()> {
    let store = provider.store().clone();
    match command {
        Commands::Projects { json } => {
            let projects = store.list_projects().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else if projects.is_empty() {
                println!("No projects in {}", store.root().display());
            } else {
                for project in projects {
                    println!(
                        "{}  {}  (updated {})",
                        project.id,
                        project.name,
                        project.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Create {
            name,
            description,
            tags,
        } => {
            let project = store
                .create_project(NewProject {
                    name,
                    description,
                    tags,
                })
                .await?;
            let dir = store
                .project_dir(&project.id)
                .await?
                .context("project folder vanished after creation")?;
            println!("{}  {}", project.id, dir.display());
        }
        Commands::Rename { id, name } => {
            let project = store
                .update_project(
                    &id,
                    ProjectPatch {
                        name: Some(name),
                        ..ProjectPatch::default()
                    },
                )
                .await?;
            println!("Renamed {} to {}", project.id, project.name);
        }
        Commands::Delete { id } => {
            if !store.delete_project(&id).await? {
                bail!("no project with id {id}");
            }
            println!("Deleted {id}");
        }
        Commands::Dev { id, quiet } => run_dev(provider, &id, quiet).await?,
        Commands::Watch { id, path, excludes } => {
            let dir = store
                .project_dir(&id)
                .await?
                .with_context(|| format!("no project with id {id}"))?;
            let excludes = if excludes.is_empty() {
                DEFAULT_WATCH_EXCLUDES.iter().map(|s| s.to_string()).collect()
            } else {
                excludes
            };
            let mut watcher = FileWatcher::new(dir);
            watcher.on_event(|event| match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!("failed to encode file event: {err}"),
            });
            watcher.start(&path, true, &excludes)?;
            tokio::signal::ctrl_c().await?;
            watcher.stop();
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                if let Some(path) = config_path() {
                    println!("Saved to {}", path.display());
                }
            }
        }
    }
    Ok(())
}

async fn run_dev(provider: &LocalProvider, project_id: &str, quiet: bool) -> Result<()> {
    let task = provider.dev_task(project_id).await?;
    // Subscription filters match one level exactly; quiet mode wants two.
    let _subscription = task.subscribe(None, move |entry| {
        if !quiet || entry.level != LogLevel::Info {
            println!("[{}] {}", entry.timestamp.format("%H:%M:%S"), entry.message);
        }
    });

    let session = provider.create_session(project_id).await?;
    println!("Preview: {}", session.preview_url);

    tokio::signal::ctrl_c().await?;
    println!("Stopping dev server...");
    provider.stop_project(project_id).await?;
    Ok(())
}
