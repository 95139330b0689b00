pub mod cli;
pub mod config;
pub mod error;
pub mod provider;
pub mod runtime;
pub mod storage;
pub mod util;
pub mod watcher;

use clap::Parser;

pub use config::AppConfig;
pub use error::{Result, WorkspaceError};
pub use provider::{LocalProvider, SandboxProvider};
pub use runtime::{ProcessSupervisor, RuntimeRegistry};
pub use storage::DocumentStore;
pub use watcher::FileWatcher;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("DEVCANVAS_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::dispatch(cli))
}
