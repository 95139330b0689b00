use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, WorkspaceError};
use crate::runtime::logs::{LogRingBuffer, OutputStream, DEFAULT_LOG_CAPACITY};
use crate::runtime::port::find_available_port;
use crate::storage::access::{self, AccessRequest};
use crate::util::strip_ansi;

/// How to launch and stop the dev server of one project.
#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the parent's; `PORT` is always injected.
    pub env: Vec<(String, String)>,
    pub preferred_port: u16,
    pub max_port_attempts: u16,
    pub log_capacity: usize,
    /// Grace period between the terminate signal and the forced kill.
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        let npm = if cfg!(target_os = "windows") { "npm.cmd" } else { "npm" };
        Self {
            program: npm.to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            env: Vec::new(),
            preferred_port: 3000,
            max_port_attempts: 10,
            log_capacity: DEFAULT_LOG_CAPACITY,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl SupervisorOptions {
    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub sandbox_id: String,
    pub project_path: PathBuf,
    pub phase: SupervisorPhase,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

type Flight = Shared<BoxFuture<'static, std::result::Result<(), Arc<WorkspaceError>>>>;

enum Signal {
    Terminate,
    Kill,
}

struct ChildHandle {
    pid: Option<u32>,
    generation: u64,
    signals: mpsc::UnboundedSender<Signal>,
    exited: watch::Receiver<bool>,
}

struct SupervisorState {
    phase: SupervisorPhase,
    port: Option<u16>,
    child: Option<ChildHandle>,
    start_flight: Option<Flight>,
    stop_flight: Option<Flight>,
    generation: u64,
}

struct SupervisorInner {
    sandbox_id: String,
    project_path: PathBuf,
    options: SupervisorOptions,
    logs: LogRingBuffer,
    state: Mutex<SupervisorState>,
}

/// Owns the lifecycle of one project's dev-server process.
///
/// `Idle -> Starting -> Running -> Stopping -> Idle`. Concurrent `ensure_started`
/// calls share one in-flight start and concurrent `stop` calls share one in-flight
/// stop, so at most one child process exists per supervisor. Crashes are reported
/// only through the log buffer; the supervisor falls back to `Idle` and the next
/// `ensure_started` respawns.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

enum Next {
    Join(Flight),
    WaitFor(Flight),
}

impl ProcessSupervisor {
    pub fn new(sandbox_id: impl Into<String>, project_path: impl Into<PathBuf>, options: SupervisorOptions) -> Self {
        let logs = LogRingBuffer::new(options.log_capacity);
        Self {
            inner: Arc::new(SupervisorInner {
                sandbox_id: sandbox_id.into(),
                project_path: project_path.into(),
                options,
                logs,
                state: Mutex::new(SupervisorState {
                    phase: SupervisorPhase::Idle,
                    port: None,
                    child: None,
                    start_flight: None,
                    stop_flight: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.inner.sandbox_id
    }

    pub fn project_path(&self) -> &Path {
        &self.inner.project_path
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn logs(&self) -> &LogRingBuffer {
        &self.inner.logs
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.state().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == SupervisorPhase::Running
    }

    pub fn port(&self) -> Option<u16> {
        self.state().port
    }

    pub fn preview_url(&self) -> Option<String> {
        self.port().map(|port| format!("http://localhost:{port}"))
    }

    /// Number of child processes spawned over this supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.state().generation
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.state();
        SupervisorStatus {
            sandbox_id: self.inner.sandbox_id.clone(),
            project_path: self.inner.project_path.clone(),
            phase: state.phase,
            port: state.port,
            pid: state.child.as_ref().and_then(|c| c.pid),
        }
    }

    /// Start the dev server unless it is already running. Callers arriving while a
    /// start is in flight await that same start.
    pub async fn ensure_started(&self) -> Result<()> {
        loop {
            let next = {
                let mut state = self.state();
                if state.phase == SupervisorPhase::Running {
                    return Ok(());
                }
                if let Some(flight) = &state.start_flight {
                    Next::Join(flight.clone())
                } else if let Some(flight) = &state.stop_flight {
                    Next::WaitFor(flight.clone())
                } else {
                    let flight = self.clone().run_start().boxed().shared();
                    state.start_flight = Some(flight.clone());
                    state.phase = SupervisorPhase::Starting;
                    Next::Join(flight)
                }
            };
            match next {
                Next::Join(flight) => return flight.await.map_err(WorkspaceError::Shared),
                Next::WaitFor(flight) => {
                    let _ = flight.await;
                }
            }
        }
    }

    /// Stop the dev server: terminate, wait up to the stop timeout, then kill.
    /// Resolves once the process has exited. A no-op when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        loop {
            let next = {
                let mut state = self.state();
                if let Some(flight) = &state.stop_flight {
                    Next::Join(flight.clone())
                } else if let Some(flight) = &state.start_flight {
                    Next::WaitFor(flight.clone())
                } else if state.child.is_none() {
                    return Ok(());
                } else {
                    let flight = self.clone().run_stop().boxed().shared();
                    state.stop_flight = Some(flight.clone());
                    state.phase = SupervisorPhase::Stopping;
                    Next::Join(flight)
                }
            };
            match next {
                Next::Join(flight) => return flight.await.map_err(WorkspaceError::Shared),
                Next::WaitFor(flight) => {
                    let _ = flight.await;
                }
            }
        }
    }

    pub async fn restart(&self) -> Result<()> {
        self.inner.logs.info("Restarting dev server");
        self.stop().await?;
        self.ensure_started().await
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_start(self) -> std::result::Result<(), Arc<WorkspaceError>> {
        let spawned = self.spawn_dev_server().await;

        let mut state = self.state();
        state.start_flight = None;
        let (port, mut child) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                state.phase = SupervisorPhase::Idle;
                drop(state);
                tracing::error!(sandbox = %self.inner.sandbox_id, "dev server failed to start: {err}");
                self.inner.logs.error(err.to_string());
                return Err(Arc::new(err));
            }
        };

        state.generation += 1;
        let generation = state.generation;
        let pid = child.id();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        state.child = Some(ChildHandle {
            pid,
            generation,
            signals: signal_tx,
            exited: exited_rx,
        });
        state.port = Some(port);
        state.phase = SupervisorPhase::Running;
        drop(state);

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputStream::Stdout, self.inner.logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputStream::Stderr, self.inner.logs.clone());
        }

        tracing::info!(sandbox = %self.inner.sandbox_id, port, ?pid, "dev server started");
        self.inner
            .logs
            .info(format!("Dev server running at http://localhost:{port}"));
        self.spawn_exit_watcher(child, generation, signal_rx, exited_tx);
        Ok(())
    }

    async fn spawn_dev_server(&self) -> Result<(u16, Child)> {
        let options = &self.inner.options;
        let project_path = &self.inner.project_path;

        // The project folder may have been deleted since the last run.
        access::ensure_access(project_path, AccessRequest::write_dir()).await?;

        let port = find_available_port(options.preferred_port, options.max_port_attempts).await;
        self.inner.logs.info(format!(
            "Starting `{}` in {} on port {port}",
            options.command_line(),
            project_path.display()
        ));

        let mut cmd = tokio::process::Command::new(&options.program);
        cmd.args(&options.args)
            .current_dir(project_path)
            .envs(options.env.iter().map(|(k, v)| (k, v)))
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so the terminate signal reaches the whole tree
        // (package managers fork the actual server).
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(target_os = "windows")]
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW

        let child = cmd
            .spawn()
            .map_err(|e| WorkspaceError::Spawn(format!("`{}`: {e}", options.command_line())))?;
        Ok((port, child))
    }

    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        exited: watch::Sender<bool>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(signal) = signals.recv() => deliver_signal(&mut child, signal),
                }
            };
            supervisor.on_exit(generation, status);
            let _ = exited.send(true);
        });
    }

    fn on_exit(&self, generation: u64, status: std::io::Result<ExitStatus>) {
        {
            let mut state = self.state();
            if state.child.as_ref().map(|c| c.generation) != Some(generation) {
                return;
            }
            state.child = None;
            state.port = None;
            state.phase = SupervisorPhase::Idle;
        }

        let detail = match status {
            Ok(status) => match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            },
            Err(err) => format!("wait failed: {err}"),
        };
        tracing::warn!(sandbox = %self.inner.sandbox_id, "dev server exited ({detail})");
        self.inner
            .logs
            .warn(format!("Dev server process exited ({detail})"));
    }

    async fn run_stop(self) -> std::result::Result<(), Arc<WorkspaceError>> {
        let handle = {
            let state = self.state();
            state
                .child
                .as_ref()
                .map(|c| (c.signals.clone(), c.exited.clone(), c.pid))
        };

        if let Some((signals, mut exited, pid)) = handle {
            tracing::info!(sandbox = %self.inner.sandbox_id, ?pid, "stopping dev server");
            self.inner.logs.info("Stopping dev server");
            let _ = signals.send(Signal::Terminate);

            let timeout = self.inner.options.stop_timeout;
            let graceful = tokio::time::timeout(timeout, wait_exited(&mut exited))
                .await
                .is_ok();
            if !graceful {
                tracing::warn!(sandbox = %self.inner.sandbox_id, "dev server ignored terminate; killing");
                self.inner.logs.warn(format!(
                    "Dev server did not exit within {}ms; forcing shutdown",
                    timeout.as_millis()
                ));
                let _ = signals.send(Signal::Kill);
                wait_exited(&mut exited).await;
            }
        }

        {
            let mut state = self.state();
            state.stop_flight = None;
            if state.child.is_none() {
                state.phase = SupervisorPhase::Idle;
            }
        }
        self.inner.logs.info("Dev server stopped");
        Ok(())
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

fn deliver_signal(child: &mut Child, signal: Signal) {
    match signal {
        Signal::Terminate => {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    let pid = pid as i32;
                    // Signal the process group first, then the process itself.
                    if unsafe { libc::kill(-pid, libc::SIGTERM) } != 0 {
                        unsafe { libc::kill(pid, libc::SIGTERM) };
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
        Signal::Kill => {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
                }
            }
            let _ = child.start_kill();
        }
    }
}

fn spawn_line_reader<R>(reader: R, stream: OutputStream, logs: LogRingBuffer)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Read raw bytes: a line that is not UTF-8 must not end the reader, or the
        // pipe closes and the child dies on its next write.
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!("dev server output stream closed: {err}");
                    break;
                }
            }
            let raw_line = String::from_utf8_lossy(&buf);
            let line = strip_ansi(raw_line.trim_end_matches(['\r', '\n']));
            if line.trim().is_empty() {
                continue;
            }
            logs.append(stream.level_for(&line), line);
        }
    });
}
