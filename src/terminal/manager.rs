use crate::config::Config;
use crate::error::AppError;
use crate::limits;
use crate::process::ProcessManager;
use crate::terminal::buffer::OutputBuffer;
use crate::terminal::events::{forward, EventSender, TerminalEventKind};
use crate::terminal::registry::{TerminalHandle, TerminalRegistry};
use crate::utils::audit_logger::AuditLogger;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, instrument, warn};

pub const MSG_TERMINAL_NOT_FOUND_CREATE_FIRST: &str =
    "Terminal not found, please create one first using `create-terminal` tool.";
pub const MSG_TERMINAL_NOT_FOUND: &str = "Terminal not found.";
pub const MSG_KILL_RETRY: &str = "Failed to kill terminal process. Please try again later.";

#[derive(Debug, Serialize)]
pub struct ExecuteCommandResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct KillTerminalResult {
    pub success: bool,
    pub message: String,
}

/// Accumulated output for a terminal, read out-of-band from command dispatch.
#[derive(Debug, Serialize)]
pub struct OutputSnapshot {
    pub stdout: String,
    pub stderr: String,
}

/// Orchestrates terminal spawn, registration, event wiring, best-effort
/// resource attachment, command dispatch, and teardown.
///
/// Every termination path (explicit kill, voluntary exit, wait error, process
/// shutdown) funnels through [`deregister_once`], so a terminal's registry
/// pair is removed exactly once no matter how it dies.
#[derive(Debug)]
pub struct TerminalManager {
    config: Arc<Config>,
    registry: Arc<TerminalRegistry>,
    processes: ProcessManager,
    audit: AuditLogger,
    signal_handler_installed: AtomicBool,
}

impl TerminalManager {
    pub fn new(config: Arc<Config>) -> Self {
        let audit = AuditLogger::new(config.clone());
        Self {
            config,
            registry: Arc::new(TerminalRegistry::new()),
            processes: ProcessManager::new(),
            audit,
            signal_handler_installed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    /// Spawn a tenant-scoped interactive shell and return its terminal id.
    ///
    /// `working_dir` must be an absolute path to an existing directory; a
    /// change-directory directive is written into the shell before the id is
    /// returned, so subsequent commands run from there. Resource confinement
    /// (cgroup membership, rlimits) is attempted best-effort and never blocks
    /// creation.
    #[instrument(skip(self, subscriber), fields(tenant = %tenant))]
    pub async fn create_terminal(
        &self,
        tenant: &str,
        working_dir: &Path,
        subscriber: Option<EventSender>,
    ) -> Result<String, AppError> {
        if !working_dir.is_absolute() {
            return Err(AppError::InvalidInputArgument(format!(
                "Working directory must be absolute: {}",
                working_dir.display()
            )));
        }
        if !working_dir.is_dir() {
            return Err(AppError::InvalidInputArgument(format!(
                "Working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let mut cmd = build_shell_command(&self.config, tenant);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so the whole subtree can be signalled as a unit.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(shell = %self.config.default_shell, "Spawning terminal shell");
        let mut child = cmd.spawn().map_err(|e| {
            error!(tenant = %tenant, error = %e, "Failed to spawn terminal shell");
            AppError::SpawnFailure(e.to_string())
        })?;

        let (pid, stdin, stdout, stderr) =
            match prepare_spawned_shell(&mut child, working_dir).await {
                Ok(parts) => parts,
                Err(e) => {
                    error!(tenant = %tenant, error = %e.internal_detail(), "Terminal setup failed after spawn");
                    reap_failed_child(&mut child).await;
                    return Err(e);
                }
            };

        // Id allocation and insertion happen under one registry lock, so a
        // concurrent creation can neither draw the same id nor lose its entry.
        let buffer_max_bytes = self.config.buffer_max_bytes;
        let (terminal_id, handle, buffer) = self.registry.register_new(tenant, |id| {
            (
                Arc::new(TerminalHandle::new(tenant, id, pid, Some(stdin), Some(child))),
                Arc::new(OutputBuffer::new(buffer_max_bytes)),
            )
        });

        // Hardening, not a correctness precondition: failures are logged
        // inside and never propagate.
        limits::confine(&self.config, tenant, pid);

        spawn_output_reader(
            stdout,
            buffer.clone(),
            StreamKind::Stdout,
            subscriber.clone(),
            terminal_id.clone(),
        );
        spawn_output_reader(
            stderr,
            buffer.clone(),
            StreamKind::Stderr,
            subscriber.clone(),
            terminal_id.clone(),
        );
        spawn_exit_waiter(self.registry.clone(), handle, subscriber.clone());

        forward(&subscriber, &terminal_id, TerminalEventKind::Spawn);
        info!(tenant = %tenant, %terminal_id, %pid, "Terminal created");
        self.audit
            .log_operation(
                "create-terminal",
                tenant,
                &json!({ "terminal_id": terminal_id, "working_dir": working_dir, "pid": pid }),
            )
            .await;

        Ok(terminal_id)
    }

    /// Send a termination signal to the terminal's process group and remove
    /// its registry entries. An already-dead process counts as success; a
    /// rejected signal while the process is alive leaves the terminal
    /// registered and reports a retryable failure.
    #[instrument(skip(self), fields(tenant = %tenant, terminal_id = %terminal_id))]
    pub async fn kill_terminal(
        &self,
        tenant: &str,
        terminal_id: &str,
    ) -> Result<KillTerminalResult, AppError> {
        let Some(handle) = self.registry.lookup(tenant, terminal_id) else {
            return Ok(KillTerminalResult {
                success: false,
                message: MSG_TERMINAL_NOT_FOUND.to_string(),
            });
        };

        if let Err(e) = terminate_process_tree(handle.pid) {
            warn!(tenant = %tenant, %terminal_id, pid = %handle.pid, error = %e.internal_detail(), "Termination signal rejected");
            return Ok(KillTerminalResult {
                success: false,
                message: MSG_KILL_RETRY.to_string(),
            });
        }

        // End the input stream; dropping the handles destroys the pipes.
        handle.stdin.lock().await.take();
        deregister_once(&self.registry, &handle);

        info!(tenant = %tenant, %terminal_id, "Terminal killed");
        self.audit
            .log_operation("kill-terminal", tenant, &json!({ "terminal_id": terminal_id }))
            .await;

        Ok(KillTerminalResult {
            success: true,
            message: format!("Terminal {} killed.", terminal_id),
        })
    }

    /// Snapshot of the tenant's open terminal ids.
    pub fn list_terminal(&self, tenant: &str) -> Vec<String> {
        self.registry.list(tenant)
    }

    /// Write `"<command> <args>\n"` into the terminal's input and return
    /// immediately. Completion is observed out-of-band via the output buffer
    /// or forwarded events; this layer imposes no timeout.
    #[instrument(skip(self, args), fields(tenant = %tenant, terminal_id = %terminal_id, command = %command))]
    pub async fn execute_command(
        &self,
        tenant: &str,
        terminal_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ExecuteCommandResult, AppError> {
        if self.config.is_command_blocked(command) {
            warn!(tenant = %tenant, command = %command, "Command execution blocked");
            return Err(AppError::CommandBlocked(command.to_string()));
        }

        let Some(handle) = self.registry.lookup(tenant, terminal_id) else {
            return Ok(ExecuteCommandResult {
                success: false,
                message: MSG_TERMINAL_NOT_FOUND_CREATE_FIRST.to_string(),
            });
        };

        let line = if args.is_empty() {
            format!("{}\n", command)
        } else {
            format!("{} {}\n", command, args.join(" "))
        };

        let mut stdin_guard = handle.stdin.lock().await;
        let Some(stdin) = stdin_guard.as_mut() else {
            // Input stream already ended: the terminal is going away.
            return Ok(ExecuteCommandResult {
                success: false,
                message: MSG_TERMINAL_NOT_FOUND_CREATE_FIRST.to_string(),
            });
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::SpawnFailure(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| AppError::SpawnFailure(e.to_string()))?;
        drop(stdin_guard);

        self.audit
            .log_operation(
                "execute-command",
                tenant,
                &json!({ "terminal_id": terminal_id, "command": command }),
            )
            .await;

        Ok(ExecuteCommandResult {
            success: true,
            message: format!(
                "Command dispatched to terminal {}. Read its output buffer for results.",
                terminal_id
            ),
        })
    }

    /// One-shot command as the tenant: awaits completion and returns stdout on
    /// success or the process's stderr as the failure. Never touches the
    /// terminal registry.
    #[instrument(skip(self, args), fields(tenant = %tenant, command = %command))]
    pub async fn execute_command_standalone(
        &self,
        tenant: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, AppError> {
        if self.config.is_command_blocked(command) {
            warn!(tenant = %tenant, command = %command, "Command execution blocked");
            return Err(AppError::CommandBlocked(command.to_string()));
        }

        let mut cmd = build_standalone_command(tenant, command, args);
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.map_err(|e| {
            error!(tenant = %tenant, command = %command, error = %e, "Failed to spawn standalone command");
            AppError::SpawnFailure(e.to_string())
        })?;

        self.audit
            .log_operation(
                "execute-command-standalone",
                tenant,
                &json!({ "command": command, "exit_code": output.status.code() }),
            )
            .await;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(AppError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    /// Signal all of the tenant's processes whose command line matches the
    /// pattern. True once the sweep completes, matched or not.
    #[instrument(skip(self), fields(tenant = %tenant, pattern = %pattern))]
    pub async fn kill_process(&self, tenant: &str, pattern: &str) -> Result<bool, AppError> {
        let result = self.processes.kill_matching(tenant, pattern).await;
        if result.is_ok() {
            self.audit
                .log_operation("kill-process", tenant, &json!({ "pattern": pattern }))
                .await;
        }
        result
    }

    /// Current stdout/stderr text for a terminal, or None if it is not open.
    pub fn read_output(&self, tenant: &str, terminal_id: &str) -> Option<OutputSnapshot> {
        self.registry.buffer(tenant, terminal_id).map(|b| OutputSnapshot {
            stdout: b.stdout(),
            stderr: b.stderr(),
        })
    }

    /// Kill every live terminal across all tenants.
    pub async fn shutdown_all(&self) {
        for (tenant, terminal_id) in self.registry.snapshot_all() {
            if let Err(e) = self.kill_terminal(&tenant, &terminal_id).await {
                warn!(tenant = %tenant, %terminal_id, error = %e.internal_detail(), "Shutdown kill failed");
            }
        }
    }

    /// Install the single process-wide interrupt handler: one task, installed
    /// once, that tears down every live terminal on SIGINT/SIGTERM. Repeated
    /// calls are no-ops.
    pub fn spawn_signal_handler(self: &Arc<Self>) {
        if self.signal_handler_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            info!("Termination signal received, killing all live terminals");
            manager.shutdown_all().await;
        });
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Take the spawned shell's pid and pipes and write the change-directory
/// directive. Failures leave the child untouched for the caller to reap.
async fn prepare_spawned_shell(
    child: &mut Child,
    working_dir: &Path,
) -> Result<(u32, ChildStdin, ChildStdout, ChildStderr), AppError> {
    let pid = child
        .id()
        .ok_or_else(|| AppError::SpawnFailure("child exited before a pid was assigned".to_string()))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::SpawnFailure("child has no stdin pipe".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::SpawnFailure("child has no stdout pipe".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::SpawnFailure("child has no stderr pipe".to_string()))?;

    let cd_directive = format!("cd {}\n", shell_escape(&working_dir.to_string_lossy()));
    stdin
        .write_all(cd_directive.as_bytes())
        .await
        .map_err(|e| AppError::SpawnFailure(e.to_string()))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::SpawnFailure(e.to_string()))?;

    Ok((pid, stdin, stdout, stderr))
}

/// Kill and reap a child whose setup failed before registration, so the
/// error path leaves neither a live process nor a zombie behind.
async fn reap_failed_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill after failed terminal setup was rejected");
    }
    if let Err(e) = child.wait().await {
        debug!(error = %e, "Wait after failed terminal setup failed");
    }
}

/// Escape a string for safe use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Interactive shell for a tenant. When the server runs as root the shell is
/// started through `su -` so it carries the tenant's OS identity; otherwise it
/// runs as the current user (single-user deployments and tests).
fn build_shell_command(config: &Config, tenant: &str) -> Command {
    if running_as_root() {
        debug!(tenant = %tenant, "Spawning tenant shell via su");
        let mut cmd = Command::new("su");
        cmd.arg("-")
            .arg(tenant)
            .arg("-c")
            .arg(format!("exec {}", config.default_shell));
        cmd
    } else {
        debug!(tenant = %tenant, "Not root, spawning shell as current user");
        Command::new(&config.default_shell)
    }
}

/// One-shot command under the same run-as rule as the interactive shell.
fn build_standalone_command(tenant: &str, command: &str, args: &[String]) -> Command {
    if running_as_root() {
        let mut parts = vec![shell_escape(command)];
        parts.extend(args.iter().map(|a| shell_escape(a)));
        let mut cmd = Command::new("su");
        cmd.arg("-").arg(tenant).arg("-c").arg(parts.join(" "));
        cmd
    } else {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Pump one output stream: append each chunk to the buffer and forward a
/// tagged event. Ends at EOF, which arrives when the shell exits.
fn spawn_output_reader<R>(
    mut stream: R,
    buffer: Arc<OutputBuffer>,
    kind: StreamKind,
    subscriber: Option<EventSender>,
    terminal_id: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    let data = String::from_utf8_lossy(chunk).into_owned();
                    match kind {
                        StreamKind::Stdout => {
                            buffer.append_stdout(chunk);
                            forward(&subscriber, &terminal_id, TerminalEventKind::Stdout { data });
                        }
                        StreamKind::Stderr => {
                            buffer.append_stderr(chunk);
                            forward(&subscriber, &terminal_id, TerminalEventKind::Stderr { data });
                        }
                    }
                }
            }
        }
    });
}

/// Reap the shell and drive the voluntary-exit and wait-error termination
/// paths into the shared deregistration logic.
fn spawn_exit_waiter(
    registry: Arc<TerminalRegistry>,
    handle: Arc<TerminalHandle>,
    subscriber: Option<EventSender>,
) {
    tokio::spawn(async move {
        let child = handle.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        match child.wait().await {
            Ok(status) => {
                let code = status.code();
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                debug!(tenant = %handle.tenant, terminal_id = %handle.id, ?code, "Terminal shell exited");
                deregister_once(&registry, &handle);
                forward(&subscriber, &handle.id, TerminalEventKind::Exit { code, signal });
            }
            Err(e) => {
                warn!(tenant = %handle.tenant, terminal_id = %handle.id, error = %e, "Failed to wait for terminal shell");
                if let Err(kill_err) = terminate_process_tree(handle.pid) {
                    debug!(pid = %handle.pid, error = %kill_err.internal_detail(), "Best-effort kill after wait error failed");
                }
                deregister_once(&registry, &handle);
                forward(
                    &subscriber,
                    &handle.id,
                    TerminalEventKind::Error { message: e.to_string() },
                );
            }
        }
    });
}

/// Remove the terminal's registry pair exactly once, however it died.
/// Returns true for the termination path that actually performed the removal.
fn deregister_once(registry: &TerminalRegistry, handle: &TerminalHandle) -> bool {
    if !handle.claim_teardown() {
        return false;
    }
    registry.unregister(&handle.tenant, &handle.id);
    true
}

/// Terminate a terminal's whole process tree.
///
/// POSIX: SIGTERM to the process group, falling back to the primary pid when
/// the group signal is rejected. An already-gone process (ESRCH) counts as
/// success. Windows hosts go through taskkill's tree kill.
#[cfg(unix)]
fn terminate_process_tree(pid: u32) -> Result<(), AppError> {
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    warn!(%pid, error = %err, "Process-group signal failed, falling back to primary pid");

    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(AppError::SignalFailure(err.to_string()))
}

#[cfg(not(unix))]
fn terminate_process_tree(pid: u32) -> Result<(), AppError> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .map_err(|e| AppError::SignalFailure(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::SignalFailure(format!(
            "taskkill exited with {:?}",
            status.code()
        )))
    }
}
