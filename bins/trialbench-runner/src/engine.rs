/// Isolated Runner - Build Tool Execution
///
/// **Core Responsibility:**
/// Run the configured build tool once inside a materialized workspace and
/// capture raw outputs.
///
/// **Critical Architectural Boundary:**
/// - Runner knows HOW to execute (process spawning, timeouts, kill)
/// - Runner does NOT classify; the evaluator judges the raw output
///
/// **Isolation Guarantees:**
/// - Working directory is the workspace root
/// - Tool configuration/cache root points at the workspace's private root
/// - The tool runs in its own process group; timeout and interrupt kill the
///   whole group so no grandchild survives to hold locks
/// - Captured output is bounded per stream

use crate::config::HarnessConfigManager;
use crate::evaluator::{self, ToolExecutionOutput};
use crate::materializer::Workspace;
use chrono::Utc;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};
use trialbench_common::config::ToolConfig;

const READ_CHUNK: usize = 8 * 1024;

/// Bytes kept from one output stream, plus how many were produced in total
#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    total: usize,
}

impl CapturedStream {
    fn into_text(self, limit: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.total > limit {
            text.push_str(&format!("\n[... output truncated after {} bytes]", limit));
        }
        text
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes. The pipe keeps being
/// drained past the limit so the child never blocks on a full buffer.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let Some(mut reader) = reader else {
        return captured;
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                captured.total += n;
            }
            Err(e) => {
                debug!(error = %e, "Output pipe closed with error");
                break;
            }
        }
    }
    captured
}

/// SIGKILL every process in the group led by `pid`. The leader may already
/// be reaped; only the group id is signalled.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pgid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// SIGKILL the process group led by `pid`, then the leader itself.
/// Only valid while the leader is still unreaped.
pub fn hard_kill_process_group(pid: u32) {
    kill_process_group(pid);
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Resolves once shutdown is requested; never if the sender goes away
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Ending {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Interrupted,
}

fn describe_status(status: &ExitStatus) -> Option<String> {
    if status.code().is_some() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return Some(format!("build tool terminated by signal {}", signal));
        }
    }
    Some("build tool terminated without an exit code".to_string())
}

/// Executes the build tool in one workspace at a time
#[derive(Debug, Clone)]
pub struct IsolatedRunner {
    tool: ToolConfig,
    output_limit: usize,
    kill_grace: Duration,
}

impl IsolatedRunner {
    pub fn new(config: &HarnessConfigManager) -> Self {
        Self {
            tool: config.config().tool.clone(),
            output_limit: config.config().output_limit_bytes,
            kill_grace: config.kill_grace(),
        }
    }

    /// Substitute workspace placeholders in an argument or env value
    fn render(template: &str, workspace: &Workspace) -> String {
        template
            .replace("{project}", &workspace.root.to_string_lossy())
            .replace("{config_root}", &workspace.config_root.to_string_lossy())
            .replace("{report_dir}", &workspace.report_dir.to_string_lossy())
    }

    fn command(&self, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&self.tool.program);
        cmd.args(self.tool.args.iter().map(|arg| Self::render(arg, workspace)))
            .envs(
                self.tool
                    .env
                    .iter()
                    .map(|(key, value)| (key, Self::render(value, workspace))),
            )
            .current_dir(&workspace.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Kill the tool's whole tree and reap the leader
    async fn kill_tree(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            hard_kill_process_group(pid);
        }
        let _ = child.start_kill();
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!(pid = ?pid, "Build tool did not exit after SIGKILL");
        }
    }

    /// Run the tool once, enforcing the deadline and honouring shutdown.
    ///
    /// Never fails: launch and wait errors are reported in the output so the
    /// evaluator classifies them as infrastructure errors.
    #[tracing::instrument(
        skip(self, workspace, shutdown),
        fields(task_id = %workspace.task_id, variant_id = %workspace.variant_id, timeout_secs = timeout.as_secs())
    )]
    pub async fn run(
        &self,
        workspace: &Workspace,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ToolExecutionOutput {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = match self.command(workspace).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.tool.program, error = %e, "Failed to launch build tool");
                return ToolExecutionOutput::launch_failure(
                    format!("{}: {}", self.tool.program, e),
                    started_at,
                    start.elapsed().as_millis() as u64,
                );
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, "Build tool started");

        let stdout_task = tokio::spawn(capture(child.stdout.take(), self.output_limit));
        let stderr_task = tokio::spawn(capture(child.stderr.take(), self.output_limit));

        let ending = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ending::Exited(status),
                Err(e) => Ending::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = shutdown_requested(shutdown) => Ending::Interrupted,
        };

        match &ending {
            Ending::Exited(_) => {
                // The leader is reaped; stragglers left in its group still go
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
            }
            Ending::TimedOut => {
                warn!(pid = ?pid, "Build tool exceeded its deadline, killing process group");
                self.kill_tree(&mut child, pid).await;
            }
            Ending::Interrupted => {
                warn!(pid = ?pid, "Shutdown requested, killing process group");
                self.kill_tree(&mut child, pid).await;
            }
            Ending::WaitFailed(e) => {
                warn!(pid = ?pid, error = %e, "Failed to wait for build tool");
                self.kill_tree(&mut child, pid).await;
            }
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let stdout = self.collect(stdout_task).await;
        let stderr = self.collect(stderr_task).await;

        let mut output = ToolExecutionOutput {
            stdout,
            stderr,
            exit_code: None,
            elapsed_ms,
            started_at,
            timed_out: false,
            interrupted: false,
            launch_error: None,
            report: None,
            termination: None,
        };

        match ending {
            Ending::Exited(status) => {
                output.exit_code = status.code();
                output.termination = describe_status(&status);
                output.report = match evaluator::read_report_dir(&workspace.report_dir) {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(dir = %workspace.report_dir.display(), error = %e, "Failed to read test reports");
                        None
                    }
                };
            }
            Ending::WaitFailed(e) => output.launch_error = Some(format!("wait failed: {}", e)),
            Ending::TimedOut => output.timed_out = true,
            Ending::Interrupted => output.interrupted = true,
        }

        debug!(
            exit_code = ?output.exit_code,
            elapsed_ms = output.elapsed_ms,
            timed_out = output.timed_out,
            has_report = output.report.is_some(),
            "Build tool finished"
        );
        output
    }

    /// Join a reader task; a pipe held open by an escaped process is abandoned
    /// after the grace period.
    async fn collect(&self, task: tokio::task::JoinHandle<CapturedStream>) -> String {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.kill_grace, task).await {
            Ok(Ok(captured)) => captured.into_text(self.output_limit),
            Ok(Err(e)) => {
                warn!(error = %e, "Output reader task failed");
                String::new()
            }
            Err(_) => {
                abort.abort();
                warn!("Output pipe still open after grace period, abandoning capture");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_truncates_but_drains() {
        let data = vec![b'x'; 100_000];
        let captured = capture(Some(&data[..]), 1024).await;
        assert_eq!(captured.bytes.len(), 1024);
        assert_eq!(captured.total, 100_000);

        let text = captured.into_text(1024);
        assert!(text.ends_with("\n[... output truncated after 1024 bytes]"));
    }

    #[tokio::test]
    async fn test_capture_under_limit_is_verbatim() {
        let captured = capture(Some(&b"BUILD SUCCESSFUL\n"[..]), 1024).await;
        assert_eq!(captured.into_text(1024), "BUILD SUCCESSFUL\n");
    }

    #[tokio::test]
    async fn test_capture_without_pipe() {
        let captured = capture(None::<&[u8]>, 16).await;
        assert_eq!(captured.into_text(16), "");
    }

    #[test]
    fn test_render_placeholders() {
        let ws = Workspace {
            task_id: "000001".to_string(),
            variant_id: "A".to_string(),
            root: "/work/000001_A_1-deadbeef".into(),
            config_root: "/work/000001_A_1-deadbeef.home".into(),
            report_dir: "/work/000001_A_1-deadbeef/build/test-results/test".into(),
        };
        assert_eq!(
            IsolatedRunner::render("{config_root}/project-cache", &ws),
            "/work/000001_A_1-deadbeef.home/project-cache"
        );
        assert_eq!(IsolatedRunner::render("--project-dir={project}", &ws), "--project-dir=/work/000001_A_1-deadbeef");
        assert_eq!(IsolatedRunner::render("test", &ws), "test");
    }

    #[cfg(unix)]
    #[test]
    fn test_group_kill_spares_a_bare_pid() {
        // Shares the test's process group, so its pid leads no group of its own
        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        kill_process_group(bystander.id());
        std::thread::sleep(Duration::from_millis(100));
        assert!(bystander.try_wait().unwrap().is_none(), "bystander was killed");

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }
}
