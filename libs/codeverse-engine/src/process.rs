/// Process-Backed Runner
///
/// **Lifecycle per request:**
/// WRITE_SOURCE → [COMPILE] → RUN → COLLECT → CLEANUP → RESULT
///
/// - Source is staged in a scratch directory unique to the execution
/// - Compiled languages get a bounded compile phase; a failure skips RUN
/// - RUN races the process against a wall-clock deadline; the loser is
///   cancelled (deadline dropped, or process group killed)
/// - A third task delivers stdin once, timed by the configured `InputTiming`
/// - The scratch directory is removed on every path before returning
///
/// Only the container backend enforces memory or network limits; this one
/// relies on wall-clock bounds alone.

use crate::error::EngineError;
use crate::input::{input_timing, stdin_payload, InputTiming};
use crate::output::CappedOutput;
use crate::registry::{self, CommandSpec, LanguageSpec};
use crate::runner::{check_limits, Runner};
use crate::scratch::ScratchDir;
use async_trait::async_trait;
use codeverse_common::config::EngineConfig;
use codeverse_common::types::{exited_with_code, ExecutionRequest, ExecutionResult, Language};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// How long stream readers may keep draining after the process is gone
const READER_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK_BYTES: usize = 4096;

/// Fixed diagnostic for a run that hit its deadline
pub fn timeout_message(language: Language) -> String {
    format!("Execution timeout: {} code took too long to run", language)
}

/// Drop JVM launcher chatter (`Picked up JAVA_TOOL_OPTIONS: ...`) from captured output
pub fn strip_java_noise(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.contains("JAVA_TOOL_OPTIONS") && !line.trim_start().starts_with("Picked up"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Toolchain command for one phase; the JVM launcher banner is suppressed at the source
fn phase_command(command: CommandSpec, language: Language, workdir: &Path) -> Command {
    let mut cmd = command.command(workdir);
    if language == Language::Java {
        cmd.env_remove("JAVA_TOOL_OPTIONS");
    }
    cmd
}

/// Raw result of supervising one child process
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<ExitStatus>,
    pub wait_error: Option<String>,
    pub timed_out: bool,
}

/// Runs submissions with the host's compilers and interpreters
pub struct ProcessRunner {
    config: EngineConfig,
    input: Arc<dyn InputTiming>,
}

impl ProcessRunner {
    pub fn new(config: EngineConfig) -> Self {
        let input = input_timing(&config);
        Self { config, input }
    }

    /// Swap the stdin delivery policy
    pub fn with_input_timing(mut self, input: Arc<dyn InputTiming>) -> Self {
        self.input = input;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn stage_and_run(
        &self,
        scratch: &ScratchDir,
        spec: &LanguageSpec,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, EngineError> {
        scratch.write(spec.source_filename, &request.source_code).await?;

        if let Some(compile) = spec.compile {
            if let Some(failure) = self.compile(scratch, spec.language, compile).await? {
                return Ok(failure);
            }
        }

        let cmd = phase_command(spec.run, spec.language, scratch.path());
        let bound = Duration::from_millis(self.config.run_timeout_ms);
        let outcome = supervise(
            cmd,
            &request.stdin,
            self.input.clone(),
            bound,
            self.config.max_output_bytes,
        )
        .await?;
        Ok(fold_outcome(spec.language, outcome))
    }

    /// Returns `Some(result)` when compilation failed and RUN must be skipped
    async fn compile(
        &self,
        scratch: &ScratchDir,
        language: Language,
        compile: CommandSpec,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        let start = Instant::now();
        let mut cmd = phase_command(compile, language, scratch.path());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| EngineError::spawn(compile.program, e))?;
        let bound = Duration::from_millis(self.config.compile_timeout_ms);

        // On timeout the child is dropped with the future and killed
        let failure = match tokio::time::timeout(bound, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => None,
            Ok(Ok(output)) => {
                let mut diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
                if language == Language::Java {
                    diagnostic = strip_java_noise(&diagnostic);
                }
                Some(format!("{} compilation failed: {}", language, diagnostic.trim()))
            }
            Ok(Err(e)) => Some(format!("{} compilation error: {}", language, e)),
            Err(_) => Some(format!("{} compilation timeout", language)),
        };

        let compile_ms = start.elapsed().as_millis() as u64;
        match failure {
            None => {
                debug!(language = %language, compile_ms, "Compilation succeeded");
                Ok(None)
            }
            Some(diagnostic) => {
                warn!(
                    language = %language,
                    compile_ms,
                    error_preview = diagnostic.lines().next().unwrap_or(""),
                    "Compilation failed"
                );
                Ok(Some(ExecutionResult::compile_error(diagnostic)))
            }
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip(self, request), fields(language = %request.language))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        check_limits(request, self.config.max_source_bytes, self.config.max_stdin_bytes)?;

        let start = Instant::now();
        let spec = registry::spec(request.language);
        let scratch = ScratchDir::create(&self.config.scratch_root).await?;
        let execution_id = scratch.execution_id();

        let outcome = self.stage_and_run(&scratch, spec, request).await;
        scratch.cleanup().await;

        let result = outcome?.with_duration(start.elapsed().as_millis() as u64);
        info!(
            execution_id = %execution_id,
            status = ?result.status,
            failure = ?result.failure,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Execution completed"
        );
        Ok(result)
    }
}

/// Turn a supervised run into the caller-facing result
fn fold_outcome(language: Language, outcome: RunOutcome) -> ExecutionResult {
    let (stdout, stderr) = if language == Language::Java {
        (strip_java_noise(&outcome.stdout), strip_java_noise(&outcome.stderr))
    } else {
        (outcome.stdout, outcome.stderr)
    };
    let stdout = stdout.trim().to_string();
    let stderr = stderr.trim().to_string();

    if outcome.timed_out {
        return ExecutionResult::timed_out(stdout, timeout_message(language), None);
    }

    if let Some(e) = outcome.wait_error {
        return ExecutionResult::runtime_error(stdout, format!("{} execution error: {}", language, e), None);
    }

    match outcome.status.and_then(|status| status.code()) {
        Some(0) => ExecutionResult::done(stdout, stderr, Some(0)),
        Some(code) => {
            let stderr = if stderr.is_empty() {
                exited_with_code(language, code as i64)
            } else {
                stderr
            };
            ExecutionResult::runtime_error(stdout, stderr, Some(code as i64))
        }
        None => {
            let stderr = if stderr.is_empty() {
                terminated_message(language, outcome.status)
            } else {
                stderr
            };
            ExecutionResult::runtime_error(stdout, stderr, None)
        }
    }
}

#[cfg(unix)]
fn terminated_message(language: Language, status: Option<ExitStatus>) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.and_then(|s| s.signal()) {
        Some(signal) => format!("{} execution terminated by signal {}", language, signal),
        None => format!("{} execution terminated", language),
    }
}

#[cfg(not(unix))]
fn terminated_message(language: Language, _status: Option<ExitStatus>) -> String {
    format!("{} execution terminated", language)
}

/// Run `cmd` to completion or until `bound` elapses.
///
/// Three tasks cooperate: two stream pumps (stdout also watches for prompts)
/// and a stdin feeder. The process wait races the deadline; on expiry the
/// whole process group is killed. The feeder is cancelled once the process
/// is gone, the pumps get a short grace period to drain. Whatever is left in
/// the process group is killed on every path, not only at the deadline.
/// Each stream keeps at most `output_limit` bytes.
pub(crate) async fn supervise(
    mut cmd: Command,
    stdin: &str,
    timing: Arc<dyn InputTiming>,
    bound: Duration,
    output_limit: usize,
) -> Result<RunOutcome, EngineError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().map_err(|e| EngineError::spawn(program.clone(), e))?;
    // process_group(0) makes the child's pid the group id; tokio forgets the pid once reaped
    let pgid = child.id();
    debug!(program = %program, pid = ?pgid, "Process spawned");

    let stdout_buf = Arc::new(Mutex::new(CappedOutput::new(output_limit)));
    let stderr_buf = Arc::new(Mutex::new(CappedOutput::new(output_limit)));
    let prompt = Arc::new(Notify::new());

    let mut stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, stdout_buf.clone(), Some((timing.clone(), prompt.clone())))));
    let mut stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, stderr_buf.clone(), None)));
    let stdin_task = tokio::spawn(feed_stdin(child.stdin.take(), stdin_payload(stdin), timing, prompt));

    let (status, wait_error, timed_out) = match tokio::time::timeout(bound, child.wait()).await {
        Ok(Ok(status)) => (Some(status), None, false),
        Ok(Err(e)) => (None, Some(e.to_string()), false),
        Err(_) => {
            warn!(program = %program, bound_ms = bound.as_millis() as u64, "Run deadline exceeded - killing process group");
            kill_group(pgid);
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Child already gone");
            }
            (None, None, true)
        }
    };

    // background children must not outlive the execution
    kill_group(pgid);

    stdin_task.abort();
    drain(&mut stdout_task).await;
    drain(&mut stderr_task).await;

    Ok(RunOutcome {
        stdout: take_lossy(&stdout_buf),
        stderr: take_lossy(&stderr_buf),
        status,
        wait_error,
        timed_out,
    })
}

/// Copy a stream into `sink`, signalling `prompt` on the first prompt-like chunk
async fn pump<R>(mut reader: R, sink: Arc<Mutex<CappedOutput>>, watch: Option<(Arc<dyn InputTiming>, Arc<Notify>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut prompted = false;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Stream read failed");
                break;
            }
        };
        if let Ok(mut sink) = sink.lock() {
            sink.push(&buf[..n]);
        }
        if let Some((timing, prompt)) = &watch {
            if !prompted {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                debug!(chunk = %chunk.trim_end(), "stdout chunk");
                if timing.is_prompt(&chunk) {
                    prompted = true;
                    prompt.notify_one();
                }
            }
        }
    }
}

/// Deliver stdin exactly once, then close it
async fn feed_stdin(
    stdin: Option<ChildStdin>,
    payload: Option<Vec<u8>>,
    timing: Arc<dyn InputTiming>,
    prompt: Arc<Notify>,
) {
    let Some(mut stdin) = stdin else {
        return;
    };

    let fallback = async {
        match timing.fallback_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = prompt.notified() => {
            debug!("Input prompt detected");
            tokio::time::sleep(timing.settle_delay()).await;
        }
        _ = fallback => {
            debug!("No prompt detected, sending input on fallback");
        }
    }

    if let Some(payload) = payload {
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(error = %e, "Process closed stdin before input was delivered");
        }
    }
    // dropping the handle closes the pipe: end of input
    drop(stdin);
}

/// SIGKILL every process still in the group; an empty group is fine
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Process group killed"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

async fn drain(task: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = task.as_mut() {
        if tokio::time::timeout(READER_GRACE, &mut *handle).await.is_err() {
            // something outside the process group still holds the pipe
            handle.abort();
        }
    }
}

fn take_lossy(buf: &Arc<Mutex<CappedOutput>>) -> String {
    match buf.lock() {
        Ok(output) => output.to_text(),
        Err(poisoned) => poisoned.into_inner().to_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ImmediateInput, PromptHeuristic, StrictPrompt};
    use codeverse_common::types::{ExecutionStatus, FailureKind};

    const CAPTURE: usize = 1024 * 1024;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn heuristic() -> Arc<dyn InputTiming> {
        Arc::new(PromptHeuristic::default())
    }

    #[test]
    fn test_strip_java_noise() {
        let noisy = "Picked up JAVA_TOOL_OPTIONS: -Xmx64m\nHello\n  Picked up _JAVA_OPTIONS: x\nWorld";
        assert_eq!(strip_java_noise(noisy), "Hello\nWorld");
        assert_eq!(strip_java_noise(""), "");
    }

    #[tokio::test]
    async fn test_supervise_captures_both_streams() {
        let outcome = supervise(sh("echo out; echo err >&2"), "", heuristic(), Duration::from_secs(5), CAPTURE)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.status.and_then(|s| s.code()), Some(0));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_supervise_prompt_triggers_input() {
        let start = Instant::now();
        let outcome = supervise(
            sh("printf 'Name: '; read name; echo \"Hello $name\""),
            "Alice",
            heuristic(),
            Duration::from_secs(5),
            CAPTURE,
        )
        .await
        .unwrap();
        assert!(outcome.stdout.contains("Hello Alice"));
        // prompt path is well ahead of the 1.5s fallback
        assert!(start.elapsed() < Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_supervise_fallback_sends_input_without_prompt() {
        let start = Instant::now();
        let outcome = supervise(sh("read name; echo \"got $name\""), "Alice", heuristic(), Duration::from_secs(5), CAPTURE)
            .await
            .unwrap();
        assert!(outcome.stdout.contains("got Alice"));
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_supervise_empty_stdin_signals_eof() {
        let outcome = supervise(
            sh("if read line; then echo read; else echo eof; fi"),
            "",
            Arc::new(ImmediateInput),
            Duration::from_secs(5),
            CAPTURE,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stdout.trim(), "eof");
    }

    #[tokio::test]
    async fn test_supervise_input_sent_once() {
        let outcome = supervise(
            sh("printf 'a? '; read a; printf 'b? '; if read b; then echo \"second=$b\"; else echo \"first=$a\"; fi"),
            "x",
            heuristic(),
            Duration::from_secs(5),
            CAPTURE,
        )
        .await
        .unwrap();
        assert!(outcome.stdout.contains("first=x"));
    }

    #[tokio::test]
    async fn test_supervise_timeout_kills_process_group() {
        let start = Instant::now();
        let outcome = supervise(sh("sleep 30 & sleep 30; wait"), "", heuristic(), Duration::from_millis(300), CAPTURE)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.status.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    /// Liveness from /proc; zombies count as gone
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_children_do_not_outlive_execution() {
        let start = Instant::now();
        let outcome = supervise(
            sh("sleep 37 & echo $!"),
            "",
            Arc::new(ImmediateInput),
            Duration::from_secs(5),
            CAPTURE,
        )
        .await
        .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.status.and_then(|s| s.code()), Some(0));
        // the orphan no longer holds stdout open, so no reader grace is spent
        assert!(start.elapsed() < READER_GRACE);

        let pid: u32 = outcome.stdout.trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!process_alive(pid), "background child {} outlived the execution", pid);
    }

    #[tokio::test]
    async fn test_output_capture_is_capped() {
        let outcome = supervise(
            sh("yes codeverse"),
            "",
            Arc::new(ImmediateInput),
            Duration::from_millis(500),
            4096,
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        let (kept, note) = outcome
            .stdout
            .split_once("\n[output truncated: ")
            .expect("truncation note");
        assert_eq!(kept.len(), 4096);
        assert!(kept.starts_with("codeverse\ncodeverse\n"));
        assert!(note.ends_with(" bytes omitted]"));
    }

    #[test]
    fn test_java_phases_drop_tool_options() {
        let workdir = Path::new("/tmp");
        let java = registry::spec(Language::Java);
        let compile = java.compile.expect("java compiles");
        for phase in [compile, java.run] {
            let cmd = phase_command(phase, Language::Java, workdir);
            let removed = cmd
                .as_std()
                .get_envs()
                .any(|(key, value)| key == "JAVA_TOOL_OPTIONS" && value.is_none());
            assert!(removed, "{} keeps JAVA_TOOL_OPTIONS", phase.shell());
        }

        let c = phase_command(registry::spec(Language::C).run, Language::C, workdir);
        assert_eq!(c.as_std().get_envs().count(), 0);
    }

    #[tokio::test]
    async fn test_supervise_strict_mode_waits_for_prompt() {
        // no explicit prompt: strict mode never sends, so the read blocks until the deadline
        let outcome = supervise(
            sh("read x; echo done"),
            "value",
            Arc::new(StrictPrompt::default()),
            Duration::from_millis(2000),
            CAPTURE,
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn test_supervise_missing_program_is_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-binary-codeverse");
        let err = supervise(cmd, "", heuristic(), Duration::from_secs(1), CAPTURE).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_fold_outcome_nonzero_exit() {
        let outcome = supervise(sh("echo partial; exit 3"), "", heuristic(), Duration::from_secs(5), CAPTURE)
            .await
            .unwrap();
        let result = fold_outcome(Language::C, outcome);
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.failure, Some(FailureKind::Runtime));
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "partial");
        assert!(result.stderr.contains("exited with code 3"));
    }

    #[test]
    fn test_fold_outcome_timeout_message() {
        let outcome = RunOutcome {
            stdout: "tick\n".into(),
            stderr: String::new(),
            status: None,
            wait_error: None,
            timed_out: true,
        };
        let result = fold_outcome(Language::Python, outcome);
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert_eq!(result.stderr, timeout_message(Language::Python));
        assert_eq!(result.stdout, "tick");
    }

    #[test]
    fn test_fold_outcome_strips_java_noise() {
        let outcome = RunOutcome {
            stdout: "Hello\n".into(),
            stderr: "Picked up JAVA_TOOL_OPTIONS: -Dfile.encoding=UTF8\n".into(),
            status: None,
            wait_error: None,
            timed_out: false,
        };
        let result = fold_outcome(Language::Java, outcome);
        assert_eq!(result.stdout, "Hello");
        // nothing left after filtering, so the synthesized message is used
        assert_eq!(result.stderr, "java execution terminated");
    }
}
