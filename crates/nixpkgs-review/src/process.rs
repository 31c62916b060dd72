//! Child-process execution for everything the pipeline shells out to.
//!
//! Every external command goes through [`ProcessRunner::run`]: env and cwd
//! are passed explicitly, output is streamed line by line, timeouts escalate
//! SIGTERM to SIGKILL, and a single cancellation token propagates SIGINT to
//! all live children.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a child gets between SIGTERM/SIGINT and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("`{program}` exited with status {code}: {stderr}")]
    NonZero {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Captured result of a finished child.
#[derive(Debug, Clone)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// One command invocation: program, args, and an explicit environment.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<String>,
    stdin_lines: Option<mpsc::UnboundedReceiver<String>>,
    timeout: Option<Duration>,
    tee: Option<PathBuf>,
    line_sink: Option<UnboundedSender<String>>,
    check: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            stdin: None,
            stdin_lines: None,
            timeout: None,
            tee: None,
            line_sink: None,
            check: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Feed stdin from a channel, one line at a time, closing it when the
    /// sender side is dropped.
    pub fn stdin_lines(mut self, rx: mpsc::UnboundedReceiver<String>) -> Self {
        self.stdin_lines = Some(rx);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Append every output line to the given file as it arrives.
    pub fn tee(mut self, path: impl Into<PathBuf>) -> Self {
        self.tee = Some(path.into());
        self
    }

    /// Forward every output line to the given channel as it arrives.
    pub fn line_sink(mut self, sink: UnboundedSender<String>) -> Self {
        self.line_sink = Some(sink);
        self
    }

    /// Treat a non-zero exit as data instead of an error.
    pub fn allow_failure(mut self) -> Self {
        self.check = false;
        self
    }

    fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

/// Shared runner carrying the process-wide cancellation token.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a command to completion, streaming its output.
    pub async fn run(&self, mut cmd: Cmd) -> Result<Output> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        debug!(command = %cmd.display(), cwd = ?cmd.cwd, "spawning");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() || cmd.stdin_lines.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        if let Some(data) = &cmd.stdin {
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle.write_all(data.as_bytes()).await?;
            drop(handle);
        } else if let Some(mut rx) = cmd.stdin_lines.take() {
            let mut handle = child.stdin.take().expect("stdin was piped");
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if handle.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if handle.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
            });
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (tx, rx) = mpsc::unbounded_channel::<(bool, String)>();
        let err_tx = tx.clone();
        tokio::spawn(read_lines(stdout, tx, false));
        tokio::spawn(read_lines(stderr, err_tx, true));
        let collector = tokio::spawn(collect_lines(rx, cmd.tee.clone(), cmd.line_sink.clone()));

        let timeout = async {
            match cmd.timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let status = tokio::select! {
            status = child.wait() => status?,
            () = self.cancel.cancelled() => {
                warn!(command = %cmd.display(), "cancelled, interrupting child");
                terminate(&mut child, Signal::SIGINT).await;
                let _ = collector.await;
                return Err(ProcessError::Cancelled);
            }
            () = &mut timeout => {
                let seconds = cmd.timeout.map_or(0, |t| t.as_secs());
                warn!(command = %cmd.display(), seconds, "timed out, terminating child");
                terminate(&mut child, Signal::SIGTERM).await;
                let _ = collector.await;
                return Err(ProcessError::Timeout {
                    program: cmd.program,
                    seconds,
                });
            }
        };

        let (stdout, stderr) = collector
            .await
            .map_err(|e| ProcessError::Io(std::io::Error::other(e)))??;
        let exit_code = status.code().unwrap_or(-1);
        debug!(command = %cmd.display(), exit_code, "finished");

        if cmd.check && exit_code != 0 {
            return Err(ProcessError::NonZero {
                program: cmd.program,
                code: exit_code,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(Output {
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: UnboundedSender<(bool, String)>,
    is_stderr: bool,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((is_stderr, line)).is_err() {
            break;
        }
    }
}

async fn collect_lines(
    mut rx: mpsc::UnboundedReceiver<(bool, String)>,
    tee: Option<PathBuf>,
    sink: Option<UnboundedSender<String>>,
) -> std::io::Result<(String, String)> {
    let mut tee_file = match &tee {
        Some(path) => Some(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        ),
        None => None,
    };
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some((is_stderr, line)) = rx.recv().await {
        if let Some(file) = tee_file.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        if let Some(sink) = &sink {
            let _ = sink.send(line.clone());
        }
        let buf = if is_stderr { &mut stderr } else { &mut stdout };
        buf.push_str(&line);
        buf.push('\n');
    }
    if let Some(file) = tee_file.as_mut() {
        file.flush().await?;
    }
    Ok((stdout, stderr))
}

/// Signal the child, wait out the grace period, then SIGKILL survivors.
async fn terminate(child: &mut Child, signal: Signal) {
    if let Some(id) = child.id() {
        let _ = kill(Pid::from_raw(id as i32), signal);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid = id, signal = ?signal, "child survived grace period, killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn run_captures_stdout_and_stderr() {
        let out = runner()
            .run(Cmd::new("sh").arg("-c").arg("echo out; echo err >&2"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = runner()
            .run(Cmd::new("definitely-not-a-real-binary-1234"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_by_default() {
        let err = runner()
            .run(Cmd::new("sh").arg("-c").arg("echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            ProcessError::NonZero { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn allow_failure_returns_the_exit_code() {
        let out = runner()
            .run(Cmd::new("sh").arg("-c").arg("exit 7").allow_failure())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = runner()
            .run(Cmd::new("cat").stdin("hello\n"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let err = runner()
            .run(
                Cmd::new("sh")
                    .arg("-c")
                    .arg("sleep 30")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_child() {
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new(cancel.clone());
        let handle =
            tokio::spawn(async move { runner.run(Cmd::new("sh").arg("-c").arg("sleep 30")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }

    #[tokio::test]
    async fn tee_appends_all_output_lines() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("cmd.log");
        runner()
            .run(
                Cmd::new("sh")
                    .arg("-c")
                    .arg("echo one; echo two >&2")
                    .tee(&log),
            )
            .await
            .unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("one"));
        assert!(content.contains("two"));
    }

    #[tokio::test]
    async fn line_sink_streams_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        runner()
            .run(
                Cmd::new("sh")
                    .arg("-c")
                    .arg("echo a; echo b")
                    .line_sink(tx),
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn stdin_lines_stream_until_sender_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("alpha".to_string()).unwrap();
        drop(tx);
        let out = runner().run(Cmd::new("cat").stdin_lines(rx)).await.unwrap();
        assert_eq!(out.stdout, "alpha\n");
    }

    #[tokio::test]
    async fn explicit_env_reaches_the_child() {
        let out = runner()
            .run(
                Cmd::new("sh")
                    .arg("-c")
                    .arg("printf %s \"$REVIEW_TEST_VAR\"")
                    .env("REVIEW_TEST_VAR", "42"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "42");
    }
}
