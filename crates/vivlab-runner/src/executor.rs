use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use wait_timeout::ChildExt;

/// Result of one bounded external invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The tool exited with an accepted status; carries the captured output.
    Ok(String),
    /// The bound expired and the process was killed.
    Timeout,
    /// The tool failed, could not be started, or its output could not be captured.
    Aborted(String),
}

impl StageOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageOutcome::Ok(_) => "ok",
            StageOutcome::Timeout => "timeout",
            StageOutcome::Aborted(_) => "aborted",
        }
    }
}

/// One external command. Stdout always goes to `capture`, which doubles as the
/// tool's output file when the tool writes its result to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub capture: PathBuf,
    pub merge_stderr: bool,
    pub exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: &Path, capture: &Path) -> Self {
        CommandSpec {
            program: program.to_path_buf(),
            args: Vec::new(),
            stdin: None,
            capture: capture.to_path_buf(),
            merge_stderr: true,
            exit_codes: vec![0],
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

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn stdout_only(mut self) -> Self {
        self.merge_stderr = false;
        self
    }

    pub fn exit_codes(mut self, codes: &[i32]) -> Self {
        self.exit_codes = codes.to_vec();
        self
    }

    /// Shell-style rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().cloned());
        parts
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Boundary between the pipeline and the outside world. Implementations must
/// never panic or return early with an error: every failure is an outcome.
pub trait StageExecutor: Send + Sync {
    fn execute(&self, spec: &CommandSpec, timeout: Duration) -> StageOutcome;
}

/// Spawns real processes and kills them when the bound expires.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl StageExecutor for ProcessExecutor {
    fn execute(&self, spec: &CommandSpec, timeout: Duration) -> StageOutcome {
        match run_bounded(spec, timeout) {
            Ok(outcome) => outcome,
            Err(e) => StageOutcome::Aborted(format!("{}: {}", spec.program.display(), e)),
        }
    }
}

fn run_bounded(spec: &CommandSpec, timeout: Duration) -> io::Result<StageOutcome> {
    if let Some(parent) = spec.capture.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = fs::File::create(&spec.capture)?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if spec.merge_stderr {
        cmd.stdout(Stdio::from(out.try_clone()?));
        cmd.stderr(Stdio::from(out));
    } else {
        cmd.stdout(Stdio::from(out));
        cmd.stderr(Stdio::null());
    }
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    // Own process group, so a timeout also reaches anything the tool forks.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(command = %spec.display(), timeout_secs = timeout.as_secs_f64(), "spawning stage");
    let started = Instant::now();
    let mut child = cmd.spawn()?;

    let feeder = match (spec.stdin.clone(), child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        })),
        _ => None,
    };

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            kill_stage(&mut child);
            let _ = child.wait();
            if let Some(handle) = feeder {
                let _ = handle.join();
            }
            debug!(
                program = %spec.program.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage killed after timeout"
            );
            return Ok(StageOutcome::Timeout);
        }
    };
    if let Some(handle) = feeder {
        let _ = handle.join();
    }

    let text = String::from_utf8_lossy(&fs::read(&spec.capture)?).into_owned();
    let outcome = match status.code() {
        Some(code) if spec.exit_codes.contains(&code) => StageOutcome::Ok(text),
        Some(code) => StageOutcome::Aborted(format!("exit status {}: {}", code, last_line(&text))),
        None => StageOutcome::Aborted(format!("terminated by signal: {}", last_line(&text))),
    };
    Ok(outcome)
}

/// Kills the child's whole process group, then the child itself in case the
/// group signal could not be sent.
fn kill_stage(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(pid, error = %e, "process group kill failed");
            }
        }
    }
    let _ = child.kill();
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
}
