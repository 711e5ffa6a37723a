//! Subprocess helpers shared by the mirror, store, sandbox, and builder.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::libc;
use nix::sys::signal::{kill, raise, sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::procutil::recursive_kill;

/// Grace period between SIGTERM and SIGKILL when a build tree must die.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    /// Signal that terminated the child, 0 for a normal exit.
    pub term_signal: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0 && self.term_signal == 0
    }
}

/// Result of a logged run; the output itself lands in the caller's log.
#[derive(Debug, Clone, Copy)]
pub struct LoggedRun {
    pub code: i32,
    pub term_signal: i32,
    pub timed_out: bool,
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {program}"))?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        term_signal: output.status.signal().unwrap_or(0),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Execute a program, appending every output line to `log` as it arrives.
/// When `timeout` elapses the whole process tree gets SIGTERM, then SIGKILL
/// after [`KILL_GRACE`].
///
/// # Errors
///
/// Returns an error when the program cannot be spawned; nonzero exits and
/// timeouts are reported through [`LoggedRun`], not as errors.
pub fn run_command_logged(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
    log: &Arc<Mutex<Vec<String>>>,
    timeout: Option<Duration>,
) -> Result<LoggedRun> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    let pid = child.id();

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, Arc::clone(log)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, Arc::clone(log)));
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let mut kill_deadline = None;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("waiting for {program}"))?
        {
            break status;
        }
        if let Some(deadline) = deadline {
            if !timed_out && Instant::now() >= deadline {
                timed_out = true;
                recursive_kill(pid, Signal::SIGTERM);
                kill_deadline = Some(Instant::now() + KILL_GRACE);
            }
        }
        if let Some(at) = kill_deadline {
            if Instant::now() >= at {
                recursive_kill(pid, Signal::SIGKILL);
                kill_deadline = None;
            }
        }
        thread::sleep(Duration::from_millis(100));
    };
    for reader in readers {
        let _ = reader.join();
    }
    Ok(LoggedRun {
        code: status.code().unwrap_or(-1),
        term_signal: status.signal().unwrap_or(0),
        timed_out,
    })
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    stream: R,
    log: Arc<Mutex<Vec<String>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        use std::io::{BufRead, BufReader};
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Ok(mut log) = log.lock() {
                log.push(line);
            }
        }
    })
}

static PROXIED_CHILD: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_interrupt(_signo: libc::c_int) {
    let pid = PROXIED_CHILD.load(Ordering::SeqCst);
    if pid > 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
    }
}

/// Execute a program with inherited stdio, forwarding Ctrl-C to the child.
/// The returned [`RunOutput`] carries the child's exit code and terminating
/// signal; callers that must surface exit-by-signal to their own parent
/// re-raise with [`reraise`].
///
/// # Errors
///
/// Returns an error when the program cannot be spawned.
pub fn run_proxied(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    install_interrupt_forwarder()?;

    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    PROXIED_CHILD.store(child.id() as i32, Ordering::SeqCst);
    let status = child.wait();
    PROXIED_CHILD.store(0, Ordering::SeqCst);
    let status = status.with_context(|| format!("waiting for {program}"))?;
    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        term_signal: status.signal().unwrap_or(0),
        stdout: String::new(),
        stderr: String::new(),
    })
}

fn install_interrupt_forwarder() -> Result<()> {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::Handler(forward_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only reads an atomic and calls kill(2), both
    // async-signal-safe.
    unsafe { sigaction(Signal::SIGINT, &action) }
        .context("installing the SIGINT forwarder")?;
    let _ = INSTALLED.set(());
    Ok(())
}

/// Restores the default disposition for `signo` and raises it on the
/// current process, so the shell observes the same exit-by-signal the
/// child suffered. Returns only if raising failed.
///
/// # Errors
///
/// Returns an error for signal numbers this platform does not know.
pub fn reraise(signo: i32) -> Result<()> {
    let sig = Signal::try_from(signo).context("unknown terminating signal")?;
    // SAFETY: resetting to the default disposition is always sound.
    unsafe { signal(sig, SigHandler::SigDfl) }.context("resetting signal disposition")?;
    raise(sig).context("re-raising signal")?;
    Ok(())
}
