//! Process-tree and mount-table inspection.
//!
//! The container engine does not reliably forward signals to descendants,
//! so timeout enforcement walks `/proc` itself. Linux-only, like the rest
//! of the sandbox layer.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::process::run_command;

/// Delivers `sig` to `pid` and every descendant, children before parents so
/// a dying parent cannot re-spawn into the gap. ENOENT and ESRCH are
/// expected races with exiting processes and are ignored.
pub fn recursive_kill(pid: u32, sig: Signal) {
    for child in child_pids(pid) {
        recursive_kill(child, sig);
    }
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => debug!(pid, %err, "signal delivery failed"),
    }
}

/// Direct children of `pid`, from `/proc/<pid>/task/*/children`.
pub fn child_pids(pid: u32) -> Vec<u32> {
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
    let Ok(tasks) = fs::read_dir(&task_dir) else {
        return Vec::new();
    };
    let mut children = Vec::new();
    for task in tasks.flatten() {
        // The process may exit between readdir and read; treat ENOENT as
        // an empty list.
        let Ok(raw) = fs::read_to_string(task.path().join("children")) else {
            continue;
        };
        children.extend(raw.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
    }
    children
}

/// One `/etc/mtab` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub dir: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

/// The mount entry whose directory lives on the same device as `path`.
pub fn mount_info(path: &Path) -> Result<Option<MountEntry>> {
    let device = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .dev();
    let table = fs::read_to_string("/etc/mtab").context("reading /etc/mtab")?;
    for entry in parse_mount_table(&table) {
        let Ok(meta) = fs::metadata(&entry.dir) else {
            continue;
        };
        if meta.dev() == device {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let dir = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                dir: PathBuf::from(unescape_mtab(dir)),
                fstype: fstype.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

// mtab escapes whitespace in mount points as octal sequences.
fn unescape_mtab(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Kernel release as (major, minor, patch), parsed from `uname -r` with
/// vendor suffixes (`6.5.0-1-amd64`) tolerated.
pub fn kernel_version() -> Result<(u32, u32, u32)> {
    static CACHE: OnceLock<Option<(u32, u32, u32)>> = OnceLock::new();
    let cached = *CACHE.get_or_init(|| {
        let output = run_command("uname", &["-r".to_string()], &[], Path::new(".")).ok()?;
        parse_kernel_release(output.stdout.trim())
    });
    cached.ok_or_else(|| anyhow!("could not determine the kernel version"))
}

/// Whether the running kernel is at least `major.minor`.
pub fn kernel_at_least(major: u32, minor: u32) -> bool {
    match kernel_version() {
        Ok((have_major, have_minor, _)) => (have_major, have_minor) >= (major, minor),
        Err(_) => false,
    }
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let numeric = release
        .split(|c: char| c == '-' || c == '+' || c == '_')
        .next()?;
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}
