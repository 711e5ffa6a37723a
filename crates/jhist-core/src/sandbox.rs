//! Hermetic build and extract environments.
//!
//! A sandbox invocation synthesizes an OCI bundle (read-only rootfs,
//! caller-specified bind/overlay mounts, single-entry user-namespace
//! mappings) and produces the argv that hands it to the container engine.
//! The engine itself stays an external subprocess, like the pack codec.

pub mod oci;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ArchiveError;
use crate::process::{run_command, run_command_logged, LoggedRun, RunOutput};
use crate::procutil;

use oci::{
    OciCapabilities, OciConfig, OciIdMapping, OciLinux, OciMount, OciProcess, OciRlimit, OciRoot,
    OciUser,
};

/// Default engine binary name, overridable via `JHIST_ENGINE`.
const ENGINE_PROGRAM: &str = "crun";

/// Destinations that always get a writable overlay over the rootfs, so
/// builds can scribble without the rootfs image carrying scratch space.
const AUTO_OVERLAYS: [&str; 5] = ["/tmp", "/var", "/home", "/root", "/usr/local"];

/// How to materialize one in-container destination.
#[derive(Clone, Debug)]
pub enum MountSpec {
    /// Bind a host path. Used for destinations whose key carries a
    /// `:ro`/`:rw` suffix.
    Bind { source: PathBuf, writable: bool },
    /// Overlay with `lower` as the read-only layer; upper and work live in
    /// the invocation's workdir and die with it.
    Overlay { lower: PathBuf },
}

/// One sandbox invocation's inputs.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub name: String,
    pub rootfs: PathBuf,
    /// Keyed by in-container destination, optionally suffixed `:ro`/`:rw`
    /// for bind mounts.
    pub mounts: BTreeMap<String, MountSpec>,
    pub env: Vec<(String, String)>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: Option<String>,
}

/// A synthesized bundle, ready to hand to the engine. The workdir (upper
/// and work layers plus the bundle) is removed on cleanup and on drop.
#[derive(Debug)]
pub struct PreparedSandbox {
    pub program: String,
    pub args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl PreparedSandbox {
    /// Removes the workdir. Failure here leaks disk, not correctness, so
    /// callers on cleanup-only paths may ignore the result; the drop
    /// fallback retries once more.
    pub fn cleanup(mut self) -> Result<()> {
        if let Some(workdir) = self.workdir.take() {
            remove_workdir(&workdir)?;
        }
        Ok(())
    }
}

impl Drop for PreparedSandbox {
    fn drop(&mut self) {
        if let Some(workdir) = self.workdir.take() {
            if let Err(err) = remove_workdir(&workdir) {
                warn!(%err, "sandbox workdir left behind");
            }
        }
    }
}

/// Builds the bundle for `spec` running `command`.
pub fn prepare(config: &Config, spec: &SandboxSpec, command: &[String]) -> Result<PreparedSandbox> {
    static INVOCATION: AtomicU64 = AtomicU64::new(0);
    let engine = engine_program()?;
    fs::create_dir_all(&config.sandbox_dir)
        .with_context(|| format!("creating {}", config.sandbox_dir.display()))?;
    let workdir = tempfile::Builder::new()
        .prefix("work-")
        .tempdir_in(&config.sandbox_dir)
        .context("creating sandbox workdir")?
        .keep();
    let bundle = workdir.join("bundle");
    fs::create_dir_all(&bundle).with_context(|| format!("creating {}", bundle.display()))?;

    let oci_config = render_config(spec, command, &workdir)
        .map_err(|err| ArchiveError::Sandbox(err.to_string()))?;
    let config_path = bundle.join("config.json");
    let encoded =
        serde_json::to_vec_pretty(&oci_config).context("encoding sandbox config.json")?;
    fs::write(&config_path, encoded)
        .with_context(|| format!("writing {}", config_path.display()))?;

    let container = format!(
        "{}-{}-{}",
        spec.name,
        std::process::id(),
        INVOCATION.fetch_add(1, Ordering::Relaxed)
    );
    debug!(%container, bundle = %bundle.display(), "prepared sandbox bundle");
    Ok(PreparedSandbox {
        program: engine.display().to_string(),
        args: vec![
            "--root".to_string(),
            config.sandbox_dir.join("state").display().to_string(),
            "run".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
            container,
        ],
        workdir: Some(workdir),
    })
}

/// Prepare, run to completion capturing output, clean up.
pub fn run(config: &Config, spec: &SandboxSpec, command: &[String]) -> Result<RunOutput> {
    let prepared = prepare(config, spec, command)?;
    let output = run_command(&prepared.program, &prepared.args, &[], Path::new("."));
    prepared.cleanup()?;
    output
}

/// Prepare, run with line-logging and an optional timeout, clean up. The
/// timeout kills the engine's whole process tree (the engine does not
/// forward signals to build descendants reliably).
pub fn run_logged(
    config: &Config,
    spec: &SandboxSpec,
    command: &[String],
    log: &Arc<Mutex<Vec<String>>>,
    timeout: Option<Duration>,
) -> Result<LoggedRun> {
    let prepared = prepare(config, spec, command)?;
    let run = run_command_logged(
        &prepared.program,
        &prepared.args,
        &[],
        Path::new("."),
        log,
        timeout,
    );
    prepared.cleanup()?;
    run
}

fn render_config(spec: &SandboxSpec, command: &[String], workdir: &Path) -> Result<OciConfig> {
    if command.is_empty() {
        return Err(anyhow!("sandbox command must not be empty"));
    }
    let mut mounts = oci::system_mounts();
    let mut overlay_index = 0usize;

    let mut resolved: BTreeMap<String, MountSpec> = BTreeMap::new();
    for (key, mount) in &spec.mounts {
        let (dest, _) = split_dest(key);
        resolved.insert(dest.to_string(), mount.clone());
    }
    for dest in AUTO_OVERLAYS {
        resolved.entry(dest.to_string()).or_insert_with(|| MountSpec::Overlay {
            lower: spec.rootfs.join(dest.trim_start_matches('/')),
        });
    }

    // BTreeMap order puts parents before children, which is also mount
    // order for the engine.
    for (dest, mount) in &resolved {
        match mount {
            MountSpec::Bind { source, writable } => {
                mounts.push(bind_mount(dest, source, *writable)?);
            }
            MountSpec::Overlay { lower } => {
                mounts.push(overlay_mount(dest, lower, workdir, &mut overlay_index)?);
            }
        }
    }

    let mut env = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "HOME=/home".to_string(),
    ];
    env.extend(spec.env.iter().map(|(k, v)| format!("{k}={v}")));

    Ok(OciConfig {
        oci_version: oci::OCI_VERSION.to_string(),
        process: OciProcess {
            terminal: false,
            user: OciUser {
                uid: spec.uid,
                gid: spec.gid,
            },
            args: command.to_vec(),
            env,
            cwd: spec.cwd.clone().unwrap_or_else(|| "/".to_string()),
            capabilities: OciCapabilities::default(),
            rlimits: vec![OciRlimit::nofile()],
            no_new_privileges: true,
        },
        root: OciRoot {
            path: spec.rootfs.display().to_string(),
            readonly: true,
        },
        hostname: "jhist".to_string(),
        mounts,
        linux: OciLinux {
            uid_mappings: vec![OciIdMapping {
                container_id: spec.uid,
                host_id: nix::unistd::Uid::current().as_raw(),
                size: 1,
            }],
            gid_mappings: vec![OciIdMapping {
                container_id: spec.gid,
                host_id: nix::unistd::Gid::current().as_raw(),
                size: 1,
            }],
            namespaces: oci::namespaces(),
        },
    })
}

fn bind_mount(dest: &str, source: &Path, writable: bool) -> Result<OciMount> {
    let mut options = vec![
        "rbind".to_string(),
        if writable { "rw" } else { "ro" }.to_string(),
    ];
    // Carry the host's restrictions over; the kernel rejects a remount
    // that silently drops them anyway.
    match procutil::mount_info(source) {
        Ok(Some(entry)) => {
            for flag in ["nodev", "nosuid", "noexec"] {
                if entry.options.iter().any(|o| o == flag) {
                    options.push(flag.to_string());
                }
            }
        }
        Ok(None) => {}
        Err(err) => debug!(source = %source.display(), %err, "mount table lookup failed"),
    }
    Ok(OciMount {
        destination: dest.to_string(),
        fstype: "none".to_string(),
        source: source.display().to_string(),
        options,
    })
}

fn overlay_mount(
    dest: &str,
    lower: &Path,
    workdir: &Path,
    index: &mut usize,
) -> Result<OciMount> {
    let upper = workdir.join(format!("upper/{index}"));
    let work = workdir.join(format!("work/{index}"));
    *index += 1;
    fs::create_dir_all(&upper).with_context(|| format!("creating {}", upper.display()))?;
    fs::create_dir_all(&work).with_context(|| format!("creating {}", work.display()))?;
    let lower = if lower.is_dir() {
        lower.to_path_buf()
    } else {
        // Rootfs images do not always carry every auto-overlaid directory.
        let empty = workdir.join("empty");
        fs::create_dir_all(&empty).with_context(|| format!("creating {}", empty.display()))?;
        empty
    };

    let mut options = vec![
        format!("lowerdir={}", lower.display()),
        format!("upperdir={}", upper.display()),
        format!("workdir={}", work.display()),
        "xino=off".to_string(),
        "metacopy=off".to_string(),
        "index=off".to_string(),
        "redirect_dir=nofollow".to_string(),
    ];
    if procutil::kernel_at_least(5, 11) {
        options.push("userxattr".to_string());
    }
    Ok(OciMount {
        destination: dest.to_string(),
        fstype: "overlay".to_string(),
        source: "overlay".to_string(),
        options,
    })
}

/// Splits a mount key into (destination, explicit writability).
#[must_use]
pub fn split_dest(key: &str) -> (&str, Option<bool>) {
    if let Some(dest) = key.strip_suffix(":ro") {
        (dest, Some(false))
    } else if let Some(dest) = key.strip_suffix(":rw") {
        (dest, Some(true))
    } else {
        (key, None)
    }
}

fn engine_program() -> Result<PathBuf> {
    if let Some(raw) = std::env::var_os("JHIST_ENGINE") {
        let path = PathBuf::from(raw);
        if path.exists() {
            return Ok(path);
        }
        return Err(anyhow!("JHIST_ENGINE points at {}, which does not exist", path.display()));
    }
    which::which(ENGINE_PROGRAM)
        .map_err(|_| anyhow!("container engine '{ENGINE_PROGRAM}' not found on PATH"))
}

/// Removes a sandbox workdir. Overlay upper layers can come back with
/// unsearchable directories on kernels without `userxattr`; opening them
/// up first makes removal reliable there.
fn remove_workdir(workdir: &Path) -> Result<()> {
    if !workdir.exists() {
        return Ok(());
    }
    if !procutil::kernel_at_least(5, 11) {
        use std::os::unix::fs::PermissionsExt;
        for entry in walkdir::WalkDir::new(workdir).into_iter().flatten() {
            if !entry.file_type().is_symlink() {
                let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o777));
            }
        }
    }
    fs::remove_dir_all(workdir).with_context(|| format!("removing {}", workdir.display()))
}
