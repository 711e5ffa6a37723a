//! One commit's build pipeline: materialize source, populate the shared
//! dependency cache, compile inside the sandbox, smoke-test, trim.
//!
//! Concurrency lives in the planner; this module builds exactly one commit
//! into an install tree the store can ingest.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::artifact;
use crate::config::Config;
use crate::error::{BuildFailure, BuildOutcome, FailureReason};
use crate::mirror::Mirror;
use crate::sandbox::{self, MountSpec, SandboxSpec};

/// Builds run as this uid/gid inside the user namespace; Julia's build
/// system refuses to run as root.
const BUILD_UID: u32 = 1000;
const BUILD_GID: u32 = 1000;

/// Lines of combined build log carried inside a [`BuildFailure`].
const FAILURE_LOG_LINES: usize = 100;
/// Lines of build log echoed into a smoke-test diagnostic.
const SMOKE_LOG_LINES: usize = 50;

/// The shared dependency cache is copied in and out of build trees under
/// one lock so concurrent builds do not interleave partial downloads.
static SRCCACHE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub commit: String,
    pub nproc: usize,
    pub timeout: Duration,
    pub asserts: bool,
}

impl BuildRequest {
    #[must_use]
    pub fn new(commit: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            nproc: 1,
            timeout: Duration::from_secs(3600),
            asserts: false,
        }
    }
}

/// Build script run inside the sandbox. gfortran only has to answer the
/// version probe; historical upstream checksums rot, so the checksum
/// helper is patched to accept what mirrors serve today; the doc build is
/// stubbed out entirely.
const BUILD_SCRIPT: &str = r#"set -ex
mkdir -p /tmp/bin
cat > /tmp/bin/gfortran <<'EOF'
#!/bin/sh
echo "GNU Fortran (GCC) 9.0.0"
EOF
chmod +x /tmp/bin/gfortran
export PATH=/tmp/bin:$PATH

cd /source
if [ -f deps/tools/jlchecksum ]; then
    sed -i.orig -e 's/exit 2$/exit 0/' deps/tools/jlchecksum || true
fi
if [ -f doc/Makefile ]; then
    printf 'default:\n' > doc/Makefile
    mkdir -p doc/_build/html
    touch doc/_build/html/.stamp
fi
make -j${nproc} binary-dist
mv julia-*/* /install/
"#;

/// Builds `request.commit` into `install_dir`, using `source_dir` as the
/// working tree. Both directories must exist and be empty; the caller owns
/// their cleanup. Infrastructure problems (mirror, sandbox, filesystem)
/// come back as errors; a failed build comes back as `Ok(Err(_))`.
pub fn build_commit(
    config: &Config,
    mirror: &Mirror,
    request: &BuildRequest,
    source_dir: &Path,
    install_dir: &Path,
) -> Result<BuildOutcome> {
    let log = Arc::new(Mutex::new(Vec::new()));
    mirror.checkout(&request.commit, source_dir)?;
    populate_srccache(config, source_dir, &log);
    write_make_user(source_dir, request.asserts)?;

    let rootfs = artifact::ensure_rootfs(config)?;
    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/source:rw".to_string(),
        MountSpec::Bind {
            source: source_dir.to_path_buf(),
            writable: true,
        },
    );
    mounts.insert(
        "/install:rw".to_string(),
        MountSpec::Bind {
            source: install_dir.to_path_buf(),
            writable: true,
        },
    );
    let spec = SandboxSpec {
        name: format!("jhist-build-{}", short(&request.commit)),
        rootfs: rootfs.clone(),
        mounts,
        env: vec![("nproc".to_string(), request.nproc.to_string())],
        uid: BUILD_UID,
        gid: BUILD_GID,
        cwd: Some("/source".to_string()),
    };
    let command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        BUILD_SCRIPT.to_string(),
    ];
    let run = sandbox::run_logged(config, &spec, &command, &log, Some(request.timeout))?;
    if run.timed_out {
        return Ok(Err(failure(FailureReason::Timeout, run.code, run.term_signal, &log)));
    }
    if run.code != 0 || run.term_signal != 0 {
        return Ok(Err(failure(
            FailureReason::BuildFailed,
            run.code,
            run.term_signal,
            &log,
        )));
    }

    if let Err(smoke) = smoke_test(config, &rootfs, &request.commit, install_dir, &log)? {
        return Ok(Err(smoke));
    }

    for doc in ["share/doc", "share/man"] {
        let dir = install_dir.join(doc);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        }
    }
    debug!(commit = %request.commit, "build complete");
    Ok(Ok(()))
}

/// The installed interpreter must at least evaluate an integer literal.
fn smoke_test(
    config: &Config,
    rootfs: &Path,
    commit: &str,
    install_dir: &Path,
    log: &Arc<Mutex<Vec<String>>>,
) -> Result<BuildOutcome> {
    let diagnose = |code: i32, signal: i32| {
        let mut diagnostic = vec!["install tree:".to_string()];
        diagnostic.extend(dir_listing(install_dir));
        diagnostic.push("build log tail:".to_string());
        if let Ok(log) = log.lock() {
            diagnostic.extend(tail(&log, SMOKE_LOG_LINES));
        }
        BuildFailure {
            reason: FailureReason::SmokeTestFailed,
            exit_code: code,
            term_signal: signal,
            log: diagnostic.join("\n"),
        }
    };

    if !install_dir.join("bin/julia").exists() {
        return Ok(Err(diagnose(-1, 0)));
    }
    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/install:ro".to_string(),
        MountSpec::Bind {
            source: install_dir.to_path_buf(),
            writable: false,
        },
    );
    let spec = SandboxSpec {
        name: format!("jhist-smoke-{}", short(commit)),
        rootfs: rootfs.to_path_buf(),
        mounts,
        env: Vec::new(),
        uid: BUILD_UID,
        gid: BUILD_GID,
        cwd: Some("/install".to_string()),
    };
    let command = vec![
        "/install/bin/julia".to_string(),
        "-e".to_string(),
        "42".to_string(),
    ];
    let output = sandbox::run(config, &spec, &command)?;
    if output.success() {
        Ok(Ok(()))
    } else {
        Ok(Err(diagnose(output.code, output.term_signal)))
    }
}

/// Seeds `deps/srccache` from the shared cache, lets the build's own
/// `make getall` fill gaps, and copies anything new back. A failure here
/// just means the build downloads more itself.
fn populate_srccache(config: &Config, source_dir: &Path, log: &Arc<Mutex<Vec<String>>>) {
    let _guard = SRCCACHE_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let shared = config.srccache_dir();
    let local = source_dir.join("deps/srccache");
    if let Err(err) = fs::create_dir_all(&shared).and_then(|()| fs::create_dir_all(&local)) {
        warn!(%err, "srccache directories unavailable");
        return;
    }
    if let Err(err) = copy_missing(&shared, &local) {
        warn!(%err, "seeding srccache failed");
        return;
    }

    let rootfs = match artifact::ensure_rootfs(config) {
        Ok(rootfs) => rootfs,
        Err(err) => {
            warn!(%err, "srccache prefetch skipped");
            return;
        }
    };
    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/source:rw".to_string(),
        MountSpec::Bind {
            source: source_dir.to_path_buf(),
            writable: true,
        },
    );
    let spec = SandboxSpec {
        name: "jhist-srccache".to_string(),
        rootfs,
        mounts,
        env: Vec::new(),
        uid: BUILD_UID,
        gid: BUILD_GID,
        cwd: Some("/source".to_string()),
    };
    let command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "make -C deps getall NO_GIT=1".to_string(),
    ];
    match sandbox::run_logged(config, &spec, &command, log, None) {
        Ok(run) if run.code == 0 => {}
        Ok(run) => warn!(code = run.code, "srccache prefetch exited nonzero"),
        Err(err) => warn!(%err, "srccache prefetch failed"),
    }
    if let Err(err) = copy_missing(&local, &shared) {
        warn!(%err, "srccache copy-back failed");
    }
}

/// Writes the `Make.user` that pins the build's compilation envelope.
pub fn write_make_user(source_dir: &Path, asserts: bool) -> Result<()> {
    let target = cpu_target(std::env::consts::ARCH)
        .ok_or_else(|| anyhow!("no CPU target table for {}", std::env::consts::ARCH))?;
    let mut contents = format!(
        "JULIA_CPU_TARGET={target}\n\
         CFLAGS=-ffunction-sections -fdata-sections\n\
         CXXFLAGS=-ffunction-sections -fdata-sections\n"
    );
    if asserts {
        contents.push_str("FORCE_ASSERTIONS=1\nLLVM_ASSERTIONS=1\n");
    }
    let path = source_dir.join("Make.user");
    fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))
}

/// Multi-versioned CPU targets per architecture. Section-split codegen plus
/// these fixed targets keep consecutive commits byte-similar, which the
/// pack-level delta compression depends on.
#[must_use]
pub fn cpu_target(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("generic;sandybridge,-xsaveopt,clone_all;haswell,-rdrnd,base(1)"),
        "x86" => Some("pentium4;sandybridge,-xsaveopt,clone_all"),
        "arm" => Some("armv7-a;armv7-a,neon;armv7-a,neon,vfp4"),
        "aarch64" => Some("generic;cortex-a57;thunderx2t99;carmel"),
        "powerpc64" => Some("pwr8"),
        _ => None,
    }
}

/// Last `n` lines, allocation-light.
#[must_use]
pub fn tail(lines: &[String], n: usize) -> Vec<String> {
    lines[lines.len().saturating_sub(n)..].to_vec()
}

fn failure(
    reason: FailureReason,
    exit_code: i32,
    term_signal: i32,
    log: &Arc<Mutex<Vec<String>>>,
) -> BuildFailure {
    let log = log
        .lock()
        .map(|lines| tail(&lines, FAILURE_LOG_LINES).join("\n"))
        .unwrap_or_default();
    BuildFailure {
        reason,
        exit_code,
        term_signal,
        log,
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

fn dir_listing(dir: &Path) -> Vec<String> {
    let mut listing: Vec<String> = walkdir::WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .filter(|rel| !rel.as_os_str().is_empty())
                .map(|rel| format!("  {}", rel.display()))
        })
        .collect();
    listing.sort();
    listing
}

fn copy_missing(src: &Path, dst: &Path) -> std::io::Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copied += copy_missing(&from, &to)?;
        } else if !to.exists() {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cpu_targets_are_pinned_per_architecture() {
        assert_eq!(
            cpu_target("x86_64").unwrap(),
            "generic;sandybridge,-xsaveopt,clone_all;haswell,-rdrnd,base(1)"
        );
        assert_eq!(cpu_target("x86").unwrap(), "pentium4;sandybridge,-xsaveopt,clone_all");
        assert_eq!(
            cpu_target("arm").unwrap(),
            "armv7-a;armv7-a,neon;armv7-a,neon,vfp4"
        );
        assert_eq!(cpu_target("aarch64").unwrap(), "generic;cortex-a57;thunderx2t99;carmel");
        assert_eq!(cpu_target("powerpc64").unwrap(), "pwr8");
        assert!(cpu_target("riscv64").is_none());
    }

    #[test]
    fn make_user_pins_sections_and_optionally_asserts() {
        let temp = tempdir().expect("tempdir");
        write_make_user(temp.path(), false).expect("write");
        let plain = fs::read_to_string(temp.path().join("Make.user")).expect("read");
        assert!(plain.contains("JULIA_CPU_TARGET="));
        assert!(plain.contains("CFLAGS=-ffunction-sections -fdata-sections"));
        assert!(plain.contains("CXXFLAGS=-ffunction-sections -fdata-sections"));
        assert!(!plain.contains("FORCE_ASSERTIONS"));

        write_make_user(temp.path(), true).expect("write");
        let asserts = fs::read_to_string(temp.path().join("Make.user")).expect("read");
        assert!(asserts.contains("FORCE_ASSERTIONS=1"));
        assert!(asserts.contains("LLVM_ASSERTIONS=1"));
    }

    #[test]
    fn tail_keeps_only_the_end() {
        let lines: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(tail(&lines, 3), vec!["7", "8", "9"]);
        assert_eq!(tail(&lines, 100).len(), 10);
        assert!(tail(&[], 5).is_empty());
    }

    #[test]
    fn missing_files_copy_once() {
        let temp = tempdir().expect("tempdir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("nested")).expect("mkdir");
        fs::create_dir_all(&dst).expect("mkdir");
        fs::write(src.join("a.tar.gz"), "one").expect("write");
        fs::write(src.join("nested/b.tar.gz"), "two").expect("write");
        fs::write(dst.join("a.tar.gz"), "already here").expect("write");

        let copied = copy_missing(&src, &dst).expect("copy");
        assert_eq!(copied, 1);
        // Existing files are never clobbered.
        assert_eq!(fs::read_to_string(dst.join("a.tar.gz")).expect("read"), "already here");
        assert_eq!(fs::read_to_string(dst.join("nested/b.tar.gz")).expect("read"), "two");
    }
}
