//! Pack planning and construction.
//!
//! A version's commit list partitions into consecutive fixed-size chunks,
//! each named after its first commit. The plan is prefix-stable: new
//! commits at the branch tip only append chunks, so already-finalized
//! packs never need to move. Every pack except the last is finalized as
//! soon as its builds join; the last stays loose so tomorrow's commits can
//! extend it without unpacking.

use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::builder::{self, BuildRequest};
use crate::config::Config;
use crate::error::{BuildFailure, BuildOutcome};
use crate::mirror::Mirror;
use crate::progress::BuildTicker;
use crate::store::{self, Database};
use crate::version::{TargetVersion, PROJECT};

/// Commits per finalized pack.
pub const PACK_SIZE: usize = 250;

#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Concurrent commit builds.
    pub njobs: usize,
    /// Compiler parallelism inside each build.
    pub nthreads: usize,
    pub timeout: Duration,
    pub asserts: bool,
    pub pack_size: usize,
    /// Where per-build scratch trees live; the system tempdir by default.
    pub work_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let njobs = default_jobs();
        Self {
            njobs,
            // njobs concurrent builds each run `make -j nthreads`; the
            // product must stay near the host's parallelism, not square it.
            nthreads: (host_parallelism() / njobs).max(1),
            timeout: Duration::from_secs(3600),
            asserts: false,
            pack_size: PACK_SIZE,
            work_dir: None,
        }
    }
}

/// `JHIST_JOBS` override, else the host's parallelism, clamped to
/// something a single disk survives.
#[must_use]
pub fn default_jobs() -> usize {
    let requested = env::var("JHIST_JOBS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok());
    requested.unwrap_or_else(host_parallelism).clamp(1, 16)
}

fn host_parallelism() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

/// What one `build_version` call did.
#[derive(Debug, Default)]
pub struct VersionReport {
    pub attempted: usize,
    pub built: usize,
    pub skipped_packs: usize,
    pub failed: Vec<(String, BuildFailure)>,
}

impl VersionReport {
    /// A version only counts as failed when work was attempted and none of
    /// it stuck.
    #[must_use]
    pub fn failed_entirely(&self) -> bool {
        self.attempted > 0 && self.built == 0
    }
}

/// The deterministic pack plan for a version: ordered
/// `(pack name, chunk)` pairs.
pub fn commit_packs(
    mirror: &Mirror,
    version: TargetVersion,
    size: usize,
) -> Result<Vec<(String, Vec<String>)>> {
    let commits = mirror.commits(version)?;
    assemble_plan(&commits, size, |rev| mirror.commit_name(rev))
}

/// Chunks `commits` into consecutive slices of `size`, naming each after
/// its first commit.
pub fn assemble_plan(
    commits: &[String],
    size: usize,
    mut name_of: impl FnMut(&str) -> Result<String>,
) -> Result<Vec<(String, Vec<String>)>> {
    let mut plan = Vec::new();
    for chunk in commits.chunks(size.max(1)) {
        let first = &chunk[0];
        let name = name_of(first).with_context(|| format!("naming pack for {first}"))?;
        plan.push((name, chunk.to_vec()));
    }
    Ok(plan)
}

/// Splits a chunk into what still needs building given the loose area.
///
/// Any loose revision outside the chunk is drift from an earlier run; the
/// codec cannot delete single loose objects, so drift purges the whole
/// loose area and the chunk restarts. Otherwise building resumes after the
/// last loose revision that appears in the chunk.
#[must_use]
pub fn resume_plan(chunk: &[String], loose: &[String]) -> (bool, Vec<String>) {
    let drifted = loose.iter().any(|rev| !chunk.contains(rev));
    if drifted {
        return (true, chunk.to_vec());
    }
    let resume_after = chunk.iter().rposition(|rev| loose.contains(rev));
    let start = resume_after.map_or(0, |idx| idx + 1);
    (false, chunk[start..].to_vec())
}

/// Builds every missing pack of `version`, finalizing each one except the
/// last. Per-commit failures are collected; infrastructure failures abort.
pub fn build_version(
    config: &Config,
    mirror: &Mirror,
    version: TargetVersion,
    options: &BuildOptions,
) -> Result<VersionReport> {
    let request_for = |commit: &str| BuildRequest {
        commit: commit.to_string(),
        nproc: options.nthreads,
        timeout: options.timeout,
        asserts: options.asserts,
    };
    build_version_with(config, mirror, version, options, &|commit, source, install| {
        builder::build_commit(config, mirror, &request_for(commit), source, install)
    })
}

/// [`build_version`] with the per-commit build injected, so planning,
/// resumption, and finalization can be exercised without a compiler.
pub fn build_version_with(
    config: &Config,
    mirror: &Mirror,
    version: TargetVersion,
    options: &BuildOptions,
    build: &(dyn Fn(&str, &std::path::Path, &std::path::Path) -> Result<BuildOutcome> + Sync),
) -> Result<VersionReport> {
    let db = Database::open(config, version, options.asserts)?;
    let plan = commit_packs(mirror, version, options.pack_size)?;
    let total = plan.len();
    let mut report = VersionReport::default();

    for (index, (name, chunk)) in plan.iter().enumerate() {
        let safe = store::safe_name(&format!("{PROJECT}-{name}"));
        if store::pack_exists(&db, &safe) {
            report.skipped_packs += 1;
            continue;
        }
        info!(pack = %safe, commits = chunk.len(), "building pack");
        let summary = build_pack(&db, chunk, options, build)?;
        report.attempted += summary.attempted;
        report.built += summary.attempted - summary.failures.len();
        report.failed.extend(summary.failures);

        if index + 1 < total {
            store::pack(&db, &safe)?;
            store::rm_loose(&db)?;
        }
    }
    for (commit, failure) in &report.failed {
        warn!(commit = %commit, %failure, "commit left out of its pack");
    }
    Ok(report)
}

#[derive(Debug, Default)]
pub struct PackSummary {
    pub attempted: usize,
    pub failures: Vec<(String, BuildFailure)>,
}

/// Builds the missing commits of one chunk across the worker pool.
fn build_pack(
    db: &Database,
    chunk: &[String],
    options: &BuildOptions,
    build: &(dyn Fn(&str, &std::path::Path, &std::path::Path) -> Result<BuildOutcome> + Sync),
) -> Result<PackSummary> {
    let listing = store::list(db)?;
    let (purge, to_build) = resume_plan(chunk, &listing.loose);
    if purge {
        warn!(db = db.name(), "loose area drifted from the plan; discarding it");
        store::rm_loose(db)?;
    }
    if to_build.is_empty() {
        return Ok(PackSummary::default());
    }

    let work_root = options
        .work_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&work_root)
        .with_context(|| format!("creating {}", work_root.display()))?;

    let attempted = to_build.len();
    let queue: Mutex<VecDeque<String>> = Mutex::new(to_build.into());
    let failures: Mutex<Vec<(String, BuildFailure)>> = Mutex::new(Vec::new());
    let infra: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
    let abort = AtomicBool::new(false);
    let progress = BuildTicker::new(format!("building {}", db.name()), attempted);

    thread::scope(|scope| {
        for _ in 0..options.njobs.max(1) {
            scope.spawn(|| loop {
                if abort.load(Ordering::Relaxed) {
                    break;
                }
                let Some(commit) = lock(&queue).pop_front() else {
                    break;
                };
                match build_one(db, &commit, &work_root, build) {
                    Ok(Ok(())) => {}
                    Ok(Err(failure)) => lock(&failures).push((commit, failure)),
                    Err(err) => {
                        lock(&infra).push(err.context(format!("building {commit}")));
                        abort.store(true, Ordering::Relaxed);
                        break;
                    }
                }
                progress.tick();
            });
        }
    });

    let mut infra = infra.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    let failures = failures
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(err) = infra.pop() {
        drop(progress);
        return Err(err);
    }
    progress.close(format!(
        "{} of {attempted} commit(s) built",
        attempted - failures.len()
    ));
    Ok(PackSummary {
        attempted,
        failures,
    })
}

fn build_one(
    db: &Database,
    commit: &str,
    work_root: &std::path::Path,
    build: &(dyn Fn(&str, &std::path::Path, &std::path::Path) -> Result<BuildOutcome> + Sync),
) -> Result<BuildOutcome> {
    let source = tempfile::Builder::new()
        .prefix("jhist-source-")
        .tempdir_in(work_root)
        .context("creating source scratch dir")?;
    let install = tempfile::Builder::new()
        .prefix("jhist-install-")
        .tempdir_in(work_root)
        .context("creating install scratch dir")?;

    match build(commit, source.path(), install.path())? {
        Ok(()) => {
            store::store(db, commit, install.path())?;
            Ok(Ok(()))
        }
        Err(failure) => Ok(Err(failure)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn rev(fill: u8) -> String {
        (fill as char).to_string().repeat(40)
    }

    fn revs(fills: &[u8]) -> Vec<String> {
        fills.iter().map(|f| rev(*f)).collect()
    }

    #[test]
    fn plan_chunks_by_size_and_names_by_first_commit() {
        let commits = revs(b"abcdefg");
        let plan = assemble_plan(&commits, 3, |first| Ok(format!("name-{}", &first[..1])))
            .expect("plan");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], ("name-a".to_string(), revs(b"abc")));
        assert_eq!(plan[1], ("name-d".to_string(), revs(b"def")));
        assert_eq!(plan[2], ("name-g".to_string(), revs(b"g")));
    }

    #[test]
    fn plan_is_prefix_stable_as_the_branch_grows() {
        let name = |first: &str| Ok(format!("name-{}", &first[..1]));
        let early = assemble_plan(&revs(b"abcde"), 3, name).expect("plan");
        let later = assemble_plan(&revs(b"abcdefgh"), 3, name).expect("plan");
        // Every fully-filled early chunk survives unchanged.
        assert_eq!(early[0], later[0]);
        assert_eq!(later[1].1, revs(b"def"));
    }

    #[test]
    fn resume_skips_past_the_last_loose_commit() {
        let chunk = revs(b"abcde");
        let loose = revs(b"ab");
        let (purge, to_build) = resume_plan(&chunk, &loose);
        assert!(!purge);
        assert_eq!(to_build, revs(b"cde"));
    }

    #[test]
    fn foreign_loose_objects_force_a_purge() {
        let chunk = revs(b"abcde");
        let loose = revs(b"xy");
        let (purge, to_build) = resume_plan(&chunk, &loose);
        assert!(purge);
        assert_eq!(to_build, chunk);
    }

    #[test]
    fn empty_loose_area_builds_everything() {
        let chunk = revs(b"abc");
        let (purge, to_build) = resume_plan(&chunk, &[]);
        assert!(!purge);
        assert_eq!(to_build, chunk);
    }

    // The build_version path below needs git for the mirror fixture.
    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn upstream_fixture(root: &std::path::Path) -> Mirror {
        let upstream = root.join("upstream");
        fs::create_dir_all(&upstream).expect("mkdir");
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(&upstream)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?} failed");
        };
        git(&["init", "--initial-branch", "master", "."]);
        fs::write(upstream.join("VERSION"), "1.10.0-DEV\n").expect("VERSION");
        for step in 0..3 {
            fs::write(upstream.join("work.jl"), format!("step = {step}\n")).expect("file");
            git(&["add", "-A"]);
            git(&[
                "-c",
                "user.name=t",
                "-c",
                "user.email=t@example.com",
                "commit",
                "-m",
                "step",
            ]);
        }
        let config = testing::config_at(root);
        Mirror::with_upstream(&config, upstream.display().to_string())
    }

    #[test]
    fn build_version_finalizes_all_but_the_last_pack() {
        if !git_available() {
            return;
        }
        let _env = testing::env_guard();
        let temp = tempdir().expect("tempdir");
        testing::install_fake_codec(temp.path());
        let config = testing::config_at(temp.path());
        let mirror = upstream_fixture(temp.path());
        let version = TargetVersion::new(1, 10);

        let options = BuildOptions {
            njobs: 2,
            pack_size: 2,
            ..BuildOptions::default()
        };
        let calls = AtomicUsize::new(0);
        let report = build_version_with(&config, &mirror, version, &options, &|_, _, install| {
            calls.fetch_add(1, Ordering::Relaxed);
            fs::create_dir_all(install.join("bin")).expect("bin");
            fs::write(install.join("bin/julia"), "#!/bin/true\n").expect("binary");
            Ok(Ok(()))
        })
        .expect("build_version");

        // Three commits, chunked in twos: one finalized pack, one loose.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.built, 3);
        assert!(!report.failed_entirely());

        let db = Database::open(&config, version, false).expect("db");
        let listing = store::list(&db).expect("list");
        assert_eq!(listing.packed.len(), 1, "exactly one finalized pack");
        assert_eq!(listing.loose.len(), 1, "the last chunk stays loose");

        // A second run plans identically, skips the finalized pack, and
        // resumes cleanly past the loose commit.
        let report = build_version_with(&config, &mirror, version, &options, &|_, _, _| {
            panic!("nothing left to build")
        })
        .expect("idempotent rerun");
        assert_eq!(report.skipped_packs, 1);
        assert_eq!(report.attempted, 0);
    }

    #[test]
    fn per_commit_failures_do_not_abort_the_pack() {
        if !git_available() {
            return;
        }
        let _env = testing::env_guard();
        let temp = tempdir().expect("tempdir");
        testing::install_fake_codec(temp.path());
        let config = testing::config_at(temp.path());
        let mirror = upstream_fixture(temp.path());
        let version = TargetVersion::new(1, 10);

        let options = BuildOptions {
            njobs: 1,
            pack_size: 10,
            ..BuildOptions::default()
        };
        let commits = mirror.commits(version).expect("commits");
        let poison = commits[1].clone();
        let report = build_version_with(&config, &mirror, version, &options, &|commit, _, install| {
            if commit == poison {
                return Ok(Err(crate::error::BuildFailure {
                    reason: crate::error::FailureReason::BuildFailed,
                    exit_code: 2,
                    term_signal: 0,
                    log: "make: *** [all] Error 2".to_string(),
                }));
            }
            fs::create_dir_all(install.join("bin")).expect("bin");
            fs::write(install.join("bin/julia"), "").expect("binary");
            Ok(Ok(()))
        })
        .expect("build_version");

        assert_eq!(report.attempted, 3);
        assert_eq!(report.built, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, poison);
        assert!(!report.failed_entirely());

        // The failed commit is simply absent from the store.
        let db = Database::open(&config, version, false).expect("db");
        let listing = store::list(&db).expect("list");
        assert!(!listing.contains(&poison));
        assert_eq!(listing.stored_count(), 2);
    }
}
