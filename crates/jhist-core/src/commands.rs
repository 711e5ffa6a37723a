//! The operations the CLI dispatches to, one function per sub-command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::Config;
use crate::error::ArchiveError;
use crate::mirror::Mirror;
use crate::planner::{self, BuildOptions};
use crate::process::{run_proxied, RunOutput};
use crate::store::{self, Database};
use crate::verify::{self, StatusReport, VerifyReport};
use crate::version::{TargetVersion, VersionSpec};

#[derive(Clone, Debug, Default)]
pub struct BuildRequest {
    /// Version specs (`X.Y`, `X.Y+`, `X.Y-A.B`); the newest release line
    /// when empty.
    pub versions: Vec<String>,
    pub asserts: bool,
    pub jobs: Option<usize>,
    pub threads: Option<usize>,
    pub timeout: Option<Duration>,
    pub work_dir: Option<PathBuf>,
}

/// Builds packs for the selected versions. Returns `false` when any
/// version failed entirely.
pub fn build(config: &Config, request: &BuildRequest) -> Result<bool> {
    let mirror = Mirror::new(config);
    let versions = resolve_version_specs(&mirror, &request.versions)?;
    let defaults = BuildOptions::default();
    let options = BuildOptions {
        njobs: request.jobs.unwrap_or(defaults.njobs),
        nthreads: request.threads.unwrap_or(defaults.nthreads),
        timeout: request.timeout.unwrap_or(defaults.timeout),
        asserts: request.asserts,
        work_dir: request.work_dir.clone(),
        ..defaults
    };

    let mut all_ok = true;
    for version in versions {
        info!(%version, asserts = request.asserts, "building version");
        let report = planner::build_version(config, &mirror, version, &options)?;
        for (commit, failure) in &report.failed {
            eprintln!("jhist ▸ {version}: {commit} not built: {failure}");
        }
        eprintln!(
            "jhist ▸ {version}: {} built, {} failed, {} pack(s) already finalized",
            report.built,
            report.failed.len(),
            report.skipped_packs
        );
        if report.failed_entirely() {
            all_ok = false;
        }
    }
    Ok(all_ok)
}

/// Extracts `rev_spec` into a scratch directory and executes the
/// interpreter with `args`, proxying stdio. The caller owns exit-code and
/// signal fidelity.
pub fn run(config: &Config, rev_spec: &str, args: &[String]) -> Result<RunOutput> {
    let mirror = Mirror::new(config);
    let (db, rev) = locate(config, &mirror, rev_spec)?;
    let scratch = tempfile::Builder::new()
        .prefix("jhist-run-")
        .tempdir()
        .context("creating extraction directory")?;
    store::extract_readonly(config, &db, &rev, scratch.path())?;

    let julia = scratch.path().join("bin/julia");
    if !julia.is_file() {
        bail!("extracted tree for {rev} has no bin/julia");
    }
    run_proxied(&julia.display().to_string(), args, &[], scratch.path())
}

/// Extracts `rev_spec` into `dest` without mutating the store.
pub fn extract(config: &Config, rev_spec: &str, dest: &Path) -> Result<()> {
    let mirror = Mirror::new(config);
    let (db, rev) = locate(config, &mirror, rev_spec)?;
    store::extract_readonly(config, &db, &rev, dest)?;
    info!(%rev, dest = %dest.display(), "extracted");
    Ok(())
}

// Resolves a revision spec and finds the database that stores it. The
// asserts variant is only reachable through `build`; run/extract serve the
// plain archive.
fn locate(config: &Config, mirror: &Mirror, rev_spec: &str) -> Result<(Database, String)> {
    let rev = mirror.lookup(rev_spec)?;
    let version = mirror.commit_version(&rev)?;
    let db = Database::open(config, version, false)?;
    let listing = store::list(&db)?;
    if !listing.contains(&rev) {
        return Err(ArchiveError::RevisionNotStored { rev, version }.into());
    }
    Ok((db, rev))
}

/// Verifies the selected versions' packs; `fix` deletes offenders.
pub fn verify(
    config: &Config,
    versions: &[String],
    asserts: bool,
    fix: bool,
) -> Result<Vec<VerifyReport>> {
    let mirror = Mirror::new(config);
    let versions = resolve_version_specs(&mirror, versions)?;
    versions
        .into_iter()
        .map(|version| verify::verify_version(config, &mirror, version, asserts, fix))
        .collect()
}

/// Status of the selected versions (all known ones when `version` is
/// empty).
pub fn status(config: &Config, version: Option<&str>, asserts: bool) -> Result<Vec<StatusReport>> {
    let mirror = Mirror::new(config);
    let specs: Vec<String> = version.map(|v| vec![v.to_string()]).unwrap_or_default();
    let versions = if specs.is_empty() {
        all_versions(&mirror)?
    } else {
        resolve_version_specs(&mirror, &specs)?
    };
    versions
        .into_iter()
        .map(|version| verify::status_version(config, &mirror, version, asserts))
        .collect()
}

fn all_versions(mirror: &Mirror) -> Result<Vec<TargetVersion>> {
    Ok(mirror.branch_commits()?.into_keys().collect())
}

/// Expands version specs against the mirror's known release lines; with no
/// specs the newest line is selected.
fn resolve_version_specs(mirror: &Mirror, specs: &[String]) -> Result<Vec<TargetVersion>> {
    let known = all_versions(mirror)?;
    if specs.is_empty() {
        let newest = known
            .into_iter()
            .max()
            .ok_or_else(|| anyhow::anyhow!("no release lines known to the mirror"))?;
        return Ok(vec![newest]);
    }
    let mut selected = Vec::new();
    for spec in specs {
        let matched = VersionSpec::parse(spec)?.select(&known);
        if matched.is_empty() {
            bail!("version spec '{spec}' matches no known release line");
        }
        for version in matched {
            if !selected.contains(&version) {
                selected.push(version);
            }
        }
    }
    selected.sort();
    Ok(selected)
}
