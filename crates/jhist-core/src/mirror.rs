//! Bare mirror of the upstream Julia repository.
//!
//! Everything goes through the `git` binary, like the rest of the external
//! tooling. The mirror tracks `master` and the `release-*` branches;
//! working trees for builds are materialized as local detached clones so
//! the mirror's own refs never move underneath concurrent readers.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ArchiveError;
use crate::process::{run_command, RunOutput};
use crate::version::{parse_version_file, TargetVersion};

const UPSTREAM_URL: &str = "https://github.com/JuliaLang/julia.git";
const MIRROR_DIR: &str = "julia.git";

/// Default staleness bound before `update` refetches.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

/// Walking branch points back from master stops once this release line is
/// recorded; older lines predate the archive.
const OLDEST_TRACKED: TargetVersion = TargetVersion::new(1, 6);

pub struct Mirror {
    path: PathBuf,
    upstream: String,
    update_lock: Mutex<()>,
}

impl Mirror {
    pub fn new(config: &Config) -> Self {
        let upstream =
            std::env::var("JHIST_UPSTREAM").unwrap_or_else(|_| UPSTREAM_URL.to_string());
        Self::with_upstream(config, upstream)
    }

    pub fn with_upstream(config: &Config, upstream: impl Into<String>) -> Self {
        Self {
            path: config.downloads_dir.join(MIRROR_DIR),
            upstream: upstream.into(),
            update_lock: Mutex::new(()),
        }
    }

    /// The mirror directory, cloned on first use.
    pub fn repo_path(&self) -> Result<&Path> {
        self.ensure()?;
        Ok(&self.path)
    }

    fn ensure(&self) -> Result<()> {
        if self.path.join("HEAD").exists() {
            return Ok(());
        }
        let _guard = lock(&self.update_lock);
        if self.path.join("HEAD").exists() {
            return Ok(());
        }
        info!(upstream = %self.upstream, "creating source mirror");
        fs::create_dir_all(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        git_ok(&self.path, &["init", "--bare", "--initial-branch", "master", "."])?;
        self.fetch()?;
        Ok(())
    }

    fn fetch(&self) -> Result<()> {
        // git's auto-gc leaves gc.log behind after a failure and then
        // refuses to gc again until it is removed.
        let gc_log = self.path.join("gc.log");
        if gc_log.exists() {
            let _ = fs::remove_file(&gc_log);
        }
        git_ok(
            &self.path,
            &[
                "fetch",
                "--prune",
                &self.upstream,
                "+refs/heads/master:refs/heads/master",
                "+refs/heads/release-*:refs/heads/release-*",
            ],
        )?;
        Ok(())
    }

    /// Refreshes the mirror when `FETCH_HEAD` is older than `max_age` or
    /// `force` is set. Double-checked around the update lock so a worker
    /// pool triggers at most one fetch.
    pub fn update(&self, max_age: Duration, force: bool) -> Result<()> {
        self.ensure()?;
        if !force && self.fresh(max_age) {
            return Ok(());
        }
        let _guard = lock(&self.update_lock);
        if !force && self.fresh(max_age) {
            return Ok(());
        }
        debug!(mirror = %self.path.display(), "updating source mirror");
        self.fetch()
    }

    fn fresh(&self, max_age: Duration) -> bool {
        let Ok(meta) = fs::metadata(self.path.join("FETCH_HEAD")) else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(mtime)
            .map(|age| age < max_age)
            .unwrap_or(true)
    }

    /// Whether `rev` names an object the mirror already has.
    pub fn verify(&self, rev: &str) -> Result<bool> {
        self.ensure()?;
        Ok(self.rev_parse(rev)?.is_some())
    }

    /// Resolves a user-facing spec (branch, tag, short or full hash) to a
    /// full 40-character revision. Tracked branch tips are refreshed first;
    /// anything else resolves locally, with one forced update retry before
    /// giving up.
    pub fn lookup(&self, spec: &str) -> Result<String> {
        self.ensure()?;
        if spec == "master" || spec.starts_with("release-") {
            self.update(DEFAULT_MAX_AGE, true)?;
        }
        if let Some(hash) = self.rev_parse(spec)? {
            return Ok(hash);
        }
        self.update(DEFAULT_MAX_AGE, true)?;
        self.rev_parse(spec)?
            .ok_or_else(|| ArchiveError::RevisionUnknown(spec.to_string()).into())
    }

    fn rev_parse(&self, spec: &str) -> Result<Option<String>> {
        let probe = format!("{spec}^{{commit}}");
        let output = git(&self.path, &["rev-parse", "--verify", "--quiet", &probe])?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Materializes a detached working tree for `rev` at `dir` without
    /// touching the mirror's refs.
    pub fn checkout(&self, rev: &str, dir: &Path) -> Result<()> {
        self.ensure()?;
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        git_ok(
            Path::new("."),
            &[
                "clone",
                "--no-checkout",
                &self.path.display().to_string(),
                &dir.display().to_string(),
            ],
        )?;
        git_ok(
            dir,
            &[
                "-c",
                "advice.detachedHead=false",
                "checkout",
                "--detach",
                rev,
            ],
        )?;
        Ok(())
    }

    fn version_blob(&self, rev: &str) -> Result<Option<String>> {
        let output = git(&self.path, &["show", &format!("{rev}:VERSION")])?;
        if output.success() {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }

    /// The release line `rev` belongs to, from its `VERSION` blob.
    pub fn commit_version(&self, rev: &str) -> Result<TargetVersion> {
        let blob = self
            .version_blob(rev)?
            .ok_or_else(|| anyhow!("revision {rev} has no VERSION file"))?;
        parse_version_file(&blob)
    }

    /// Human-readable name: `<VERSION>.<count>` where count is the number
    /// of commits since line 1 of `VERSION` last changed. Only ever used to
    /// label packs.
    pub fn commit_name(&self, rev: &str) -> Result<String> {
        let blob = self
            .version_blob(rev)?
            .ok_or_else(|| anyhow!("revision {rev} has no VERSION file"))?;
        let bump = self.version_bump_commit(rev)?;
        let output = git_ok(&self.path, &["rev-list", "--count", &format!("{bump}..{rev}")])?;
        let count: u64 = output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("rev-list count for {rev}"))?;
        Ok(format!("{}.{count}", blob.trim()))
    }

    // The commit that last modified line 1 of VERSION as of `rev`.
    fn version_bump_commit(&self, rev: &str) -> Result<String> {
        let output = git_ok(
            &self.path,
            &["blame", "-L1,1", "--porcelain", rev, "--", "VERSION"],
        )?;
        let first = output
            .stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("empty blame output for {rev}:VERSION"))?;
        let hash = first
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("unparseable blame output for {rev}:VERSION"))?;
        Ok(hash.to_string())
    }

    /// Branch points per release line, walking backward from master until
    /// [`OLDEST_TRACKED`] is recorded (or history runs out). The stored
    /// revision for a version is the commit that bumped `VERSION` to it.
    pub fn branch_commits(&self) -> Result<BTreeMap<TargetVersion, String>> {
        let mut points = BTreeMap::new();
        let mut cursor = self.lookup("master")?;
        loop {
            let bump = self.version_bump_commit(&cursor)?;
            let version = self.commit_version(&bump)?;
            points.entry(version).or_insert_with(|| bump.clone());
            if version <= OLDEST_TRACKED {
                break;
            }
            match self.rev_parse(&format!("{bump}^"))? {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        Ok(points)
    }

    /// The branch carrying a release line: `master` for the newest known
    /// line, `release-X.Y` otherwise.
    pub fn branch_name(&self, version: TargetVersion) -> Result<String> {
        let points = self.branch_commits()?;
        self.branch_name_in(version, &points)
    }

    fn branch_name_in(
        &self,
        version: TargetVersion,
        points: &BTreeMap<TargetVersion, String>,
    ) -> Result<String> {
        let newest = points
            .keys()
            .max()
            .ok_or_else(|| anyhow!("no release lines known to the mirror"))?;
        if version == *newest {
            Ok("master".to_string())
        } else {
            Ok(format!("release-{version}"))
        }
    }

    /// Topologically ordered (oldest first) revisions of a release line,
    /// from its branch point to the branch tip, restricted to commits that
    /// carry a `VERSION` blob (merged foreign histories do not).
    pub fn commits(&self, version: TargetVersion) -> Result<Vec<String>> {
        let points = self.branch_commits()?;
        let point = points
            .get(&version)
            .ok_or_else(|| anyhow!("version {version} has no known branch point"))?;
        let branch = self.branch_name_in(version, &points)?;
        // `<point>~..<branch>` keeps the branch point itself in range; a
        // rootless branch point means the whole branch is in scope.
        let range = if self.rev_parse(&format!("{point}^"))?.is_some() {
            format!("{point}~..{branch}")
        } else {
            branch.clone()
        };
        let output = git_ok(
            &self.path,
            &["rev-list", "--reverse", "--topo-order", &range],
        )?;
        let revs: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        self.filter_version_commits(revs)
    }

    // Batch `cat-file --batch-check` so a 2000-commit branch does not cost
    // 2000 subprocesses.
    fn filter_version_commits(&self, revs: Vec<String>) -> Result<Vec<String>> {
        if revs.is_empty() {
            return Ok(revs);
        }
        let mut child = Command::new("git")
            .args(["cat-file", "--batch-check"])
            .current_dir(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to start git cat-file")?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("git cat-file stdin unavailable"))?;
            for rev in &revs {
                writeln!(stdin, "{rev}:VERSION").context("writing to git cat-file")?;
            }
        }
        let output = child
            .wait_with_output()
            .context("waiting for git cat-file")?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let keep: Vec<bool> = stdout
            .lines()
            .map(|line| !line.ends_with("missing"))
            .collect();
        if keep.len() != revs.len() {
            bail!("git cat-file answered {} of {} probes", keep.len(), revs.len());
        }
        Ok(revs
            .into_iter()
            .zip(keep)
            .filter_map(|(rev, keep)| keep.then_some(rev))
            .collect())
    }
}

fn lock(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn git(cwd: &Path, args: &[&str]) -> Result<RunOutput> {
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    run_command("git", &args, &[], cwd)
}

fn git_ok(cwd: &Path, args: &[&str]) -> Result<RunOutput> {
    let output = git(cwd, args)?;
    if !output.success() {
        bail!(
            "git {} failed (exit code {}): {}",
            args.first().copied().unwrap_or("?"),
            output.code,
            output.stderr.trim()
        );
    }
    Ok(output)
}
