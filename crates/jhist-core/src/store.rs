//! Pack databases: the content-addressed store behind the archive.
//!
//! Each database wraps the external delta-pack codec. Finalized packs are
//! immutable pairs of `<name>.pack` + `<name>.pack.idx` under `packs/`;
//! objects not yet packed live in the transient loose area. The codec's
//! wire format is opaque here; this module owns invocation, listing
//! parsing, serialization of mutations, and the metadata sidecar handoff.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::artifact;
use crate::config::Config;
use crate::error::ArchiveError;
use crate::meta;
use crate::process::{run_command, RunOutput};
use crate::sandbox::{self, MountSpec, SandboxSpec};
use crate::version::TargetVersion;

/// Default codec binary name, overridable via `JHIST_CODEC`.
const CODEC_PROGRAM: &str = "jhist-pack";

/// One pack database: the unit of storage isolation, one per target minor
/// version (and its `-asserts` variant).
#[derive(Clone, Debug)]
pub struct Database {
    name: String,
    dir: PathBuf,
}

impl Database {
    /// Opens (creating on first use) the database for a target version.
    pub fn open(config: &Config, version: TargetVersion, asserts: bool) -> Result<Self> {
        let name = version.database_name(asserts);
        let dir = config.database_dir(&name);
        fs::create_dir_all(dir.join("packs"))
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { name, dir })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn pack_path(&self, safe: &str) -> PathBuf {
        self.dir.join("packs").join(format!("{safe}.pack"))
    }
}

/// Everything the codec currently holds for one database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreListing {
    pub loose: Vec<String>,
    pub packed: BTreeMap<String, Vec<String>>,
}

impl StoreListing {
    #[must_use]
    pub fn contains(&self, rev: &str) -> bool {
        self.loose.iter().any(|r| r == rev)
            || self.packed.values().any(|revs| revs.iter().any(|r| r == rev))
    }

    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.loose.len() + self.packed.values().map(Vec::len).sum::<usize>()
    }
}

/// Projects a pack name onto `[A-Za-z0-9_/-]`; anything else becomes `_`.
#[must_use]
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Lists loose and packed revisions.
pub fn list(db: &Database) -> Result<StoreListing> {
    let mutex = db_mutex(db.name());
    let _guard = hold(&mutex);
    let output = codec(db, &["list"], db.dir())?;
    Ok(parse_listing(db.name(), &output.stdout))
}

/// Deposits `dir` as the artifact for `rev`: sidecar first, then the codec
/// ingest, then removal of the source directory. On codec failure the
/// directory is left in place for the caller to clean up.
pub fn store(db: &Database, rev: &str, dir: &Path) -> Result<()> {
    meta::prepare(dir)?;
    {
        let mutex = db_mutex(db.name());
        let _guard = hold(&mutex);
        codec(db, &["store", rev], dir)?;
    }
    fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
    debug!(rev, db = db.name(), "stored artifact");
    Ok(())
}

/// Extracts `rev` into `dir`, clearing pre-existing content, and applies
/// the sidecar.
pub fn extract(db: &Database, rev: &str, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    {
        let mutex = db_mutex(db.name());
        let _guard = hold(&mutex);
        codec(db, &["extract", "--reset", rev], dir)?;
    }
    meta::unprepare(dir)
}

/// Like [`extract`], but guaranteed not to mutate the database directory:
/// the codec runs inside the sandbox with the database as the read-only
/// lower layer of an overlay, so its scratch indices land in a throwaway
/// upper layer. Used whenever the store is shared (e.g. `jhist run` against
/// a database another process may be building into).
pub fn extract_readonly(config: &Config, db: &Database, rev: &str, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let rootfs = artifact::ensure_rootfs(config)?;
    let codec = codec_program()?;
    let codec_dir = codec
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("codec path {} has no parent directory", codec.display()))?;
    let codec_name = codec
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("codec path {} has no file name", codec.display()))?;

    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/store".to_string(),
        MountSpec::Overlay {
            lower: db.dir().to_path_buf(),
        },
    );
    mounts.insert(
        "/work:rw".to_string(),
        MountSpec::Bind {
            source: dir.to_path_buf(),
            writable: true,
        },
    );
    mounts.insert(
        "/codec:ro".to_string(),
        MountSpec::Bind {
            source: codec_dir.to_path_buf(),
            writable: false,
        },
    );

    let spec = SandboxSpec {
        name: format!("jhist-extract-{}", &rev[..rev.len().min(12)]),
        rootfs,
        mounts,
        env: Vec::new(),
        uid: nix::unistd::Uid::current().as_raw(),
        gid: nix::unistd::Gid::current().as_raw(),
        cwd: Some("/work".to_string()),
    };
    let command = vec![
        format!("/codec/{codec_name}"),
        "--db".to_string(),
        "/store".to_string(),
        "extract".to_string(),
        "--reset".to_string(),
        rev.to_string(),
    ];
    let output = sandbox::run(config, &spec, &command)?;
    if !output.success() {
        return Err(codec_error(db.name(), "extract", &output).into());
    }
    meta::unprepare(dir)
}

/// Finalizes all current loose objects into pack `name` (pre-sanitized).
pub fn pack(db: &Database, name: &str) -> Result<()> {
    let mutex = db_mutex(db.name());
    let _guard = hold(&mutex);
    codec(db, &["pack", name], db.dir())?;
    debug!(pack = name, db = db.name(), "finalized pack");
    Ok(())
}

/// Removes the loose staging area outright. The codec has no per-object
/// deletion, so drift recovery and post-finalize cleanup both land here.
pub fn rm_loose(db: &Database) -> Result<()> {
    let mutex = db_mutex(db.name());
    let _guard = hold(&mutex);
    for sub in ["loose", "packs/loose"] {
        let dir = db.dir().join(sub);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing {}", dir.display()));
            }
        }
    }
    Ok(())
}

/// Whether a finalized pack with this (sanitized) name exists.
#[must_use]
pub fn pack_exists(db: &Database, safe: &str) -> bool {
    db.pack_path(safe).exists()
}

/// Deletes a finalized pack whole (both files). Admin-path only: the
/// verifier's `--fix` and nothing else.
pub fn delete_pack(db: &Database, safe: &str) -> Result<()> {
    let mutex = db_mutex(db.name());
    let _guard = hold(&mutex);
    let pack = db.pack_path(safe);
    let idx = pack.with_extension("pack.idx");
    for path in [&pack, &idx] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(())
}

fn codec(db: &Database, args: &[&str], cwd: &Path) -> Result<RunOutput> {
    let program = codec_program()?;
    let mut argv = vec!["--db".to_string(), db.dir().display().to_string()];
    argv.extend(args.iter().map(|s| (*s).to_string()));
    let output = run_command(&program.display().to_string(), &argv, &[], cwd)?;
    if output.success() {
        Ok(output)
    } else {
        Err(codec_error(db.name(), args.first().copied().unwrap_or("?"), &output).into())
    }
}

fn codec_error(database: &str, operation: &str, output: &RunOutput) -> ArchiveError {
    let stderr: Vec<&str> = output.stderr.lines().rev().take(20).collect();
    ArchiveError::Codec {
        database: database.to_string(),
        operation: operation.to_string(),
        code: output.code,
        stderr: stderr.into_iter().rev().collect::<Vec<_>>().join("\n"),
    }
}

fn codec_program() -> Result<PathBuf> {
    if let Some(raw) = std::env::var_os("JHIST_CODEC") {
        let path = PathBuf::from(raw);
        if path.exists() {
            return Ok(path);
        }
        return Err(anyhow!("JHIST_CODEC points at {}, which does not exist", path.display()));
    }
    which::which(CODEC_PROGRAM)
        .map_err(|_| anyhow!("pack codec '{CODEC_PROGRAM}' not found on PATH"))
}

fn parse_listing(db_name: &str, text: &str) -> StoreListing {
    let mut listing = StoreListing::default();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((left, rev)) = trimmed.split_once(':') else {
            warn!(db = db_name, line = trimmed, "unparseable codec listing line");
            continue;
        };
        if !is_revision(rev) {
            warn!(db = db_name, line = trimmed, "listing line without a revision");
            continue;
        }
        if let Some(loose_rev) = left.strip_prefix("loose/") {
            if loose_rev == rev {
                listing.loose.push(rev.to_string());
            } else {
                warn!(db = db_name, line = trimmed, "loose entry names two revisions");
            }
        } else {
            listing.packed.entry(left.to_string()).or_default().push(rev.to_string());
        }
    }
    listing
}

fn is_revision(text: &str) -> bool {
    text.len() == 40 && text.chars().all(|c| c.is_ascii_hexdigit())
}

// One mutex per database name, held across every mutating codec call.
fn db_mutex(db_name: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(Mutex::default);
    let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
    map.entry(db_name.to_string()).or_default().clone()
}

fn hold(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use tempfile::tempdir;

    fn rev(fill: char) -> String {
        fill.to_string().repeat(40)
    }

    fn open_db(config: &Config) -> Database {
        Database::open(config, TargetVersion::new(1, 10), false).expect("open db")
    }

    #[test]
    fn safe_name_is_an_idempotent_projection() {
        assert_eq!(safe_name("julia-1.10.0-DEV.123"), "julia-1_10_0-DEV_123");
        assert_eq!(safe_name("a/b_c-D9"), "a/b_c-D9");
        let once = safe_name("weird name+§");
        assert_eq!(safe_name(&once), once);
        assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || "_/-".contains(c)));
    }

    #[test]
    fn listing_parse_splits_loose_and_packed() {
        let a = rev('a');
        let b = rev('b');
        let c = rev('c');
        let text = format!(
            "loose/{a}:{a}\njulia-1_10_0-DEV_1:{b}\njulia-1_10_0-DEV_1:{c}\n\ngarbage\ntrash:notarev\n"
        );
        let listing = parse_listing("julia-1.10", &text);
        assert_eq!(listing.loose, vec![a.clone()]);
        assert_eq!(listing.packed.len(), 1);
        assert_eq!(listing.packed["julia-1_10_0-DEV_1"], vec![b, c]);
        assert!(listing.contains(&a));
        assert!(!listing.contains(&rev('d')));
        assert_eq!(listing.stored_count(), 3);
    }

    #[test]
    fn store_extract_roundtrip_through_the_codec() {
        let _env = testing::env_guard();
        let temp = tempdir().expect("tempdir");
        testing::install_fake_codec(temp.path());
        let config = testing::config_at(temp.path());
        let db = open_db(&config);
        let revision = rev('a');

        let artifact_dir = temp.path().join("artifact");
        fs::create_dir_all(artifact_dir.join("bin")).expect("mkdir");
        fs::write(artifact_dir.join("bin/hello"), "ABC").expect("write");
        fs::set_permissions(
            artifact_dir.join("bin/hello"),
            fs::Permissions::from_mode(0o755),
        )
        .expect("chmod");
        fs::create_dir_all(artifact_dir.join("lib")).expect("mkdir lib");
        fs::write(artifact_dir.join("lib/libfoo.so.1"), "bin").expect("write lib");
        symlink("libfoo.so.1", artifact_dir.join("lib/libfoo.so")).expect("symlink");

        store(&db, &revision, &artifact_dir).expect("store");
        assert!(!artifact_dir.exists(), "store consumes the input tree");
        assert_eq!(list(&db).expect("list").loose, vec![revision.clone()]);

        let out = temp.path().join("out");
        extract(&db, &revision, &out).expect("extract");
        assert_eq!(fs::read(out.join("bin/hello")).expect("read"), b"ABC");
        assert_eq!(
            fs::symlink_metadata(out.join("bin/hello")).expect("stat").mode() & 0o7777,
            0o755
        );
        assert_eq!(
            fs::read_link(out.join("lib/libfoo.so")).expect("readlink"),
            PathBuf::from("libfoo.so.1")
        );
        assert!(!out.join(meta::METADATA_FILE).exists());
    }

    #[test]
    fn pack_and_rm_loose_move_objects_into_a_pack() {
        let _env = testing::env_guard();
        let temp = tempdir().expect("tempdir");
        testing::install_fake_codec(temp.path());
        let config = testing::config_at(temp.path());
        let db = open_db(&config);

        for fill in ['a', 'b'] {
            let dir = temp.path().join(format!("artifact-{fill}"));
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join("data"), fill.to_string()).expect("write");
            store(&db, &rev(fill), &dir).expect("store");
        }

        pack(&db, "julia-test_pack").expect("pack");
        rm_loose(&db).expect("rm_loose");
        assert!(pack_exists(&db, "julia-test_pack"));

        let listing = list(&db).expect("list");
        assert!(listing.loose.is_empty());
        assert_eq!(listing.packed.len(), 1);
        assert_eq!(listing.packed["julia-test_pack"].len(), 2);

        delete_pack(&db, "julia-test_pack").expect("delete");
        assert!(!pack_exists(&db, "julia-test_pack"));
    }
}
