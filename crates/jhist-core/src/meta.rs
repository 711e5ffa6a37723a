//! Sidecar metadata for stored artifacts.
//!
//! The pack codec preserves regular-file contents byte-for-byte but loses
//! mode bits and symbolic links. `prepare` records both into a
//! `metadata.toml` at the artifact root before storing; `unprepare` applies
//! and removes it after extraction, restoring the original tree.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use toml_edit::{value, DocumentMut, Item, Table};

/// Sidecar file name, relative to the artifact root.
pub const METADATA_FILE: &str = "metadata.toml";

/// Records modes and symlinks of every entry under `dir` into the sidecar.
///
/// Symlinks are recorded, never followed. The sidecar must not already
/// exist; a leftover one means a previous store attempt was interrupted and
/// the directory should be considered tainted.
pub fn prepare(dir: &Path) -> Result<()> {
    let sidecar = dir.join(METADATA_FILE);
    if sidecar.exists() {
        bail!("{} already exists", sidecar.display());
    }

    let mut modes = BTreeMap::new();
    let mut links = BTreeMap::new();
    collect(dir, Path::new("."), &mut modes, &mut links)?;

    let mut doc = DocumentMut::new();
    let mut mode_table = Table::new();
    for (path, mode) in &modes {
        mode_table.insert(path, value(mode.as_str()));
    }
    let mut link_table = Table::new();
    for (path, target) in &links {
        link_table.insert(path, value(target.as_str()));
    }
    doc.insert("modes", Item::Table(mode_table));
    doc.insert("links", Item::Table(link_table));
    fs::write(&sidecar, doc.to_string()).with_context(|| format!("writing {}", sidecar.display()))
}

fn collect(
    root: &Path,
    rel: &Path,
    modes: &mut BTreeMap<String, String>,
    links: &mut BTreeMap<String, String>,
) -> Result<()> {
    let dir = root.join(rel);
    let mut entries: Vec<_> = fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("reading {}", dir.display()))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let rel_path = rel.join(entry.file_name());
        let key = rel_key(&rel_path);
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?;
        modes.insert(key.clone(), format!("0o{:o}", meta.mode()));
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("readlink {}", path.display()))?;
            links.insert(key, target.to_string_lossy().into_owned());
        } else if meta.is_dir() {
            collect(root, &rel_path, modes, links)?;
        }
    }
    Ok(())
}

/// Applies the sidecar under `dir` and removes it.
///
/// Recorded symlinks are created when absent; when present they must
/// already be symlinks with the recorded target. Modes are then applied
/// with chmod. chmod follows symlinks, so recorded link modes are treated
/// as informational and skipped.
pub fn unprepare(dir: &Path) -> Result<()> {
    let sidecar = dir.join(METADATA_FILE);
    let raw = fs::read_to_string(&sidecar)
        .with_context(|| format!("reading {}", sidecar.display()))?;
    let doc = raw
        .parse::<DocumentMut>()
        .with_context(|| format!("parsing {}", sidecar.display()))?;

    if let Some(links) = doc.get("links").and_then(Item::as_table) {
        for (key, item) in links.iter() {
            let Some(target) = item.as_str() else {
                bail!("link entry '{key}' in {} is not a string", sidecar.display());
            };
            let path = dir.join(key);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let existing = fs::read_link(&path)
                        .with_context(|| format!("readlink {}", path.display()))?;
                    if existing != PathBuf::from(target) {
                        bail!(
                            "{} is a symlink to {} but {} was recorded",
                            path.display(),
                            existing.display(),
                            target
                        );
                    }
                }
                Ok(_) => bail!("{} exists but is not a symlink", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    symlink(target, &path)
                        .with_context(|| format!("creating symlink {}", path.display()))?;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("stat {}", path.display()));
                }
            }
        }
    }

    if let Some(modes) = doc.get("modes").and_then(Item::as_table) {
        for (key, item) in modes.iter() {
            let Some(text) = item.as_str() else {
                bail!("mode entry '{key}' in {} is not a string", sidecar.display());
            };
            let octal = text.strip_prefix("0o").unwrap_or(text);
            let mode = u32::from_str_radix(octal, 8)
                .with_context(|| format!("mode '{text}' for '{key}' is not octal"))?;
            let path = dir.join(key);
            let meta = fs::symlink_metadata(&path)
                .with_context(|| format!("stat {}", path.display()))?;
            if meta.file_type().is_symlink() {
                continue;
            }
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
    }

    fs::remove_file(&sidecar).with_context(|| format!("removing {}", sidecar.display()))
}

fn rel_key(rel: &Path) -> String {
    format!("./{}", rel.strip_prefix(".").unwrap_or(rel).display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mode_of(path: &Path) -> u32 {
        fs::symlink_metadata(path).expect("stat").mode() & 0o7777
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).expect("mkdir bin");
        fs::create_dir_all(root.join("lib")).expect("mkdir lib");
        fs::write(root.join("bin/hello"), "ABC").expect("write hello");
        fs::set_permissions(root.join("bin/hello"), fs::Permissions::from_mode(0o755))
            .expect("chmod hello");
        fs::write(root.join("lib/libfoo.so.1"), "bin").expect("write libfoo");
        fs::set_permissions(
            root.join("lib/libfoo.so.1"),
            fs::Permissions::from_mode(0o644),
        )
        .expect("chmod libfoo");
        symlink("libfoo.so.1", root.join("lib/libfoo.so")).expect("symlink");
    }

    #[test]
    fn roundtrip_restores_modes_and_links() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        build_tree(root);

        prepare(root).expect("prepare");
        let sidecar = fs::read_to_string(root.join(METADATA_FILE)).expect("sidecar");
        assert!(sidecar.contains("\"./bin/hello\""));
        assert!(sidecar.contains("\"./lib/libfoo.so\" = \"libfoo.so.1\""));

        // Simulate what the codec loses: flatten modes, drop the symlink.
        fs::remove_file(root.join("lib/libfoo.so")).expect("drop link");
        fs::set_permissions(root.join("bin/hello"), fs::Permissions::from_mode(0o600))
            .expect("flatten mode");

        unprepare(root).expect("unprepare");
        assert_eq!(mode_of(&root.join("bin/hello")), 0o755);
        assert_eq!(mode_of(&root.join("lib/libfoo.so.1")), 0o644);
        assert_eq!(
            fs::read_link(root.join("lib/libfoo.so")).expect("readlink"),
            PathBuf::from("libfoo.so.1")
        );
        assert!(!root.join(METADATA_FILE).exists());
        assert_eq!(fs::read(root.join("bin/hello")).expect("read"), b"ABC");
    }

    #[test]
    fn prepare_refuses_a_tainted_tree() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join(METADATA_FILE), "").expect("plant sidecar");
        assert!(prepare(temp.path()).is_err());
    }

    #[test]
    fn unprepare_keeps_a_matching_existing_link() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        build_tree(root);
        prepare(root).expect("prepare");
        // Extraction produced the link already; unprepare must accept it.
        unprepare(root).expect("unprepare");
        assert_eq!(
            fs::read_link(root.join("lib/libfoo.so")).expect("readlink"),
            PathBuf::from("libfoo.so.1")
        );
    }

    #[test]
    fn unprepare_rejects_a_mismatched_link() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        build_tree(root);
        prepare(root).expect("prepare");
        fs::remove_file(root.join("lib/libfoo.so")).expect("drop link");
        symlink("libfoo.so.2", root.join("lib/libfoo.so")).expect("wrong link");
        let err = unprepare(root).expect_err("mismatch must fail");
        assert!(err.to_string().contains("libfoo.so.1"));
    }
}
