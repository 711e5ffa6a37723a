//! The prebuilt minimal rootfs image the sandbox runs on.
//!
//! Fetched once into the downloads cache and reused by every invocation;
//! the download itself is single-flight so a worker pool starting cold does
//! not race N copies of a multi-hundred-megabyte fetch.

use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use tar::Archive;
use tempfile::{tempdir_in, NamedTempFile};
use tracing::info;

use crate::config::Config;

const DEFAULT_ROOTFS_URL: &str =
    "https://github.com/JuliaCI/rootfs-images/releases/download/v7.10/package_linux.x86_64.tar.gz";

static ARTIFACT_LOCK: Mutex<()> = Mutex::new(());

/// Returns the unpacked rootfs directory, downloading it on first use.
///
/// `JHIST_ROOTFS` short-circuits to an existing directory;
/// `JHIST_ROOTFS_URL` overrides the artifact source (https or a local
/// file path).
pub fn ensure_rootfs(config: &Config) -> Result<PathBuf> {
    if let Some(raw) = env::var_os("JHIST_ROOTFS") {
        let path = PathBuf::from(raw);
        if path.is_dir() {
            return Ok(path);
        }
        bail!("JHIST_ROOTFS points at {}, which is not a directory", path.display());
    }

    let url = env::var("JHIST_ROOTFS_URL").unwrap_or_else(|_| DEFAULT_ROOTFS_URL.to_string());
    let name = rootfs_name(&url)?;
    let dest = config.downloads_dir.join("rootfs").join(&name);

    let _guard = ARTIFACT_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if dest.is_dir() {
        return Ok(dest);
    }

    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("rootfs destination {} has no parent", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    info!(%url, "fetching sandbox rootfs");
    let archive = fetch_archive(&url)?;
    let stage = tempdir_in(parent).context("creating rootfs staging directory")?;
    unpack(&archive, stage.path())?;

    // Archives ship either the tree directly or one wrapping directory.
    let staged = stage.keep();
    let root = single_subdir(&staged)?.unwrap_or_else(|| staged.clone());
    if let Err(err) = fs::rename(&root, &dest) {
        let _ = fs::remove_dir_all(&staged);
        return Err(err).with_context(|| format!("moving rootfs into place at {}", dest.display()));
    }
    if root != staged {
        let _ = fs::remove_dir_all(&staged);
    }
    Ok(dest)
}

fn fetch_archive(url: &str) -> Result<tempfile::TempPath> {
    let mut file = NamedTempFile::new().context("creating temporary rootfs archive")?;
    if let Some(path) = url.strip_prefix("file://") {
        fs::copy(path, file.path())
            .with_context(|| format!("copying rootfs archive from {path}"))?;
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let client = build_http_client()?;
        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("failed to download rootfs from {url}"))?
            .error_for_status()
            .with_context(|| format!("rootfs download failed ({url})"))?;
        response
            .copy_to(file.as_file_mut())
            .context("failed to write rootfs archive")?;
    } else {
        fs::copy(url, file.path())
            .with_context(|| format!("copying rootfs archive from {url}"))?;
    }
    Ok(file.into_temp_path())
}

fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("jhist/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(600))
        .build()
        .context("building HTTP client")
}

fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let decoder = GzDecoder::new(file);
    let mut tar = Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .with_context(|| format!("extracting rootfs into {}", dest.display()))
}

fn rootfs_name(url: &str) -> Result<String> {
    let file = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("rootfs URL '{url}' has no file name"))?;
    let stem = file
        .strip_suffix(".tar.gz")
        .or_else(|| file.strip_suffix(".tgz"))
        .ok_or_else(|| anyhow!("rootfs archive '{file}' is not a .tar.gz"))?;
    Ok(stem.to_string())
}

fn single_subdir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading {}", dir.display()))?;
    if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
        Ok(Some(entries.remove(0).path()))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::tempdir;

    #[test]
    fn rootfs_names_come_from_the_archive_stem() {
        assert_eq!(
            rootfs_name("https://example.com/a/package_linux.x86_64.tar.gz").unwrap(),
            "package_linux.x86_64"
        );
        assert!(rootfs_name("https://example.com/rootfs.zip").is_err());
    }

    #[test]
    fn local_archives_unpack_and_move_into_place() {
        let _env = testing::env_guard();
        let temp = tempdir().expect("tempdir");
        let config = testing::config_at(temp.path());

        // Build a one-file rootfs archive.
        let tree = temp.path().join("tree/minirootfs");
        fs::create_dir_all(tree.join("bin")).expect("mkdir");
        fs::write(tree.join("bin/sh"), "#!/bin/true\n").expect("write");
        let archive = temp.path().join("minirootfs.tar.gz");
        let file = File::create(&archive).expect("create archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all("minirootfs", temp.path().join("tree/minirootfs"))
            .expect("append");
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");

        env::set_var("JHIST_ROOTFS_URL", archive.display().to_string());
        env::remove_var("JHIST_ROOTFS");
        let rootfs = ensure_rootfs(&config).expect("ensure rootfs");
        assert!(rootfs.join("bin/sh").is_file());
        assert_eq!(rootfs, config.downloads_dir.join("rootfs/minirootfs"));

        // Second call short-circuits on the unpacked tree.
        let again = ensure_rootfs(&config).expect("ensure rootfs again");
        assert_eq!(again, rootfs);
        env::remove_var("JHIST_ROOTFS_URL");
    }
}
