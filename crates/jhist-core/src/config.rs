//! Global paths, built once at process start and threaded explicitly into
//! every component.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use toml_edit::{value, DocumentMut};

const PREFERENCES_FILE: &str = "preferences.toml";
const DATA_DIR_KEY: &str = "data-dir";

/// Filesystem roots for the whole process.
///
/// - `downloads_dir` holds the source mirror, the shared source-dependency
///   cache, and the sandbox rootfs artifact.
/// - `data_dir` holds one subdirectory per pack database.
/// - `sandbox_dir` holds the container engine's state.
#[derive(Clone, Debug)]
pub struct Config {
    pub downloads_dir: PathBuf,
    pub data_dir: PathBuf,
    pub sandbox_dir: PathBuf,
}

impl Config {
    /// Resolves the three roots: environment overrides first, then the
    /// persisted data-root preference, then defaults under `~/.jhist`.
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined or a root
    /// cannot be created.
    pub fn load() -> Result<Self> {
        let home = jhist_home()?;
        let downloads_dir = env_path("JHIST_DOWNLOADS_DIR")
            .unwrap_or_else(|| home.join("downloads"));
        let data_dir = match env_path("JHIST_DATA_DIR") {
            Some(path) => path,
            None => preferred_data_dir(&home)?.unwrap_or_else(|| home.join("data")),
        };
        let sandbox_dir = env_path("JHIST_SANDBOX_DIR")
            .unwrap_or_else(|| home.join("sandbox"));

        for dir in [&downloads_dir, &data_dir, &sandbox_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(Self {
            downloads_dir,
            data_dir,
            sandbox_dir,
        })
    }

    /// Directory holding one pack database.
    #[must_use]
    pub fn database_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Shared source-dependency cache populated by builds.
    #[must_use]
    pub fn srccache_dir(&self) -> PathBuf {
        self.downloads_dir.join("srccache")
    }
}

/// Root for preferences and default roots. `JHIST_HOME` overrides the
/// `~/.jhist` default so tests can run hermetically.
pub fn jhist_home() -> Result<PathBuf> {
    if let Some(path) = env_path("JHIST_HOME") {
        return Ok(path);
    }
    let home = dirs_next::home_dir().ok_or_else(|| anyhow!("home directory not found"))?;
    Ok(home.join(".jhist"))
}

/// Persists the data-root preference consulted by [`Config::load`].
///
/// # Errors
/// Returns an error when the preference file cannot be read or written.
pub fn set_data_dir_preference(path: &Path) -> Result<()> {
    let home = jhist_home()?;
    fs::create_dir_all(&home).with_context(|| format!("creating {}", home.display()))?;
    let file = home.join(PREFERENCES_FILE);
    let mut doc = match fs::read_to_string(&file) {
        Ok(raw) => raw
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing {}", file.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => DocumentMut::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", file.display()));
        }
    };
    doc[DATA_DIR_KEY] = value(path.display().to_string());
    fs::write(&file, doc.to_string()).with_context(|| format!("writing {}", file.display()))
}

/// The persisted data root, if any.
pub fn data_dir_preference() -> Result<Option<PathBuf>> {
    preferred_data_dir(&jhist_home()?)
}

fn preferred_data_dir(home: &Path) -> Result<Option<PathBuf>> {
    let file = home.join(PREFERENCES_FILE);
    let raw = match fs::read_to_string(&file) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", file.display())),
    };
    let doc = raw
        .parse::<DocumentMut>()
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(doc
        .get(DATA_DIR_KEY)
        .and_then(|item| item.as_str())
        .map(PathBuf::from))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}
