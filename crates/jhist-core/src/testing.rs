//! Shared fixtures for the unit tests: a hermetic [`Config`] and a
//! shell-script stand-in for the pack codec.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::Config;

/// The codec binary is selected through the process environment, so tests
/// that install a fake one must not interleave.
pub fn env_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// A config rooted entirely inside `root`.
pub fn config_at(root: &Path) -> Config {
    let config = Config {
        downloads_dir: root.join("downloads"),
        data_dir: root.join("data"),
        sandbox_dir: root.join("sandbox"),
    };
    for dir in [&config.downloads_dir, &config.data_dir, &config.sandbox_dir] {
        fs::create_dir_all(dir).expect("creating config root");
    }
    config
}

/// A minimal codec: objects are directory trees under `loose/`, packs are
/// `.pack.d` directories plus a revision-per-line `.pack.idx`, and the
/// listing output follows the `loose/<rev>:<rev>` / `<pack>:<rev>` contract.
const FAKE_CODEC: &str = r#"#!/bin/sh
set -e
db=""
if [ "$1" = "--db" ]; then db=$2; shift 2; fi
cmd=$1; shift
case "$cmd" in
store)
    rev=$1
    rm -rf "$db/loose/$rev"
    mkdir -p "$db/loose/$rev"
    cp -R . "$db/loose/$rev/"
    ;;
extract)
    if [ "$1" = "--reset" ]; then shift; fi
    rev=$1
    find . -mindepth 1 -delete
    src="$db/loose/$rev"
    if [ ! -d "$src" ]; then
        for d in "$db"/packs/*.pack.d/"$rev"; do
            [ -d "$d" ] && src=$d
        done
    fi
    if [ ! -d "$src" ]; then
        echo "unknown object $rev" >&2
        exit 1
    fi
    cp -R "$src"/. .
    ;;
list)
    if [ -d "$db/loose" ]; then
        for d in "$db"/loose/*/; do
            [ -d "$d" ] || continue
            rev=$(basename "$d")
            echo "loose/$rev:$rev"
        done
    fi
    for idx in "$db"/packs/*.pack.idx; do
        [ -f "$idx" ] || continue
        pack=$(basename "$idx" .pack.idx)
        while read -r rev; do
            [ -n "$rev" ] && echo "$pack:$rev"
        done < "$idx"
    done
    ;;
pack)
    name=$1
    mkdir -p "$db/packs/$name.pack.d"
    : > "$db/packs/$name.pack.idx"
    if [ -d "$db/loose" ]; then
        for d in "$db"/loose/*/; do
            [ -d "$d" ] || continue
            rev=$(basename "$d")
            rm -rf "$db/packs/$name.pack.d/$rev"
            cp -R "$d" "$db/packs/$name.pack.d/$rev"
            echo "$rev" >> "$db/packs/$name.pack.idx"
        done
    fi
    : > "$db/packs/$name.pack"
    ;;
*)
    echo "fake codec: unknown command $cmd" >&2
    exit 2
    ;;
esac
"#;

/// Writes the fake codec under `root` and points `JHIST_CODEC` at it.
/// Callers must hold [`env_guard`] for the test's duration.
pub fn install_fake_codec(root: &Path) -> PathBuf {
    let path = root.join("jhist-pack");
    fs::write(&path, FAKE_CODEC).expect("writing fake codec");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake codec");
    std::env::set_var("JHIST_CODEC", &path);
    path
}
