#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};

use assert_cmd::Command;
use tempfile::TempDir;

/// Whether the host has a usable git; mirror-touching tests skip without.
#[must_use]
pub fn git_available() -> bool {
    StdCommand::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A hermetic home for one test: everything jhist touches lives inside.
#[must_use]
pub fn fresh_home(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("tempdir")
}

/// The jhist binary wired to a hermetic home and a quiet terminal.
#[must_use]
pub fn jhist(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("jhist").expect("jhist binary");
    cmd.env("JHIST_HOME", home);
    cmd.env("JHIST_PROGRESS", "0");
    cmd.env_remove("JHIST_DATA_DIR");
    cmd.env_remove("JHIST_DOWNLOADS_DIR");
    cmd.env_remove("JHIST_SANDBOX_DIR");
    cmd.env_remove("JHIST_CODEC");
    cmd.env_remove("JHIST_UPSTREAM");
    cmd
}

fn git_in(dir: &Path, args: &[&str]) {
    let status = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// A local stand-in for the upstream repository: a master branch on
/// release line 1.10 with three commits. Returns the commit hashes,
/// oldest first.
pub fn init_upstream(dir: &Path) -> Vec<String> {
    fs::create_dir_all(dir).expect("mkdir upstream");
    git_in(dir, &["init", "--initial-branch", "master", "."]);
    fs::write(dir.join("VERSION"), "1.10.0-DEV\n").expect("VERSION");

    let mut commits = Vec::new();
    for step in 0..3 {
        fs::write(dir.join("work.jl"), format!("step = {step}\n")).expect("file");
        git_in(dir, &["add", "-A"]);
        git_in(
            dir,
            &[
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                "step",
            ],
        );
        let head = StdCommand::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .expect("rev-parse");
        commits.push(String::from_utf8_lossy(&head.stdout).trim().to_string());
    }
    commits
}

/// Same object model as the real codec's observable surface: trees under
/// `loose/`, `.pack.d` directories plus a revision-per-line `.pack.idx`,
/// listing lines `loose/<rev>:<rev>` and `<pack>:<rev>`.
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

/// Installs the fake codec under `root`; pass the returned path as
/// `JHIST_CODEC`.
#[must_use]
pub fn install_fake_codec(root: &Path) -> PathBuf {
    let path = root.join("jhist-pack");
    fs::write(&path, FAKE_CODEC).expect("writing fake codec");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake codec");
    path
}
