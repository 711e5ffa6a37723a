mod common;

use assert_cmd::assert::Assert;
use common::{fresh_home, git_available, init_upstream, install_fake_codec, jhist};

fn stdout_of(assert: &Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).to_string()
}

fn stderr_of(assert: &Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

#[test]
fn help_lists_the_sub_commands() {
    let home = fresh_home("jhist-help");
    let assert = jhist(home.path()).arg("--help").assert().success();
    let stdout = stdout_of(&assert);
    for name in ["build", "run", "extract", "verify", "status", "config"] {
        assert!(stdout.contains(name), "--help is missing '{name}':\n{stdout}");
    }
}

#[test]
fn config_data_dir_persists_a_preference() {
    let home = fresh_home("jhist-config");
    let target = home.path().join("elsewhere");

    let assert = jhist(home.path())
        .args(["config", "data-dir", &target.display().to_string()])
        .assert()
        .success();
    assert!(stdout_of(&assert).contains(&target.display().to_string()));
    assert!(home.path().join("preferences.toml").is_file());

    let assert = jhist(home.path())
        .args(["config", "data-dir"])
        .assert()
        .success();
    assert!(stdout_of(&assert).contains(&target.display().to_string()));
}

#[test]
fn extract_of_an_unknown_revision_exits_125() {
    if !git_available() {
        return;
    }
    let home = fresh_home("jhist-unknown");
    let upstream = home.path().join("upstream");
    init_upstream(&upstream);

    let assert = jhist(home.path())
        .env("JHIST_UPSTREAM", &upstream)
        .args(["extract", &"0".repeat(40), "out"])
        .assert()
        .code(125);
    assert!(stderr_of(&assert).contains("unknown revision"));
}

#[test]
fn extract_of_an_unstored_revision_exits_125_and_names_the_version() {
    if !git_available() {
        return;
    }
    let home = fresh_home("jhist-unstored");
    let upstream = home.path().join("upstream");
    let commits = init_upstream(&upstream);
    let codec = install_fake_codec(home.path());

    let assert = jhist(home.path())
        .env("JHIST_UPSTREAM", &upstream)
        .env("JHIST_CODEC", &codec)
        .args(["extract", &commits[1], "out"])
        .assert()
        .code(125);
    let stderr = stderr_of(&assert);
    assert!(
        stderr.contains("jhist build 1.10"),
        "125 message must name the version to build:\n{stderr}"
    );
}

#[test]
fn status_counts_unbuilt_commits() {
    if !git_available() {
        return;
    }
    let home = fresh_home("jhist-status");
    let upstream = home.path().join("upstream");
    init_upstream(&upstream);
    let codec = install_fake_codec(home.path());

    let assert = jhist(home.path())
        .env("JHIST_UPSTREAM", &upstream)
        .env("JHIST_CODEC", &codec)
        .args(["status", "1.10"])
        .assert()
        .success();
    assert!(stdout_of(&assert).contains("julia-1.10: 0/3 commits stored"));
}

#[test]
fn verify_accepts_an_empty_database() {
    if !git_available() {
        return;
    }
    let home = fresh_home("jhist-verify");
    let upstream = home.path().join("upstream");
    init_upstream(&upstream);
    let codec = install_fake_codec(home.path());

    let assert = jhist(home.path())
        .env("JHIST_UPSTREAM", &upstream)
        .env("JHIST_CODEC", &codec)
        .args(["verify", "1.10"])
        .assert()
        .success();
    assert!(stdout_of(&assert).contains("0 pack(s) conform"));
}

#[test]
fn build_rejects_a_version_spec_matching_nothing() {
    if !git_available() {
        return;
    }
    let home = fresh_home("jhist-nomatch");
    let upstream = home.path().join("upstream");
    init_upstream(&upstream);

    let assert = jhist(home.path())
        .env("JHIST_UPSTREAM", &upstream)
        .args(["build", "2.0"])
        .assert()
        .failure();
    assert!(stderr_of(&assert).contains("matches no known release line"));
}
