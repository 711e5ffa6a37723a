//! Typed errors surfaced by the archive core.

use std::fmt;

use crate::version::TargetVersion;

/// Why a single commit's build did not produce a usable artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The compiler exited nonzero.
    BuildFailed,
    /// The per-build timer fired before the build finished.
    Timeout,
    /// The installed interpreter could not run `-e 42`.
    SmokeTestFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BuildFailed => "build failed",
            Self::Timeout => "build timed out",
            Self::SmokeTestFailed => "smoke test failed",
        };
        f.write_str(text)
    }
}

/// A failed build of one commit. Carried through the planner's worker pool
/// so a pack can finish without the commit.
#[derive(Debug, thiserror::Error)]
#[error("{reason} (exit code {exit_code}, signal {term_signal})")]
pub struct BuildFailure {
    pub reason: FailureReason,
    pub exit_code: i32,
    pub term_signal: i32,
    /// Tail of the combined build log, at most 100 lines.
    pub log: String,
}

/// Outcome of one commit's build: built and ingested, or failed with a
/// structured reason. Infrastructure errors (codec, sandbox, mirror) do not
/// use this type; they propagate as `anyhow::Error` and abort the pack.
pub type BuildOutcome = std::result::Result<(), BuildFailure>;

/// Errors raised by the store, mirror, and sandbox layers.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A revision spec that the mirror cannot resolve to a commit.
    #[error("unknown revision '{0}'")]
    RevisionUnknown(String),

    /// A resolved revision that is not present in any pack or the loose area.
    #[error("revision {rev} is not stored; run `jhist build {version}` first")]
    RevisionNotStored { rev: String, version: TargetVersion },

    /// The external pack codec exited nonzero.
    #[error("pack codec '{operation}' failed on database {database} (exit code {code})")]
    Codec {
        database: String,
        operation: String,
        code: i32,
        stderr: String,
    },

    /// The container engine could not be prepared or launched.
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    /// A finalized pack holds revisions outside its planned chunk.
    #[error("pack {pack} holds {} revision(s) outside its plan", unexpected.len())]
    Integrity {
        pack: String,
        unexpected: Vec<String>,
    },
}

impl ArchiveError {
    /// Exit code the CLI maps this error to. Unknown and missing revisions
    /// use 125 so bisect drivers can distinguish "cannot test" from an
    /// ordinary child failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RevisionUnknown(_) | Self::RevisionNotStored { .. } => 125,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_stored_message_names_the_version_to_build() {
        let err = ArchiveError::RevisionNotStored {
            rev: "deadbeef".repeat(5),
            version: TargetVersion::new(1, 10),
        };
        let text = err.to_string();
        assert!(text.contains("jhist build 1.10"), "message was: {text}");
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn failure_reason_renders_for_summaries() {
        assert_eq!(FailureReason::Timeout.to_string(), "build timed out");
        let failure = BuildFailure {
            reason: FailureReason::BuildFailed,
            exit_code: 2,
            term_signal: 0,
            log: String::new(),
        };
        assert!(failure.to_string().contains("exit code 2"));
    }
}
