//! Pack integrity checking and archive status.
//!
//! A finalized pack is valid when its revisions are a SUBSET of the chunk
//! the plan assigns to its name: commits that failed to build are allowed
//! to be missing, foreign commits are not. `--fix` deletes non-conforming
//! packs whole; their commits get rebuilt by a later `build`.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::mirror::Mirror;
use crate::planner::{self, PACK_SIZE};
use crate::store::{self, Database};
use crate::version::{TargetVersion, PROJECT};

#[derive(Clone, Debug)]
pub struct PackIssue {
    pub pack: String,
    /// Revisions present in the pack but absent from its planned chunk;
    /// empty when the pack name itself is not in the plan.
    pub unexpected: Vec<String>,
    pub known_pack: bool,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub database: String,
    pub packs_checked: usize,
    pub issues: Vec<PackIssue>,
    pub fixed: bool,
}

impl VerifyReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validates every finalized pack of a database against the current plan.
pub fn verify_version(
    config: &Config,
    mirror: &Mirror,
    version: TargetVersion,
    asserts: bool,
    fix: bool,
) -> Result<VerifyReport> {
    let db = Database::open(config, version, asserts)?;
    let plan = planner::commit_packs(mirror, version, PACK_SIZE)?;
    let listing = store::list(&db)?;
    let issues = check_packs(&plan, &listing);

    if fix {
        for issue in &issues {
            warn!(db = db.name(), pack = %issue.pack, "deleting non-conforming pack");
            store::delete_pack(&db, &issue.pack)?;
        }
    }
    if issues.is_empty() {
        info!(db = db.name(), packs = listing.packed.len(), "all packs conform");
    }
    Ok(VerifyReport {
        database: db.name().to_string(),
        packs_checked: listing.packed.len(),
        issues,
        fixed: fix,
    })
}

/// The subset check, separated from store access: plan pack names are
/// matched after `safe_name` projection, pack contents must not exceed
/// their chunk.
#[must_use]
pub fn check_packs(
    plan: &[(String, Vec<String>)],
    listing: &store::StoreListing,
) -> Vec<PackIssue> {
    let expected: HashMap<String, BTreeSet<&String>> = plan
        .iter()
        .map(|(name, chunk)| {
            let safe = store::safe_name(&format!("{PROJECT}-{name}"));
            (safe, chunk.iter().collect())
        })
        .collect();

    let mut issues = Vec::new();
    for (pack, revs) in &listing.packed {
        match expected.get(pack) {
            Some(chunk) => {
                let unexpected: Vec<String> = revs
                    .iter()
                    .filter(|rev| !chunk.contains(rev))
                    .cloned()
                    .collect();
                if !unexpected.is_empty() {
                    issues.push(PackIssue {
                        pack: pack.clone(),
                        unexpected,
                        known_pack: true,
                    });
                }
            }
            None => issues.push(PackIssue {
                pack: pack.clone(),
                unexpected: revs.clone(),
                known_pack: false,
            }),
        }
    }
    issues
}

#[derive(Debug)]
pub struct StatusReport {
    pub database: String,
    pub total: usize,
    pub stored: usize,
    pub loose: usize,
    pub packs: usize,
}

impl StatusReport {
    #[must_use]
    pub fn missing(&self) -> usize {
        self.total.saturating_sub(self.stored)
    }
}

/// Built/unbuilt commit counts for one database.
pub fn status_version(
    config: &Config,
    mirror: &Mirror,
    version: TargetVersion,
    asserts: bool,
) -> Result<StatusReport> {
    let db = Database::open(config, version, asserts)?;
    let commits = mirror.commits(version)?;
    let listing = store::list(&db)?;
    let stored = commits.iter().filter(|rev| listing.contains(rev)).count();
    Ok(StatusReport {
        database: db.name().to_string(),
        total: commits.len(),
        stored,
        loose: listing.loose.len(),
        packs: listing.packed.len(),
    })
}
