//! Target versions and the user-facing version specs that select them.

use std::fmt;

use anyhow::{anyhow, bail, Result};

/// The upstream project every database name is prefixed with.
pub const PROJECT: &str = "julia";

/// One upstream release line, identified by (major, minor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetVersion {
    pub major: u32,
    pub minor: u32,
}

impl TargetVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Name of the pack database for this version, optionally the
    /// debug-assertion variant.
    #[must_use]
    pub fn database_name(&self, asserts: bool) -> String {
        if asserts {
            format!("{PROJECT}-{self}-asserts")
        } else {
            format!("{PROJECT}-{self}")
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parses the contents of the repository's `VERSION` file, keeping only the
/// release line. Tolerates prerelease suffixes (`1.10.0-DEV`).
pub fn parse_version_file(contents: &str) -> Result<TargetVersion> {
    let trimmed = contents.trim();
    let release = trimmed
        .split(['-', '+'])
        .next()
        .ok_or_else(|| anyhow!("empty VERSION file"))?;
    let mut parts = release.split('.');
    let major = parts
        .next()
        .ok_or_else(|| anyhow!("VERSION '{trimmed}' is missing a major component"))?
        .parse()
        .map_err(|_| anyhow!("VERSION '{trimmed}' has a non-numeric major component"))?;
    let minor = parts
        .next()
        .ok_or_else(|| anyhow!("VERSION '{trimmed}' is missing a minor component"))?
        .parse()
        .map_err(|_| anyhow!("VERSION '{trimmed}' has a non-numeric minor component"))?;
    Ok(TargetVersion::new(major, minor))
}

/// A version selector as written on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionSpec {
    /// `X.Y`: exactly one release line.
    Exact(TargetVersion),
    /// `X.Y+`: that line and everything newer.
    From(TargetVersion),
    /// `X.Y-A.B`: an inclusive range.
    Range(TargetVersion, TargetVersion),
}

impl VersionSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec.trim();
        if let Some(base) = trimmed.strip_suffix('+') {
            return Ok(Self::From(parse_pair(base)?));
        }
        // A range separator is a '-' that sits between two version pairs;
        // a plain pair never contains one.
        if let Some((low, high)) = trimmed.split_once('-') {
            let low = parse_pair(low)?;
            let high = parse_pair(high)?;
            if high < low {
                bail!("version range '{trimmed}' is inverted");
            }
            return Ok(Self::Range(low, high));
        }
        Ok(Self::Exact(parse_pair(trimmed)?))
    }

    /// Selects the matching versions out of the known release lines,
    /// oldest first.
    #[must_use]
    pub fn select(&self, known: &[TargetVersion]) -> Vec<TargetVersion> {
        let mut matched: Vec<TargetVersion> = known
            .iter()
            .copied()
            .filter(|v| match self {
                Self::Exact(want) => v == want,
                Self::From(low) => v >= low,
                Self::Range(low, high) => v >= low && v <= high,
            })
            .collect();
        matched.sort();
        matched
    }
}

fn parse_pair(text: &str) -> Result<TargetVersion> {
    let mut parts = text.trim().split('.');
    let major = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("version spec '{text}' is missing a major component"))?
        .parse()
        .map_err(|_| anyhow!("version spec '{text}' has a non-numeric major component"))?;
    let minor = parts
        .next()
        .ok_or_else(|| anyhow!("version spec '{text}' is missing a minor component"))?
        .parse()
        .map_err(|_| anyhow!("version spec '{text}' has a non-numeric minor component"))?;
    if parts.next().is_some() {
        bail!("version spec '{text}' has trailing components; use MAJOR.MINOR");
    }
    Ok(TargetVersion::new(major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32) -> TargetVersion {
        TargetVersion::new(major, minor)
    }

    #[test]
    fn version_file_keeps_major_minor() {
        assert_eq!(parse_version_file("1.10.0-DEV\n").unwrap(), v(1, 10));
        assert_eq!(parse_version_file("1.6.7").unwrap(), v(1, 6));
        assert!(parse_version_file("next").is_err());
    }

    #[test]
    fn database_names_follow_the_store_layout() {
        assert_eq!(v(1, 10).database_name(false), "julia-1.10");
        assert_eq!(v(1, 10).database_name(true), "julia-1.10-asserts");
    }

    #[test]
    fn spec_forms_parse() {
        assert_eq!(VersionSpec::parse("1.9").unwrap(), VersionSpec::Exact(v(1, 9)));
        assert_eq!(VersionSpec::parse("1.9+").unwrap(), VersionSpec::From(v(1, 9)));
        assert_eq!(
            VersionSpec::parse("1.7-1.9").unwrap(),
            VersionSpec::Range(v(1, 7), v(1, 9))
        );
        assert!(VersionSpec::parse("1.9-1.7").is_err());
        assert!(VersionSpec::parse("1").is_err());
        assert!(VersionSpec::parse("1.9.3").is_err());
    }

    #[test]
    fn spec_selection_is_sorted_and_bounded() {
        let known = [v(1, 11), v(1, 6), v(1, 8), v(1, 9), v(1, 10)];
        assert_eq!(VersionSpec::parse("1.8").unwrap().select(&known), vec![v(1, 8)]);
        assert_eq!(
            VersionSpec::parse("1.9+").unwrap().select(&known),
            vec![v(1, 9), v(1, 10), v(1, 11)]
        );
        assert_eq!(
            VersionSpec::parse("1.6-1.8").unwrap().select(&known),
            vec![v(1, 6), v(1, 8)]
        );
        assert!(VersionSpec::parse("2.0").unwrap().select(&known).is_empty());
    }
}
