// Semantic version parsing and ordering
//
// Release tags are normalized before semver sees them: a leading `v` and any pre-release/build
// suffix are dropped and missing segments are zero, so "v9.15" reads as 9.15.0.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    inner: semver::Version,
    /// Input string as given, for display/logging.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// Reduce a tag such as `v1.4-rc2` to the `x.y.z` core semver expects.
fn normalize(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    let without_prefix = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let core = without_prefix
        .split(|c: char| c == '-' || c == '+' || c.is_whitespace())
        .next()
        .unwrap_or("");
    if core.is_empty() {
        return Err("empty version".to_string());
    }

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err("expected at most three numeric segments".to_string());
    }
    parts.resize(3, "0");
    Ok(parts.join("."))
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            inner: semver::Version::new(major, minor, patch),
            raw: format!("{}.{}.{}", major, minor, patch),
        }
    }

    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let fail = |reason: String| VersionParseError {
            input: input.to_string(),
            reason,
        };
        let core = normalize(input).map_err(fail)?;
        let inner = semver::Version::parse(&core).map_err(|e| fail(e.to_string()))?;
        Ok(Self {
            inner,
            raw: input.trim().to_string(),
        })
    }

    /// The running installer's own version.
    pub fn current() -> Self {
        Self::new(
            env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        )
    }

    pub fn major(&self) -> u64 {
        self.inner.major
    }

    pub fn minor(&self) -> u64 {
        self.inner.minor
    }

    pub fn patch(&self) -> u64 {
        self.inner.patch
    }
}

// Equality/ordering ignore `raw` so "v1.2" == "1.2.0".
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.cmp(&other.inner)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}
