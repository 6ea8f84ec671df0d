//! SDK versioning for host compatibility checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version of the SDK a host is built with.
///
/// Parsed from `major.minor.patch`; a pre-release or build suffix
/// (`1.2.3-beta.1`, `1.2.3+abc`) is accepted and ignored for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SdkVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl SdkVersion {
    /// Creates a new SdkVersion.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a version string like "0.20.1".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let core = s
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = || -> Result<u16, VersionError> {
            parts
                .next()
                .ok_or_else(|| VersionError::InvalidFormat(s.to_string()))?
                .parse::<u16>()
                .map_err(|_| VersionError::InvalidFormat(s.to_string()))
        };

        let version = Self::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }

        Ok(version)
    }

    /// Returns true if this version sorts before `minimum`.
    pub fn is_older_than(&self, minimum: &SdkVersion) -> bool {
        self < minimum
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for SdkVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = SdkVersion::parse("0.20.1").unwrap();
        assert_eq!(v, SdkVersion::new(0, 20, 1));

        let v = SdkVersion::parse("v1.2.3-beta.4").unwrap();
        assert_eq!(v, SdkVersion::new(1, 2, 3));
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(SdkVersion::parse("1").is_err());
        assert!(SdkVersion::parse("1.0").is_err());
        assert!(SdkVersion::parse("1.0.0.0").is_err());
        assert!(SdkVersion::parse("abc").is_err());
    }

    #[test]
    fn test_version_ordering() {
        let min = SdkVersion::new(0, 20, 0);
        assert!(SdkVersion::new(0, 19, 9).is_older_than(&min));
        assert!(!SdkVersion::new(0, 20, 0).is_older_than(&min));
        assert!(!SdkVersion::new(1, 0, 0).is_older_than(&min));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(SdkVersion::new(1, 2, 3).to_string(), "1.2.3");
    }
}
