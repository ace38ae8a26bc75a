use std::{fmt::Display, str::FromStr};

use semver::Version;
use serde::{Deserialize, Serialize};

/// Engine version as an ordered `(major, minor, patch)` triple.
///
/// A thin wrapper around `semver::Version` providing string serialization and
/// a tolerant parser: dotted components after the patch are ignored, and a
/// missing minor or patch defaults to zero.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion(Version);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid engine version '{0}'")]
pub struct VersionParseError(String);

impl EngineVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Parse `<major>[.<minor>[.<patch>[.<ignored>...]]]`.
    pub fn parse(version: &str) -> Result<Self, VersionParseError> {
        let mut numbers = [0u64; 3];
        let mut components = version.trim().split('.');
        for (index, slot) in numbers.iter_mut().enumerate() {
            match components.next() {
                Some(component) => {
                    *slot = component
                        .trim()
                        .parse()
                        .map_err(|_| VersionParseError(version.to_string()))?
                }
                None if index == 0 => return Err(VersionParseError(version.to_string())),
                None => break,
            }
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }

    /// Gets a reference to the inner `Version`.
    pub fn as_version(&self) -> &Version {
        &self.0
    }
}

impl Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EngineVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EngineVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for EngineVersion {
    fn deserialize<D>(deserializer: D) -> Result<EngineVersion, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        EngineVersion::parse(&String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(EngineVersion::parse("1.2.3").unwrap(), EngineVersion::new(1, 2, 3));
        assert_eq!(EngineVersion::parse(" 2.0.1 ").unwrap(), EngineVersion::new(2, 0, 1));

        // Extra components are tolerated and ignored.
        assert_eq!(
            EngineVersion::parse("1.2.3.4.5").unwrap(),
            EngineVersion::new(1, 2, 3)
        );

        // Missing components default to zero.
        assert_eq!(EngineVersion::parse("1.2").unwrap(), EngineVersion::new(1, 2, 0));
        assert_eq!(EngineVersion::parse("3").unwrap(), EngineVersion::new(3, 0, 0));

        EngineVersion::parse("").unwrap_err();
        EngineVersion::parse("one.two").unwrap_err();
        EngineVersion::parse("1.x.3").unwrap_err();
    }

    #[test]
    fn test_ordering() {
        assert!(EngineVersion::parse("2.0.0").unwrap() > EngineVersion::parse("1.9.9").unwrap());
        assert!(EngineVersion::parse("1.2.3").unwrap() < EngineVersion::parse("1.2.4").unwrap());
        assert_eq!(
            EngineVersion::parse("1.2.3.9").unwrap(),
            EngineVersion::parse("1.2.3").unwrap()
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let version: EngineVersion = serde_yaml::from_str("\"1.4.2\"").unwrap();
        assert_eq!(version, EngineVersion::new(1, 4, 2));
        assert_eq!(serde_yaml::to_string(&version).unwrap().trim(), "1.4.2");

        serde_yaml::from_str::<EngineVersion>("\"not-a-version\"").unwrap_err();
    }
}
