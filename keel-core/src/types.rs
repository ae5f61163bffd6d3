//! Newtypes shared across the keel crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A strongly-typed project name. Unique key for tasks, workers and channel files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(pub String);

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque identifier of the latest upstream revision of a path
/// (a Perforce change number in live mode, `sim-<n>` in simulation).
///
/// Only equality is meaningful to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(pub String);

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ChangeToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChangeToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ProjectName::from("core").to_string(), "core");
        assert_eq!(ChangeToken::from("10").to_string(), "10");
    }

    #[test]
    fn newtypes_serialize_transparently() {
        let yaml = serde_yaml::to_string(&ProjectName::from("core")).expect("serialize");
        assert_eq!(yaml.trim(), "core");
        let token: ChangeToken = serde_yaml::from_str("'42'").expect("deserialize");
        assert_eq!(token, ChangeToken::from("42"));
    }
}
