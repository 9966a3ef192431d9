use std::fmt;

use uuid::Uuid;

use crate::error::{Result, SwarmError};

/// Identifier scoping one distributed build.
///
/// Every RPC carries the build id so a coordinator never accepts work
/// reports from a minion that is still polling for a previous build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildId(String);

impl BuildId {
    /// Generate a fresh build id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a build id received over the wire or from the command line.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map_err(|_| SwarmError::InvalidBuildId(s.to_string()))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_parseable() {
        let a = BuildId::generate();
        let b = BuildId::generate();
        assert_ne!(a, b);
        assert_eq!(BuildId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn parse_rejects_non_uuid() {
        assert!(BuildId::parse("not-a-build-id").is_err());
        assert!(BuildId::parse("").is_err());
    }
}
