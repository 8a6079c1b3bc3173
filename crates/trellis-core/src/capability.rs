//! # Capability: Backing Service Names
//!
//! Defines the `Capability` enum naming the three backing services a
//! Trellis process can toggle on or off. This is the one key used by the
//! configuration, the service registry, readiness reports and logs.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ConfigError;

/// A backing service the request pipeline can depend on.
///
/// The variant order is the initialization order used by the registry;
/// shutdown closes handles in the reverse of this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Relational store (PostgreSQL).
    Database,
    /// Key-value cache (Redis).
    Cache,
    /// Object store (S3/MinIO-compatible endpoint).
    Storage,
}

impl Capability {
    /// All capabilities in initialization order.
    pub const ALL: [Capability; 3] = [Self::Database, Self::Cache, Self::Storage];

    /// Returns the snake_case identifier used in config, logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(Self::Database),
            "cache" => Ok(Self::Cache),
            "storage" => Ok(Self::Storage),
            other => Err(ConfigError::Invalid {
                key: "capability".to_string(),
                value: other.to_string(),
                reason: "expected one of database, cache, storage".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_roundtrip() {
        for cap in Capability::ALL {
            let parsed: Capability = cap.as_str().parse().unwrap();
            assert_eq!(cap, parsed);
        }
    }

    #[test]
    fn from_str_rejects_unknown() {
        assert!("queue".parse::<Capability>().is_err());
        assert!("Database".parse::<Capability>().is_err());
    }

    #[test]
    fn serde_matches_as_str() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
        }
    }

    #[test]
    fn all_is_in_initialization_order() {
        let mut sorted = Capability::ALL;
        sorted.sort();
        assert_eq!(sorted, Capability::ALL);
    }
}
