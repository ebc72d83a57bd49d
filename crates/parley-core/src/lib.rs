//! Shared contracts for the Parley session gateway.
//!
//! This crate defines the cross-crate contract between the gateway and its
//! external collaborators: the secure-computation broker and the remote file
//! store, plus the domain types both sides exchange (parties, column
//! descriptors, visibility grants).
//!
//! # API notes
//! `parley-core` is an internal crate (`publish = false`). Its public API
//! uses `serde_json::Value` for query result cells as part of the gateway
//! contract.

use serde::{Deserialize, Serialize};

pub mod broker;
pub mod filestore;

/// Participant identity in a secure-computation session.
///
/// Supplied per task by the caller; never persisted globally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Party {
    pub party_id: String,
    pub public_key: String,
    pub endpoint: String,
}

/// Column visibility constraints enforced by the broker.
///
/// Unknown tags are rejected at deserialization time, before a task is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Plaintext,
    PlaintextAfterJoin,
    PlaintextAfterGroupBy,
    PlaintextAfterCompare,
    PlaintextAfterAggregate,
    EncryptedOnly,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Plaintext => "PLAINTEXT",
            AccessLevel::PlaintextAfterJoin => "PLAINTEXT_AFTER_JOIN",
            AccessLevel::PlaintextAfterGroupBy => "PLAINTEXT_AFTER_GROUP_BY",
            AccessLevel::PlaintextAfterCompare => "PLAINTEXT_AFTER_COMPARE",
            AccessLevel::PlaintextAfterAggregate => "PLAINTEXT_AFTER_AGGREGATE",
            AccessLevel::EncryptedOnly => "ENCRYPTED_ONLY",
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column descriptor for registering a virtual table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub dtype: String,
}

/// A per-column, per-party visibility grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnGrant {
    pub party_id: String,
    pub table: String,
    pub column: String,
    pub level: AccessLevel,
}

#[cfg(test)]
mod tests {
    use super::AccessLevel;

    #[test]
    fn access_levels_round_trip_broker_tags() -> anyhow::Result<()> {
        let level: AccessLevel = serde_json::from_str("\"PLAINTEXT\"")?;
        anyhow::ensure!(level == AccessLevel::Plaintext);
        anyhow::ensure!(level.as_str() == "PLAINTEXT");

        let level: AccessLevel = serde_json::from_str("\"PLAINTEXT_AFTER_JOIN\"")?;
        anyhow::ensure!(level == AccessLevel::PlaintextAfterJoin);

        anyhow::ensure!(serde_json::from_str::<AccessLevel>("\"SHOUT\"").is_err());
        Ok(())
    }
}
