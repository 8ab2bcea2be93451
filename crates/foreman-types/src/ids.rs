//! Identifier newtypes for the two actors in the system.
//!
//! Agent ids are opaque strings minted by agents themselves; command ids
//! are UUIDs minted by the server at submission. Wrapping both keeps one
//! from being passed where the other is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier an agent presents to the server.
///
/// Travels through the wire envelopes and the owner/liveness columns.
/// The orchestrator only mints, stores, compares, and prints these, so
/// the type exposes exactly that: construction, `as_str` for SQL
/// parameters, equality, and `Display` for log fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Wrap a raw identifier, e.g. one read back from storage or a
    /// request body.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identity of the form `agent-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("agent-{}", Uuid::new_v4()))
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strongly-typed command identifier backed by a UUID.
///
/// Assigned once at submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generate a fresh command id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a command id from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
