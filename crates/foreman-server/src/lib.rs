//! Control server for the foreman command orchestrator.
//!
//! Owns the authoritative command store, serves the client-facing
//! submission/query API and the agent-facing coordination API, and runs
//! the periodic stale-reclamation task. The store is the only durable
//! state in the system; every mutation happens inside a SQLite
//! transaction, so crash safety reduces to the store's guarantees.

pub mod http;
pub mod reclaim;
pub mod service;
pub mod store;

pub use store::CommandStore;
