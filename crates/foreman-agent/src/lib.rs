//! Worker agent for the foreman command orchestrator.
//!
//! A long-lived single-flight worker: it syncs with the server on
//! startup to resolve any command left over from a previous run, then
//! loops {heartbeat -> fetch -> execute -> report}. The only durable
//! state on the agent side is its identity file.

pub mod client;
pub mod executor;
pub mod identity;
pub mod runner;
