//! Shared types for the foreman command orchestrator.
//!
//! Everything that crosses a crate boundary lives here: the command
//! state machine types, the HTTP wire envelopes for the client and
//! agent surfaces, the error taxonomy, and environment-driven
//! configuration for both binaries.

pub mod command;
pub mod config;
pub mod error;
pub mod ids;
pub mod wire;

pub use command::{
    AgentLiveness, Command, CommandKind, CommandPayload, CommandResult, CommandStatus,
    DelayOutcome, FailureOutcome, HttpOutcome,
};
pub use config::{AgentConfig, ServerConfig};
pub use error::ForemanError;
pub use ids::{AgentId, CommandId};
