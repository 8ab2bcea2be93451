//! Persistent agent identity.
//!
//! The identity survives restarts so the server can hand a recovered
//! agent the command it was holding. Written once, read thereafter.

use std::fs;
use std::path::Path;

use tracing::info;

use foreman_types::{AgentId, ForemanError};

/// Name of the identity file inside the agent data directory.
const IDENTITY_FILE: &str = "agent-id.txt";

/// Load the persisted identity, or generate and persist a fresh one.
pub fn load_or_create(data_dir: &Path) -> Result<AgentId, ForemanError> {
    let path = data_dir.join(IDENTITY_FILE);

    if path.exists() {
        let raw = fs::read_to_string(&path).map_err(|e| {
            ForemanError::Identity(format!("failed to read {}: {e}", path.display()))
        })?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ForemanError::Identity(format!(
                "identity file {} is empty",
                path.display()
            )));
        }
        return Ok(AgentId::new(trimmed));
    }

    fs::create_dir_all(data_dir).map_err(|e| {
        ForemanError::Identity(format!(
            "failed to create data directory {}: {e}",
            data_dir.display()
        ))
    })?;

    let id = AgentId::generate();

    // Write to a temp file then rename, so a crash mid-write never
    // leaves a partial identity behind.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, id.as_str())
        .map_err(|e| ForemanError::Identity(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, &path).map_err(|e| {
        ForemanError::Identity(format!("failed to persist {}: {e}", path.display()))
    })?;

    info!(agent_id = %id, "generated new agent identity");
    Ok(id)
}
