//! CommandStore: SQLite-backed durable store for commands and agent liveness.
//!
//! Every public operation is a single transaction. The assignment and
//! completion operations are the coordination core: they carry the
//! single-flight and idempotency guarantees the rest of the system
//! leans on, so all state checks happen inside the transaction.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::info;

use foreman_types::{
    AgentId, AgentLiveness, Command, CommandId, CommandPayload, CommandResult, CommandStatus,
    ForemanError,
};

/// Column list shared by every command SELECT.
const COMMAND_COLS: &str =
    "id, payload, status, result, owner, created_at, updated_at, started_at, completed_at";

/// Durable store for the command and agent-liveness tables.
pub struct CommandStore {
    conn: Connection,
}

impl CommandStore {
    /// Open (or create) the store at the given path.
    ///
    /// Enables WAL mode and creates the schema and indexes if they do
    /// not exist.
    pub fn open(path: &Path) -> Result<Self, ForemanError> {
        let conn = Connection::open(path)
            .map_err(|e| ForemanError::Store(format!("failed to open database: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| ForemanError::Store(format!("failed to set WAL mode: {e}")))?;

        Self::init(conn)
    }

    /// Open an in-memory store. Test use only; WAL does not apply.
    pub fn open_in_memory() -> Result<Self, ForemanError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ForemanError::Store(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ForemanError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                owner TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                requeued_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);
            CREATE INDEX IF NOT EXISTS idx_commands_owner ON commands(owner);

            CREATE TABLE IF NOT EXISTS agent_liveness (
                agent_id TEXT PRIMARY KEY,
                last_heartbeat TEXT NOT NULL,
                current_command TEXT
            );",
        )
        .map_err(|e| ForemanError::Store(format!("failed to create schema: {e}")))?;

        info!("command store opened");
        Ok(Self { conn })
    }

    /// Insert a freshly submitted command.
    ///
    /// Fails with [`ForemanError::DuplicateId`] if the id already exists.
    pub fn insert_command(&mut self, cmd: &Command) -> Result<(), ForemanError> {
        let payload = serde_json::to_string(&cmd.payload)
            .map_err(|e| ForemanError::Store(format!("failed to serialize payload: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO commands (id, kind, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cmd.id.to_string(),
                    cmd.kind().as_str(),
                    payload,
                    cmd.status.as_str(),
                    ts(cmd.created_at),
                    ts(cmd.updated_at),
                ],
            )
            .map_err(|e| {
                if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    ForemanError::DuplicateId(cmd.id.to_string())
                } else {
                    ForemanError::Store(format!("failed to insert command: {e}"))
                }
            })?;
        Ok(())
    }

    /// Look up a single command by id.
    pub fn get_command(&self, id: &CommandId) -> Result<Option<Command>, ForemanError> {
        self.conn
            .query_row(
                &format!("SELECT {COMMAND_COLS} FROM commands WHERE id = ?1"),
                params![id.to_string()],
                command_from_row,
            )
            .optional()
            .map_err(|e| ForemanError::Store(format!("failed to query command: {e}")))
    }

    /// All commands, ordered by creation time ascending.
    pub fn list_commands(&self) -> Result<Vec<Command>, ForemanError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {COMMAND_COLS} FROM commands ORDER BY created_at ASC, id ASC"
            ))
            .map_err(|e| ForemanError::Store(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], command_from_row)
            .map_err(|e| ForemanError::Store(format!("failed to query commands: {e}")))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| ForemanError::Store(format!("failed to read command row: {e}")))
    }

    /// Number of Pending commands.
    pub fn count_pending(&self) -> Result<u64, ForemanError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM commands WHERE status = 'PENDING'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| ForemanError::Store(format!("failed to count pending: {e}")))
    }

    /// The command this agent currently holds Running, if any.
    pub fn get_running_for(&self, agent: &AgentId) -> Result<Option<Command>, ForemanError> {
        running_for(&self.conn, agent)
    }

    /// Single-flight assignment: hand this agent its already-Running
    /// command, or claim the oldest Pending one for it.
    ///
    /// Step 1 makes the operation idempotent under retry; the enclosing
    /// transaction makes concurrent claims from different agents pick
    /// distinct commands.
    pub fn assign_next_to(
        &mut self,
        agent: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Command>, ForemanError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ForemanError::Store(format!("failed to begin transaction: {e}")))?;

        if let Some(cmd) = running_for(&tx, agent)? {
            tx.commit()
                .map_err(|e| ForemanError::Store(format!("failed to commit: {e}")))?;
            return Ok(Some(cmd));
        }

        let next = tx
            .query_row(
                &format!(
                    "SELECT {COMMAND_COLS} FROM commands WHERE status = 'PENDING'
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                [],
                command_from_row,
            )
            .optional()
            .map_err(|e| ForemanError::Store(format!("failed to select pending: {e}")))?;

        let Some(cmd) = next else {
            tx.commit()
                .map_err(|e| ForemanError::Store(format!("failed to commit: {e}")))?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE commands SET status = 'RUNNING', owner = ?1, started_at = ?2, updated_at = ?2,
             requeued_by = NULL WHERE id = ?3",
            params![agent.as_str(), ts(now), cmd.id.to_string()],
        )
        .map_err(|e| ForemanError::Store(format!("failed to assign command: {e}")))?;

        upsert_liveness(&tx, agent, Some(cmd.id), now)?;

        // Re-read rather than patch in memory, so the returned record is
        // byte-identical to what a retried fetch will see.
        let assigned = tx
            .query_row(
                &format!("SELECT {COMMAND_COLS} FROM commands WHERE id = ?1"),
                params![cmd.id.to_string()],
                command_from_row,
            )
            .map_err(|e| ForemanError::Store(format!("failed to reload command: {e}")))?;

        tx.commit()
            .map_err(|e| ForemanError::Store(format!("failed to commit assignment: {e}")))?;

        Ok(Some(assigned))
    }

    /// Record a terminal result for a Running command.
    ///
    /// Returns true iff the command was still Running and owned by the
    /// reporting agent; otherwise the record is left untouched. An
    /// `error` supersedes any partial `result`. Owner is retained on the
    /// terminal record for query visibility and replay detection.
    pub fn complete(
        &mut self,
        id: &CommandId,
        agent: &AgentId,
        terminal: CommandStatus,
        result: Option<CommandResult>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, ForemanError> {
        if !terminal.is_terminal() {
            return Err(ForemanError::Validation(format!(
                "completion status must be terminal, got {terminal}"
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ForemanError::Store(format!("failed to begin transaction: {e}")))?;

        if !owns_running(&tx, id, agent)? {
            tx.commit()
                .map_err(|e| ForemanError::Store(format!("failed to commit: {e}")))?;
            return Ok(false);
        }

        let folded = CommandResult::fold(result, error);
        let result_json = folded
            .map(|r| serde_json::to_string(&r))
            .transpose()
            .map_err(|e| ForemanError::Store(format!("failed to serialize result: {e}")))?;

        tx.execute(
            "UPDATE commands SET status = ?1, result = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![terminal.as_str(), result_json, ts(now), id.to_string()],
        )
        .map_err(|e| ForemanError::Store(format!("failed to complete command: {e}")))?;

        tx.execute(
            "UPDATE agent_liveness SET current_command = NULL, last_heartbeat = ?1
             WHERE agent_id = ?2",
            params![ts(now), agent.as_str()],
        )
        .map_err(|e| ForemanError::Store(format!("failed to clear liveness: {e}")))?;

        tx.commit()
            .map_err(|e| ForemanError::Store(format!("failed to commit completion: {e}")))?;
        Ok(true)
    }

    /// Return a Running command to Pending on behalf of its owner.
    ///
    /// Used by crash-recovery requeue reports. Returns true iff the
    /// command was still Running and owned by the given agent. The
    /// requeueing agent is recorded so the HTTP layer can tell a
    /// replayed report from a command that went Pending some other way;
    /// the marker is consumed at the next assignment.
    pub fn requeue_for(
        &mut self,
        id: &CommandId,
        agent: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool, ForemanError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ForemanError::Store(format!("failed to begin transaction: {e}")))?;

        if !owns_running(&tx, id, agent)? {
            tx.commit()
                .map_err(|e| ForemanError::Store(format!("failed to commit: {e}")))?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE commands SET status = 'PENDING', owner = NULL, started_at = NULL,
             updated_at = ?1, requeued_by = ?2 WHERE id = ?3",
            params![ts(now), agent.as_str(), id.to_string()],
        )
        .map_err(|e| ForemanError::Store(format!("failed to requeue command: {e}")))?;

        tx.execute(
            "UPDATE agent_liveness SET current_command = NULL, last_heartbeat = ?1
             WHERE agent_id = ?2",
            params![ts(now), agent.as_str()],
        )
        .map_err(|e| ForemanError::Store(format!("failed to clear liveness: {e}")))?;

        tx.commit()
            .map_err(|e| ForemanError::Store(format!("failed to commit requeue: {e}")))?;
        Ok(true)
    }

    /// The agent whose requeue report caused the current Pending state,
    /// if that is how the command got there.
    pub fn requeued_by(&self, id: &CommandId) -> Result<Option<AgentId>, ForemanError> {
        self.conn
            .query_row(
                "SELECT requeued_by FROM commands WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|row| row.flatten().map(AgentId::new))
            .map_err(|e| ForemanError::Store(format!("failed to query requeue marker: {e}")))
    }

    /// Upsert the liveness row for an agent.
    ///
    /// `current` mirrors what the agent reports it is working on; `None`
    /// clears it (idle heartbeat).
    pub fn touch_heartbeat(
        &mut self,
        agent: &AgentId,
        current: Option<CommandId>,
        now: DateTime<Utc>,
    ) -> Result<(), ForemanError> {
        upsert_liveness(&self.conn, agent, current, now)
    }

    /// Look up an agent's liveness record.
    pub fn get_liveness(&self, agent: &AgentId) -> Result<Option<AgentLiveness>, ForemanError> {
        self.conn
            .query_row(
                "SELECT agent_id, last_heartbeat, current_command
                 FROM agent_liveness WHERE agent_id = ?1",
                params![agent.as_str()],
                |row| {
                    Ok(AgentLiveness {
                        agent_id: AgentId::new(row.get::<_, String>(0)?),
                        last_heartbeat: parse_ts_col(row.get::<_, String>(1)?, 1)?,
                        current_command: row
                            .get::<_, Option<String>>(2)?
                            .map(|s| parse_id_col(&s, 2))
                            .transpose()?,
                    })
                },
            )
            .optional()
            .map_err(|e| ForemanError::Store(format!("failed to query liveness: {e}")))
    }

    /// Server startup recovery: every Running command is returned to
    /// Pending. Progress at crash time is indeterminate, so retry.
    pub fn reclaim_crashed_running(&mut self, now: DateTime<Utc>) -> Result<usize, ForemanError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ForemanError::Store(format!("failed to begin transaction: {e}")))?;

        let count = tx
            .execute(
                "UPDATE commands SET status = 'PENDING', owner = NULL, started_at = NULL,
                 updated_at = ?1, requeued_by = NULL WHERE status = 'RUNNING'",
                params![ts(now)],
            )
            .map_err(|e| ForemanError::Store(format!("failed to reclaim running: {e}")))?;

        tx.execute("UPDATE agent_liveness SET current_command = NULL", [])
            .map_err(|e| ForemanError::Store(format!("failed to clear liveness: {e}")))?;

        tx.commit()
            .map_err(|e| ForemanError::Store(format!("failed to commit reclaim: {e}")))?;
        Ok(count)
    }

    /// Periodic reclamation: Running commands whose owner has not
    /// heartbeated since `cutoff` go back to Pending. A missing liveness
    /// row counts as stale.
    pub fn reclaim_stale(
        &mut self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, ForemanError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ForemanError::Store(format!("failed to begin transaction: {e}")))?;

        let stale: Vec<(String, Option<String>)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT c.id, c.owner FROM commands c
                     LEFT JOIN agent_liveness a ON a.agent_id = c.owner
                     WHERE c.status = 'RUNNING'
                       AND (a.last_heartbeat IS NULL OR a.last_heartbeat < ?1)",
                )
                .map_err(|e| ForemanError::Store(format!("failed to prepare stale query: {e}")))?;

            let rows = stmt
                .query_map(params![ts(cutoff)], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| ForemanError::Store(format!("failed to query stale: {e}")))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| ForemanError::Store(format!("failed to read stale row: {e}")))?
        };

        for (id, owner) in &stale {
            tx.execute(
                "UPDATE commands SET status = 'PENDING', owner = NULL, started_at = NULL,
                 updated_at = ?1, requeued_by = NULL WHERE id = ?2",
                params![ts(now), id],
            )
            .map_err(|e| ForemanError::Store(format!("failed to reclaim stale command: {e}")))?;

            if let Some(owner) = owner {
                tx.execute(
                    "UPDATE agent_liveness SET current_command = NULL WHERE agent_id = ?1",
                    params![owner],
                )
                .map_err(|e| ForemanError::Store(format!("failed to clear liveness: {e}")))?;
            }
        }

        tx.commit()
            .map_err(|e| ForemanError::Store(format!("failed to commit stale reclaim: {e}")))?;
        Ok(stale.len())
    }
}

/// Format a timestamp for storage. Fixed-width microseconds so that
/// lexicographic text ordering matches chronological ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn upsert_liveness(
    conn: &Connection,
    agent: &AgentId,
    current: Option<CommandId>,
    now: DateTime<Utc>,
) -> Result<(), ForemanError> {
    conn.execute(
        "INSERT INTO agent_liveness (agent_id, last_heartbeat, current_command)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(agent_id) DO UPDATE SET
             last_heartbeat = excluded.last_heartbeat,
             current_command = excluded.current_command",
        params![agent.as_str(), ts(now), current.map(|c| c.to_string())],
    )
    .map_err(|e| ForemanError::Store(format!("failed to upsert liveness: {e}")))?;
    Ok(())
}

fn running_for(conn: &Connection, agent: &AgentId) -> Result<Option<Command>, ForemanError> {
    conn.query_row(
        &format!(
            "SELECT {COMMAND_COLS} FROM commands
             WHERE owner = ?1 AND status = 'RUNNING' LIMIT 1"
        ),
        params![agent.as_str()],
        command_from_row,
    )
    .optional()
    .map_err(|e| ForemanError::Store(format!("failed to query running command: {e}")))
}

/// Whether the command is Running and owned by the given agent.
fn owns_running(
    conn: &Connection,
    id: &CommandId,
    agent: &AgentId,
) -> Result<bool, ForemanError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, owner FROM commands WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| ForemanError::Store(format!("failed to query command state: {e}")))?;

    Ok(matches!(
        row,
        Some((status, Some(owner))) if status == "RUNNING" && owner == agent.as_str()
    ))
}

/// Map one commands row to a [`Command`]. Conversion failures surface as
/// rusqlite errors so they propagate through `query_map`.
fn command_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let payload: CommandPayload = parse_json_col(&row.get::<_, String>(1)?, 1)?;
    let status = row.get::<_, String>(2)?;
    let status = CommandStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown status: {status}").into(),
        )
    })?;
    let result: Option<CommandResult> = row
        .get::<_, Option<String>>(3)?
        .map(|s| parse_json_col(&s, 3))
        .transpose()?;

    Ok(Command {
        id: parse_id_col(&row.get::<_, String>(0)?, 0)?,
        payload,
        status,
        result,
        owner: row.get::<_, Option<String>>(4)?.map(AgentId::new),
        created_at: parse_ts_col(row.get::<_, String>(5)?, 5)?,
        updated_at: parse_ts_col(row.get::<_, String>(6)?, 6)?,
        started_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_ts_col(s, 7))
            .transpose()?,
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_ts_col(s, 8))
            .transpose()?,
    })
}

fn parse_json_col<T: serde::de::DeserializeOwned>(
    raw: &str,
    idx: usize,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts_col(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_id_col(raw: &str, idx: usize) -> rusqlite::Result<CommandId> {
    CommandId::parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn test_store() -> CommandStore {
        CommandStore::open_in_memory().expect("open should succeed")
    }

    fn delay_command(now: DateTime<Utc>) -> Command {
        Command::new(CommandPayload::Delay { ms: 500 }, now)
    }

    /// Check the durable-checkpoint invariants over the whole store.
    fn assert_invariants(store: &CommandStore) {
        for cmd in store.list_commands().unwrap() {
            // Ownership agreement.
            if cmd.status == CommandStatus::Running {
                assert!(cmd.owner.is_some(), "running command without owner");
                assert!(cmd.started_at.is_some(), "running command without started_at");
            }
            if cmd.status == CommandStatus::Pending {
                assert!(cmd.owner.is_none(), "pending command with owner");
                assert!(cmd.started_at.is_none(), "pending command with started_at");
            }
            // Result gating.
            if cmd.result.is_some() {
                assert!(cmd.status.is_terminal(), "result on non-terminal command");
            }
            // Heartbeat correspondence.
            if cmd.status == CommandStatus::Running {
                let owner = cmd.owner.clone().unwrap();
                let liveness = store
                    .get_liveness(&owner)
                    .unwrap()
                    .expect("running command owner must have liveness");
                assert_eq!(liveness.current_command, Some(cmd.id));
            }
        }
    }

    #[test]
    fn open_creates_schema_on_disk() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = CommandStore::open(tmp.path()).unwrap();
        let cmd = delay_command(Utc::now());
        store.insert_command(&cmd).unwrap();
        assert!(store.get_command(&cmd.id).unwrap().is_some());
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let mut store = test_store();
        let cmd = Command::new(
            CommandPayload::HttpGetJson {
                url: "https://example.com/feed".into(),
            },
            Utc::now(),
        );
        store.insert_command(&cmd).unwrap();

        let loaded = store.get_command(&cmd.id).unwrap().unwrap();
        assert_eq!(loaded.id, cmd.id);
        assert_eq!(loaded.payload, cmd.payload);
        assert_eq!(loaded.status, CommandStatus::Pending);
        assert_eq!(loaded.result, None);
        assert_eq!(loaded.owner, None);
        // Timestamps survive the text column at microsecond precision.
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            cmd.created_at.timestamp_micros()
        );
    }

    #[test]
    fn insert_duplicate_id_rejected() {
        let mut store = test_store();
        let cmd = delay_command(Utc::now());
        store.insert_command(&cmd).unwrap();
        let err = store.insert_command(&cmd).unwrap_err();
        assert!(matches!(err, ForemanError::DuplicateId(_)));
    }

    #[test]
    fn get_unknown_command_is_none() {
        let store = test_store();
        assert!(store.get_command(&CommandId::generate()).unwrap().is_none());
    }

    #[test]
    fn list_orders_by_created_at() {
        let mut store = test_store();
        let base = Utc::now();
        let c = Command::new(CommandPayload::Delay { ms: 3 }, base + Duration::milliseconds(20));
        let a = Command::new(CommandPayload::Delay { ms: 1 }, base);
        let b = Command::new(CommandPayload::Delay { ms: 2 }, base + Duration::milliseconds(10));
        store.insert_command(&c).unwrap();
        store.insert_command(&a).unwrap();
        store.insert_command(&b).unwrap();

        let ids: Vec<CommandId> = store.list_commands().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn assign_claims_oldest_pending() {
        let mut store = test_store();
        let base = Utc::now();
        let first = Command::new(CommandPayload::Delay { ms: 1 }, base);
        let second = Command::new(CommandPayload::Delay { ms: 2 }, base + Duration::milliseconds(10));
        store.insert_command(&first).unwrap();
        store.insert_command(&second).unwrap();

        let agent = AgentId::new("agent-1");
        let now = Utc::now();
        let assigned = store.assign_next_to(&agent, now).unwrap().unwrap();
        assert_eq!(assigned.id, first.id);
        assert_eq!(assigned.status, CommandStatus::Running);
        assert_eq!(assigned.owner, Some(agent.clone()));
        assert_eq!(
            assigned.started_at.map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );
        assert_invariants(&store);
    }

    #[test]
    fn assign_is_idempotent_for_same_agent() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();

        let agent = AgentId::new("agent-1");
        let first = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();
        // A retried fetch gets the same record back, unchanged.
        let second = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();
        assert_eq!(first, second);
        assert_invariants(&store);
    }

    #[test]
    fn assign_gives_distinct_commands_to_distinct_agents() {
        let mut store = test_store();
        let base = Utc::now();
        let first = Command::new(CommandPayload::Delay { ms: 1 }, base);
        let second = Command::new(CommandPayload::Delay { ms: 2 }, base + Duration::milliseconds(5));
        store.insert_command(&first).unwrap();
        store.insert_command(&second).unwrap();

        let a = store
            .assign_next_to(&AgentId::new("agent-a"), Utc::now())
            .unwrap()
            .unwrap();
        let b = store
            .assign_next_to(&AgentId::new("agent-b"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_invariants(&store);
    }

    #[test]
    fn assign_returns_none_when_nothing_pending() {
        let mut store = test_store();
        assert!(store
            .assign_next_to(&AgentId::new("agent-1"), Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn assign_updates_liveness_mirror() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();

        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();
        let liveness = store.get_liveness(&agent).unwrap().unwrap();
        assert_eq!(liveness.current_command, Some(cmd.id));
    }

    #[test]
    fn complete_happy_path() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();
        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();

        let result = CommandResult::Delay(foreman_types::DelayOutcome {
            ok: true,
            took_ms: 512,
        });
        let now = Utc::now();
        let ok = store
            .complete(
                &cmd.id,
                &agent,
                CommandStatus::Completed,
                Some(result.clone()),
                None,
                now,
            )
            .unwrap();
        assert!(ok);

        let loaded = store.get_command(&cmd.id).unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Completed);
        assert_eq!(loaded.result, Some(result));
        assert!(loaded.completed_at.is_some());
        // Owner is retained for query visibility.
        assert_eq!(loaded.owner, Some(agent.clone()));

        // Liveness mirror cleared.
        let liveness = store.get_liveness(&agent).unwrap().unwrap();
        assert_eq!(liveness.current_command, None);
        assert_invariants(&store);
    }

    #[test]
    fn complete_folds_error_into_failure_result() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();
        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();

        store
            .complete(
                &cmd.id,
                &agent,
                CommandStatus::Failed,
                None,
                Some("executor blew up".into()),
                Utc::now(),
            )
            .unwrap();

        let loaded = store.get_command(&cmd.id).unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Failed);
        assert_eq!(
            loaded.result,
            Some(CommandResult::Failure(foreman_types::FailureOutcome {
                error: "executor blew up".into()
            }))
        );
    }

    #[test]
    fn complete_rejects_wrong_owner() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();
        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();

        let ok = store
            .complete(
                &cmd.id,
                &AgentId::new("agent-2"),
                CommandStatus::Completed,
                None,
                None,
                Utc::now(),
            )
            .unwrap();
        assert!(!ok);

        // Untouched.
        let loaded = store.get_command(&cmd.id).unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Running);
        assert_eq!(loaded.owner, Some(agent));
    }

    #[test]
    fn complete_rejects_non_running_command() {
        let mut store = test_store();
        let cmd = delay_command(Utc::now());
        store.insert_command(&cmd).unwrap();

        // Still Pending: no one may complete it.
        let ok = store
            .complete(
                &cmd.id,
                &AgentId::new("agent-1"),
                CommandStatus::Completed,
                None,
                None,
                Utc::now(),
            )
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn terminal_records_are_immutable() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();
        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();
        store
            .complete(&cmd.id, &agent, CommandStatus::Completed, None, None, Utc::now())
            .unwrap();
        let completed = store.get_command(&cmd.id).unwrap().unwrap();

        // A replayed completion does not mutate the record.
        let ok = store
            .complete(
                &cmd.id,
                &agent,
                CommandStatus::Failed,
                None,
                Some("late report".into()),
                Utc::now(),
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(store.get_command(&cmd.id).unwrap().unwrap(), completed);
    }

    #[test]
    fn complete_rejects_non_terminal_status() {
        let mut store = test_store();
        let err = store
            .complete(
                &CommandId::generate(),
                &AgentId::new("agent-1"),
                CommandStatus::Running,
                None,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ForemanError::Validation(_)));
    }

    #[test]
    fn requeue_returns_running_command_to_pending() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();
        let agent = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();

        assert!(store.requeue_for(&cmd.id, &agent, Utc::now()).unwrap());

        let loaded = store.get_command(&cmd.id).unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Pending);
        assert_eq!(loaded.owner, None);
        assert_eq!(loaded.started_at, None);
        // The requeueing agent is on record.
        assert_eq!(store.requeued_by(&cmd.id).unwrap(), Some(agent.clone()));
        assert_invariants(&store);

        // Replay is a no-op false.
        assert!(!store.requeue_for(&cmd.id, &agent, Utc::now()).unwrap());
    }

    #[test]
    fn requeue_marker_is_consumed_at_next_assignment() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();

        let first_owner = AgentId::new("agent-1");
        let cmd = store.assign_next_to(&first_owner, Utc::now()).unwrap().unwrap();
        store.requeue_for(&cmd.id, &first_owner, Utc::now()).unwrap();
        assert_eq!(store.requeued_by(&cmd.id).unwrap(), Some(first_owner));

        // Another agent picks the command up; the marker no longer
        // describes the current Pending-to-Running history.
        let second_owner = AgentId::new("agent-2");
        let again = store.assign_next_to(&second_owner, Utc::now()).unwrap().unwrap();
        assert_eq!(again.id, cmd.id);
        assert_eq!(store.requeued_by(&cmd.id).unwrap(), None);
    }

    #[test]
    fn reclaim_paths_do_not_leave_a_requeue_marker() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();

        let agent = AgentId::new("agent-1");
        let assign_time = Utc::now() - Duration::seconds(120);
        let cmd = store.assign_next_to(&agent, assign_time).unwrap().unwrap();
        store.touch_heartbeat(&agent, Some(cmd.id), assign_time).unwrap();

        store
            .reclaim_stale(Utc::now() - Duration::seconds(60), Utc::now())
            .unwrap();
        assert_eq!(
            store.get_command(&cmd.id).unwrap().unwrap().status,
            CommandStatus::Pending
        );
        assert_eq!(store.requeued_by(&cmd.id).unwrap(), None);

        store.assign_next_to(&agent, Utc::now()).unwrap().unwrap();
        store.reclaim_crashed_running(Utc::now()).unwrap();
        assert_eq!(store.requeued_by(&cmd.id).unwrap(), None);
    }

    #[test]
    fn touch_heartbeat_upserts_and_clears() {
        let mut store = test_store();
        let agent = AgentId::new("agent-1");
        let first = Utc::now();
        store.touch_heartbeat(&agent, None, first).unwrap();

        let liveness = store.get_liveness(&agent).unwrap().unwrap();
        assert_eq!(liveness.current_command, None);

        let cmd_id = CommandId::generate();
        let later = first + Duration::seconds(5);
        store.touch_heartbeat(&agent, Some(cmd_id), later).unwrap();

        let liveness = store.get_liveness(&agent).unwrap().unwrap();
        assert_eq!(liveness.current_command, Some(cmd_id));
        assert!(liveness.last_heartbeat > first);

        // Idle heartbeat clears the mirror again.
        store.touch_heartbeat(&agent, None, later + Duration::seconds(5)).unwrap();
        let liveness = store.get_liveness(&agent).unwrap().unwrap();
        assert_eq!(liveness.current_command, None);
    }

    #[test]
    fn reclaim_crashed_running_resets_everything() {
        let mut store = test_store();
        let base = Utc::now();
        store
            .insert_command(&Command::new(CommandPayload::Delay { ms: 1 }, base))
            .unwrap();
        store
            .insert_command(&Command::new(
                CommandPayload::Delay { ms: 2 },
                base + Duration::milliseconds(5),
            ))
            .unwrap();

        store.assign_next_to(&AgentId::new("agent-a"), Utc::now()).unwrap();
        store.assign_next_to(&AgentId::new("agent-b"), Utc::now()).unwrap();

        let count = store.reclaim_crashed_running(Utc::now()).unwrap();
        assert_eq!(count, 2);

        for cmd in store.list_commands().unwrap() {
            assert_eq!(cmd.status, CommandStatus::Pending);
            assert_eq!(cmd.owner, None);
            assert_eq!(cmd.started_at, None);
        }
        assert_invariants(&store);
    }

    #[test]
    fn reclaim_stale_only_touches_quiet_owners() {
        let mut store = test_store();
        let base = Utc::now();
        store
            .insert_command(&Command::new(CommandPayload::Delay { ms: 1 }, base))
            .unwrap();
        store
            .insert_command(&Command::new(
                CommandPayload::Delay { ms: 2 },
                base + Duration::milliseconds(5),
            ))
            .unwrap();

        let quiet = AgentId::new("agent-quiet");
        let chatty = AgentId::new("agent-chatty");
        let assign_time = Utc::now() - Duration::seconds(120);
        let quiet_cmd = store.assign_next_to(&quiet, assign_time).unwrap().unwrap();
        let chatty_cmd = store.assign_next_to(&chatty, assign_time).unwrap().unwrap();

        // Only the chatty agent heartbeats recently.
        store
            .touch_heartbeat(&chatty, Some(chatty_cmd.id), Utc::now())
            .unwrap();

        let cutoff = Utc::now() - Duration::seconds(60);
        let count = store.reclaim_stale(cutoff, Utc::now()).unwrap();
        assert_eq!(count, 1);

        let quiet_loaded = store.get_command(&quiet_cmd.id).unwrap().unwrap();
        assert_eq!(quiet_loaded.status, CommandStatus::Pending);
        assert_eq!(quiet_loaded.owner, None);
        assert_eq!(quiet_loaded.started_at, None);
        assert_eq!(store.get_liveness(&quiet).unwrap().unwrap().current_command, None);

        let chatty_loaded = store.get_command(&chatty_cmd.id).unwrap().unwrap();
        assert_eq!(chatty_loaded.status, CommandStatus::Running);
        assert_invariants(&store);
    }

    #[test]
    fn reclaimed_command_is_reassignable() {
        let mut store = test_store();
        store.insert_command(&delay_command(Utc::now())).unwrap();

        let dead = AgentId::new("agent-dead");
        let assign_time = Utc::now() - Duration::seconds(120);
        let cmd = store.assign_next_to(&dead, assign_time).unwrap().unwrap();
        // The dead agent's heartbeat is as old as the assignment.
        store.touch_heartbeat(&dead, Some(cmd.id), assign_time).unwrap();

        store
            .reclaim_stale(Utc::now() - Duration::seconds(60), Utc::now())
            .unwrap();

        // Possibly the same agent picks it back up after recovering.
        let again = store.assign_next_to(&dead, Utc::now()).unwrap().unwrap();
        assert_eq!(again.id, cmd.id);
        assert_eq!(again.status, CommandStatus::Running);
        assert_invariants(&store);
    }

    #[test]
    fn count_pending_tracks_transitions() {
        let mut store = test_store();
        assert_eq!(store.count_pending().unwrap(), 0);

        store.insert_command(&delay_command(Utc::now())).unwrap();
        assert_eq!(store.count_pending().unwrap(), 1);

        store.assign_next_to(&AgentId::new("agent-1"), Utc::now()).unwrap();
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let tmp = NamedTempFile::new().unwrap();
        let agent = AgentId::new("agent-1");
        let id;
        {
            let mut store = CommandStore::open(tmp.path()).unwrap();
            store.insert_command(&delay_command(Utc::now())).unwrap();
            id = store.assign_next_to(&agent, Utc::now()).unwrap().unwrap().id;
        }

        let store = CommandStore::open(tmp.path()).unwrap();
        let loaded = store.get_command(&id).unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Running);
        assert_eq!(loaded.owner, Some(agent));
    }
}
