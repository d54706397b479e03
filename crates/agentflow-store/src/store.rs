use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::ExecutionStore;
use agentflow_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        agent_id TEXT,
        workflow_id TEXT,
        status TEXT NOT NULL,
        input_data TEXT NOT NULL,
        output_data TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        total_cost REAL NOT NULL DEFAULT 0,
        executed_by TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        CHECK ((agent_id IS NULL) <> (workflow_id IS NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_executions_created
        ON executions(created_at);

    CREATE TABLE IF NOT EXISTS execution_logs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
        step_number INTEGER NOT NULL,
        log_type TEXT NOT NULL,
        log_data TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_logs_execution
        ON execution_logs(execution_id, timestamp, seq);

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        definition TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        definition TEXT NOT NULL
    );";

const EXECUTION_COLUMNS: &str = "id, agent_id, workflow_id, status, input_data, output_data, \
     error_message, created_at, started_at, completed_at, total_tokens, total_cost, \
     executed_by, attempt";

/// SQLite-backed store for executions, their logs, and the agent/workflow catalog.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AgentflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets stream pollers read while a worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;

        let store = Self::init(conn)?;
        debug!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AgentflowError::Database(e.to_string()))
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> AgentflowError {
    AgentflowError::Database(e.to_string())
}

/// Fixed-precision RFC 3339 so lexical order equals time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AgentflowError::Database(format!("bad timestamp {}: {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Raw column values of an `executions` row.
struct ExecutionRow {
    id: String,
    agent_id: Option<String>,
    workflow_id: Option<String>,
    status: String,
    input_data: String,
    output_data: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    total_tokens: i64,
    total_cost: f64,
    executed_by: String,
    attempt: i64,
}

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            workflow_id: row.get(2)?,
            status: row.get(3)?,
            input_data: row.get(4)?,
            output_data: row.get(5)?,
            error_message: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            total_tokens: row.get(10)?,
            total_cost: row.get(11)?,
            executed_by: row.get(12)?,
            attempt: row.get(13)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let target = match (self.agent_id, self.workflow_id) {
            (Some(agent), None) => ExecutionTarget::Agent(agent),
            (None, Some(workflow)) => ExecutionTarget::Workflow(workflow),
            _ => {
                return Err(AgentflowError::Database(format!(
                    "execution {} must reference exactly one of agent or workflow",
                    self.id
                )))
            }
        };

        Ok(Execution {
            id: self.id.parse()?,
            target,
            status: self.status.parse()?,
            input_data: serde_json::from_str(&self.input_data)?,
            output_data: self
                .output_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            total_tokens: self.total_tokens.max(0) as u64,
            total_cost: self.total_cost,
            executed_by: self.executed_by,
            attempt: self.attempt.max(0) as u32,
        })
    }
}

struct LogRow {
    seq: i64,
    id: String,
    execution_id: String,
    step_number: i64,
    log_type: String,
    log_data: String,
    timestamp: String,
}

impl LogRow {
    fn into_log(self) -> Result<ExecutionLog> {
        Ok(ExecutionLog {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| AgentflowError::Database(format!("bad log id: {}", e)))?,
            seq: self.seq,
            execution_id: self.execution_id.parse()?,
            step_number: self.step_number.max(0) as u32,
            log_type: self.log_type.parse()?,
            log_data: serde_json::from_str(&self.log_data)?,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

fn load_execution(conn: &Connection, id: &str) -> Result<Option<Execution>> {
    let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
    conn.query_row(&sql, params![id], ExecutionRow::read)
        .optional()
        .map_err(db_err)?
        .map(ExecutionRow::into_execution)
        .transpose()
}

impl ExecutionStore for SqliteStore {
    fn insert_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();

        Box::pin(async move {
            let (agent_id, workflow_id) = match &execution.target {
                ExecutionTarget::Agent(id) => (Some(id.as_str()), None),
                ExecutionTarget::Workflow(id) => (None, Some(id.as_str())),
            };
            let input = serde_json::to_string(&execution.input_data)?;
            let output = execution
                .output_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO executions (id, agent_id, workflow_id, status, input_data, output_data,
                     error_message, created_at, started_at, completed_at, total_tokens, total_cost,
                     executed_by, attempt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    execution.id.to_string(),
                    agent_id,
                    workflow_id,
                    execution.status.as_str(),
                    input,
                    output,
                    execution.error_message,
                    ts(&execution.created_at),
                    execution.started_at.as_ref().map(ts),
                    execution.completed_at.as_ref().map(ts),
                    execution.total_tokens as i64,
                    execution.total_cost,
                    execution.executed_by,
                    execution.attempt,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            load_execution(&conn, &id)
        })
    }

    fn list_executions(&self, filter: &ExecutionFilter) -> BoxFuture<'_, Result<ExecutionPage>> {
        let filter = filter.clone();

        Box::pin(async move {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            if let Some(status) = filter.status {
                values.push(status.as_str().to_string());
                clauses.push(format!("status = ?{}", values.len()));
            }
            if let Some(agent_id) = &filter.agent_id {
                values.push(agent_id.clone());
                clauses.push(format!("agent_id = ?{}", values.len()));
            }
            if let Some(workflow_id) = &filter.workflow_id {
                values.push(workflow_id.clone());
                clauses.push(format!("workflow_id = ?{}", values.len()));
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let page = filter.page.max(1);
            let page_size = filter.page_size.clamp(1, 100);
            let offset = (page as u64 - 1) * page_size as u64;

            let conn = self.lock()?;
            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM executions {}", where_sql),
                    params_from_iter(values.iter()),
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            let sql = format!(
                "SELECT {} FROM executions {} ORDER BY created_at DESC, id LIMIT {} OFFSET {}",
                EXECUTION_COLUMNS, where_sql, page_size, offset
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), ExecutionRow::read)
                .map_err(db_err)?;

            let mut executions = Vec::new();
            for row in rows {
                executions.push(row.map_err(db_err)?.into_execution()?);
            }

            Ok(ExecutionPage {
                executions,
                total: total.max(0) as u64,
                page,
                page_size,
            })
        })
    }

    fn delete_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let deleted = conn
                .execute("DELETE FROM executions WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    fn claim_execution(
        &self,
        id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<u32>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE executions
                     SET status = 'running', started_at = ?2, attempt = attempt + 1
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, ts(&started_at)],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Ok(None);
            }

            let attempt: u32 = conn
                .query_row(
                    "SELECT attempt FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(Some(attempt))
        })
    }

    fn finish_execution(
        &self,
        id: &ExecutionId,
        attempt: u32,
        completion: &Completion,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let completion = completion.clone();

        Box::pin(async move {
            let output = completion
                .output_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE executions
                     SET status = ?3, output_data = ?4, error_message = ?5, completed_at = ?6,
                         total_tokens = ?7, total_cost = ?8
                     WHERE id = ?1 AND attempt = ?2
                       AND status NOT IN ('success', 'failed', 'cancelled')",
                    params![
                        id,
                        attempt,
                        completion.status.as_str(),
                        output,
                        completion.error_message,
                        ts(&completion.completed_at),
                        completion.usage.tokens as i64,
                        completion.usage.cost,
                    ],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn append_log(&self, log: NewLog) -> BoxFuture<'_, Result<ExecutionLog>> {
        Box::pin(async move {
            let id = Uuid::new_v4();
            let data = serde_json::to_string(&log.log_data)?;
            let opens = i64::from(log.log_type.opens_step());

            let conn = self.lock()?;
            // Stamped under the lock: seq, step and time orders agree
            let timestamp = Utc::now().trunc_subsecs(6);
            let (seq, step_number): (i64, u32) = conn
                .query_row(
                    "INSERT INTO execution_logs
                         (id, execution_id, step_number, log_type, log_data, timestamp)
                     SELECT ?1, ?2, max(coalesce(max(step_number), 0) + ?3, 1), ?4, ?5, ?6
                     FROM execution_logs WHERE execution_id = ?2
                     RETURNING seq, step_number",
                    params![
                        id.to_string(),
                        log.execution_id.to_string(),
                        opens,
                        log.log_type.as_str(),
                        data,
                        ts(&timestamp),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?;

            Ok(ExecutionLog {
                id,
                seq,
                execution_id: log.execution_id,
                step_number,
                log_type: log.log_type,
                log_data: log.log_data,
                timestamp,
            })
        })
    }

    fn logs_since(
        &self,
        id: &ExecutionId,
        after_seq: i64,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT seq, id, execution_id, step_number, log_type, log_data, timestamp
                     FROM execution_logs
                     WHERE execution_id = ?1 AND seq > ?2
                     ORDER BY timestamp ASC, seq ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![id, after_seq], |row| {
                    Ok(LogRow {
                        seq: row.get(0)?,
                        id: row.get(1)?,
                        execution_id: row.get(2)?,
                        step_number: row.get(3)?,
                        log_type: row.get(4)?,
                        log_data: row.get(5)?,
                        timestamp: row.get(6)?,
                    })
                })
                .map_err(db_err)?;

            let mut logs = Vec::new();
            for row in rows {
                logs.push(row.map_err(db_err)?.into_log()?);
            }
            Ok(logs)
        })
    }

    fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let removed = conn
                .execute(
                    "DELETE FROM execution_logs WHERE timestamp < ?1",
                    params![ts(&cutoff)],
                )
                .map_err(db_err)?;
            debug!(removed, cutoff = %cutoff, "Purged execution logs");
            Ok(removed)
        })
    }
}
