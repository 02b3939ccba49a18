use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Transaction};

use strata_core::error::{Result, StrataError};
use strata_core::traits::ExecutionStore;
use strata_core::types::{ApprovalRequest, ApprovalStatus, ExecutionRecord, StepResult};
use strata_core::workflow::WorkflowDefinition;

use strata_core::tenant::current_tenant;
use crate::pool::{db_err, PooledConnection, TenantPool};
use crate::registry::TenantInitializer;
use crate::schema::quote_ident;

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Creates the execution tables in each new tenant schema.
pub struct ExecutionTablesInitializer;

impl TenantInitializer for ExecutionTablesInitializer {
    fn name(&self) -> &str {
        "execution_tables"
    }

    fn initialize(&self, tx: &Transaction<'_>, schema: &str) -> Result<()> {
        let s = quote_ident(schema);
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {s}.workflows (
                workflow_id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.workflow_executions (
                execution_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS {s}.idx_executions_created
                ON workflow_executions(created_at);

            CREATE TABLE IF NOT EXISTS {s}.step_executions (
                execution_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (execution_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS {s}.approval_requests (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                request TEXT NOT NULL,
                requested_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS {s}.idx_approvals_status
                ON approval_requests(status, requested_at);"
        ))
        .map_err(db_err)
    }
}

/// Execution store whose tables live in the current tenant's schema.
///
/// Every call resolves the tenant from the task scope; a call made outside
/// any tenant scope is rejected rather than falling through to `public`.
pub struct SqliteExecutionStore {
    pool: Arc<TenantPool>,
}

impl SqliteExecutionStore {
    pub fn new(pool: Arc<TenantPool>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection<'_>> {
        if current_tenant().is_none() {
            return Err(StrataError::Validation(
                "execution store used outside a tenant scope".into(),
            ));
        }
        self.pool.checkout()
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn save_workflow(&self, workflow: WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let definition = serde_json::to_string(&workflow)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO workflows (workflow_id, definition, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![workflow.workflow_id, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_workflow(&self, workflow_id: String) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM workflows WHERE workflow_id = ?1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            definition
                .map(|d| serde_json::from_str(&d).map_err(StrataError::from))
                .transpose()
        })
    }

    fn save_execution(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO workflow_executions
                    (execution_id, workflow_id, status, error_message, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.execution_id,
                    record.workflow_id,
                    record.status.as_str(),
                    record.error_message,
                    record.snapshot.to_string(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT execution_id, workflow_id, status, error_message, snapshot, created_at, updated_at
                 FROM workflow_executions WHERE execution_id = ?1",
                params![execution_id],
                record_from_row,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT execution_id, workflow_id, status, error_message, snapshot, created_at, updated_at
                     FROM workflow_executions
                     ORDER BY created_at DESC
                     LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], record_from_row)
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)
        })
    }

    fn save_step_result(
        &self,
        execution_id: String,
        result: StepResult,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&result)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO step_executions (execution_id, step_id, status, result, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution_id,
                    result.step_id,
                    result.status.as_str(),
                    json,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_step_results(&self, execution_id: String) -> BoxFuture<'_, Result<Vec<StepResult>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT result FROM step_executions WHERE execution_id = ?1 ORDER BY step_id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![execution_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(serde_json::from_str(&row.map_err(db_err)?)?);
            }
            Ok(results)
        })
    }

    fn save_approval(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&request)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO approval_requests
                    (id, execution_id, step_id, status, request, requested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.id,
                    request.execution_id,
                    request.step_id,
                    request.status.as_str(),
                    json,
                    request.requested_at.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_approval(&self, id: String) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT request FROM approval_requests WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(StrataError::from))
                .transpose()
        })
    }

    fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT request FROM approval_requests
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY requested_at",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?;
            let mut requests = Vec::new();
            for row in rows {
                requests.push(serde_json::from_str(&row.map_err(db_err)?)?);
            }
            Ok(requests)
        })
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(2)?;
    let snapshot: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(ExecutionRecord {
        execution_id: row.get(0)?,
        workflow_id: row.get(1)?,
        status: status.parse().unwrap_or(strata_core::types::ExecutionStatus::Failed),
        error_message: row.get(3)?,
        snapshot: serde_json::from_str(&snapshot).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}
