//! Connection pool that routes every checkout to the current tenant.
//!
//! Pooled connections open an empty in-memory `main` database. On each
//! checkout the tenant's schema file is attached first and `public` second,
//! so unqualified table names resolve against the tenant before the shared
//! registry. Connections are reused across tenants, so routing is redone on
//! every checkout, never only on connect.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::debug;

use strata_core::error::{Result, StrataError};

use strata_core::tenant::current_tenant;
use crate::schema::{quote_ident, SchemaNaming};

/// Name of the shared schema holding the tenant registry.
pub const PUBLIC_SCHEMA: &str = "public";

pub(crate) fn db_err(e: rusqlite::Error) -> StrataError {
    StrataError::Database(e.to_string())
}

pub struct TenantPool {
    data_dir: PathBuf,
    naming: SchemaNaming,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl TenantPool {
    pub fn new(data_dir: &Path, naming: SchemaNaming, max_idle: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            StrataError::Database(format!("Failed to create data directory: {}", e))
        })?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            naming,
            idle: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    pub fn naming(&self) -> &SchemaNaming {
        &self.naming
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File backing a schema.
    pub fn schema_path(&self, schema: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", schema))
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.schema_path(schema).exists()
    }

    /// Check out a connection routed to the task's current tenant.
    ///
    /// With no tenant in scope only `public` is attached.
    pub fn checkout(&self) -> Result<PooledConnection<'_>> {
        match current_tenant() {
            Some(tenant_id) => {
                let schema = self.naming.schema_name(&tenant_id)?;
                if !self.schema_exists(&schema) {
                    return Err(StrataError::TenantNotFound(tenant_id));
                }
                self.checkout_schema(Some(&schema))
            }
            None => self.checkout_schema(None),
        }
    }

    /// Check out a connection routed to an explicit schema.
    ///
    /// Attaching a schema whose file does not exist creates it; callers
    /// outside tenant creation go through [`checkout`](Self::checkout).
    pub(crate) fn checkout_schema(&self, schema: Option<&str>) -> Result<PooledConnection<'_>> {
        let conn = {
            let mut idle = self
                .idle
                .lock()
                .map_err(|e| StrataError::Database(e.to_string()))?;
            idle.pop()
        };
        let conn = match conn {
            Some(conn) => conn,
            None => Connection::open_in_memory().map_err(db_err)?,
        };
        self.route(&conn, schema)?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
        })
    }

    /// Databases attached to a connection, in lookup order.
    pub fn attached(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("PRAGMA database_list").map_err(db_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(names
            .into_iter()
            .filter(|n| n != "main" && n != "temp")
            .collect())
    }

    /// Equivalent of `SET search_path TO <schema>, public`.
    fn route(&self, conn: &Connection, schema: Option<&str>) -> Result<()> {
        let mut wanted: Vec<&str> = Vec::with_capacity(2);
        if let Some(schema) = schema.filter(|s| *s != PUBLIC_SCHEMA) {
            wanted.push(schema);
        }
        wanted.push(PUBLIC_SCHEMA);

        let attached = Self::attached(conn)?;
        if attached.iter().map(String::as_str).eq(wanted.iter().copied()) {
            return Ok(());
        }
        for name in &attached {
            conn.execute_batch(&format!("DETACH DATABASE {}", quote_ident(name)))
                .map_err(db_err)?;
        }
        for name in &wanted {
            let path = self.schema_path(name);
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_ident(name)),
                params![path.to_string_lossy().into_owned()],
            )
            .map_err(db_err)?;
        }
        debug!(search_path = ?wanted, "Connection routed");
        Ok(())
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }

    /// Drop every idle connection, releasing their file handles.
    pub fn clear_idle(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A routed connection that returns to the pool when dropped.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a TenantPool,
}

impl PooledConnection<'_> {
    /// Re-route this connection to `public` only.
    pub(crate) fn reset(&self) -> Result<()> {
        self.pool.route(self, None)
    }

    /// Close instead of returning to the pool.
    pub(crate) fn discard(mut self) {
        self.conn.take();
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` and `discard` take the connection out.
        self.conn.as_ref().expect("pooled connection present")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection present")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
