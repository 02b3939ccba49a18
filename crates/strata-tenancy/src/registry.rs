use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_core::config::TenancyConfig;
use strata_core::error::{Result, StrataError};
use strata_core::types::{Tenant, TenantStatus};

use crate::cache::TenantCache;
use strata_core::tenant::with_tenant;
use crate::pool::{db_err, TenantPool};
use crate::schema::SchemaNaming;
use crate::store::parse_ts;

/// Per-tenant setup run inside the creation transaction.
pub trait TenantInitializer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Create this component's objects in `schema`. DDL must be schema-qualified.
    fn initialize(&self, tx: &Transaction<'_>, schema: &str) -> Result<()>;
}

/// Fields changed by [`TenantRegistry::update_tenant`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct TenantUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

const TENANT_COLUMNS: &str = "tenant_id, name, description, status, schema_name, metadata,
    is_schema_initialized, created_at, updated_at";

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let status: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(Tenant {
        tenant_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: status.parse().unwrap_or(TenantStatus::Inactive),
        schema_name: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        is_schema_initialized: row.get(6)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

/// Tenant registry in the shared `public` schema, plus the active-tenant cache.
pub struct TenantRegistry {
    pool: Arc<TenantPool>,
    cache: TenantCache,
    initializers: Vec<Arc<dyn TenantInitializer>>,
    default_tenant: Option<String>,
}

impl TenantRegistry {
    /// Open the registry under the configured data directory.
    pub fn open(config: &TenancyConfig) -> Result<Self> {
        let naming = SchemaNaming::from_config(config)?;
        let pool = Arc::new(TenantPool::new(
            &config.data_dir(),
            naming,
            config.max_idle_connections,
        )?);
        Self::with_pool(pool, config)
    }

    pub fn with_pool(pool: Arc<TenantPool>, config: &TenancyConfig) -> Result<Self> {
        {
            let conn = pool.checkout_schema(None)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS public._tenants (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT,
                    status TEXT NOT NULL,
                    schema_name TEXT NOT NULL UNIQUE,
                    metadata TEXT NOT NULL,
                    is_schema_initialized INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS public.idx_tenants_status ON _tenants(status);",
            )
            .map_err(db_err)?;
        }
        debug!(data_dir = %pool.data_dir().display(), "Tenant registry opened");
        Ok(Self {
            pool,
            cache: TenantCache::new(config.cache_ttl()),
            initializers: Vec::new(),
            default_tenant: config.default_tenant.clone(),
        })
    }

    /// Add an initializer run for every tenant created afterwards.
    pub fn with_initializer(mut self, initializer: impl TenantInitializer) -> Self {
        self.initializers.push(Arc::new(initializer));
        self
    }

    pub fn pool(&self) -> &Arc<TenantPool> {
        &self.pool
    }

    pub fn cache(&self) -> &TenantCache {
        &self.cache
    }

    /// Create the tenant's schema, registry row, and initialized objects atomically.
    ///
    /// Any initializer failure rolls everything back and removes the schema file.
    pub fn create_tenant(
        &self,
        tenant_id: &str,
        name: &str,
        description: Option<&str>,
        metadata: Value,
    ) -> Result<Tenant> {
        let schema = self.pool.naming().schema_name(tenant_id)?;
        if self.get_tenant(tenant_id)?.is_some() {
            return Err(StrataError::TenantExists(tenant_id.to_string()));
        }
        let existed = self.pool.schema_exists(&schema);

        let mut conn = self.pool.checkout_schema(Some(&schema))?;
        let result = self.insert_and_initialize(&mut conn, tenant_id, &schema, name, description, metadata);
        match result {
            Ok(tenant) => {
                drop(conn);
                self.cache.insert(tenant_id);
                info!(tenant_id, schema = %schema, "Tenant created");
                Ok(tenant)
            }
            Err(e) => {
                warn!(tenant_id, schema = %schema, error = %e, "Tenant creation failed, rolling back");
                if let Err(reset) = conn.reset() {
                    warn!(error = %reset, "Failed to detach schema after rollback");
                }
                conn.discard();
                if !existed {
                    self.remove_schema_files(&schema);
                }
                Err(e)
            }
        }
    }

    fn insert_and_initialize(
        &self,
        conn: &mut Connection,
        tenant_id: &str,
        schema: &str,
        name: &str,
        description: Option<&str>,
        metadata: Value,
    ) -> Result<Tenant> {
        let now = Utc::now();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO public._tenants
                (tenant_id, name, description, status, schema_name, metadata,
                 is_schema_initialized, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                tenant_id,
                name,
                description,
                TenantStatus::Active.as_str(),
                schema,
                metadata.to_string(),
                now.to_rfc3339()
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StrataError::TenantExists(tenant_id.to_string())
            }
            other => db_err(other),
        })?;

        for initializer in &self.initializers {
            initializer.initialize(&tx, schema)?;
            debug!(tenant_id, initializer = initializer.name(), "Initializer applied");
        }

        tx.execute(
            "UPDATE public._tenants SET is_schema_initialized = 1 WHERE tenant_id = ?1",
            params![tenant_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(Tenant {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            status: TenantStatus::Active,
            schema_name: schema.to_string(),
            metadata,
            is_schema_initialized: true,
            created_at: now,
            updated_at: now,
        })
    }

    fn remove_schema_files(&self, schema: &str) {
        let base = self.pool.schema_path(schema);
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", base.display(), suffix));
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove schema file");
                }
            }
        }
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.pool.checkout_schema(None)?;
        conn.query_row(
            &format!("SELECT {} FROM public._tenants WHERE tenant_id = ?1", TENANT_COLUMNS),
            params![tenant_id],
            tenant_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// All tenants, optionally filtered by status, ordered by id.
    pub fn list_tenants(&self, status: Option<TenantStatus>) -> Result<Vec<Tenant>> {
        let conn = self.pool.checkout_schema(None)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM public._tenants
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY tenant_id",
                TENANT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], tenant_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    pub fn update_tenant(&self, tenant_id: &str, update: TenantUpdate) -> Result<Tenant> {
        let mut tenant = self
            .get_tenant(tenant_id)?
            .ok_or_else(|| StrataError::TenantNotFound(tenant_id.to_string()))?;
        if let Some(name) = update.name {
            tenant.name = name;
        }
        if let Some(description) = update.description {
            tenant.description = Some(description);
        }
        if let Some(metadata) = update.metadata {
            tenant.metadata = metadata;
        }
        tenant.updated_at = Utc::now();

        let conn = self.pool.checkout_schema(None)?;
        conn.execute(
            "UPDATE public._tenants
             SET name = ?2, description = ?3, metadata = ?4, updated_at = ?5
             WHERE tenant_id = ?1",
            params![
                tenant_id,
                tenant.name,
                tenant.description,
                tenant.metadata.to_string(),
                tenant.updated_at.to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        info!(tenant_id, "Tenant updated");
        Ok(tenant)
    }

    fn set_status(&self, tenant_id: &str, status: TenantStatus) -> Result<()> {
        let conn = self.pool.checkout_schema(None)?;
        let changed = conn
            .execute(
                "UPDATE public._tenants SET status = ?2, updated_at = ?3 WHERE tenant_id = ?1",
                params![tenant_id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StrataError::TenantNotFound(tenant_id.to_string()));
        }
        match status {
            TenantStatus::Active => self.cache.insert(tenant_id),
            TenantStatus::Inactive => self.cache.remove(tenant_id),
        }
        info!(tenant_id, status = %status, "Tenant status changed");
        Ok(())
    }

    pub fn activate_tenant(&self, tenant_id: &str) -> Result<()> {
        self.set_status(tenant_id, TenantStatus::Active)
    }

    pub fn deactivate_tenant(&self, tenant_id: &str) -> Result<()> {
        self.set_status(tenant_id, TenantStatus::Inactive)
    }

    /// Remove the registry row, and the schema itself when `drop_schema` is set.
    pub fn delete_tenant(&self, tenant_id: &str, drop_schema: bool) -> Result<()> {
        let tenant = self
            .get_tenant(tenant_id)?
            .ok_or_else(|| StrataError::TenantNotFound(tenant_id.to_string()))?;
        {
            let conn = self.pool.checkout_schema(None)?;
            conn.execute(
                "DELETE FROM public._tenants WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .map_err(db_err)?;
        }
        self.cache.remove(tenant_id);
        if drop_schema {
            // Idle connections may still have the schema attached.
            self.pool.clear_idle();
            self.remove_schema_files(&tenant.schema_name);
        }
        info!(tenant_id, drop_schema, "Tenant deleted");
        Ok(())
    }

    /// Reload the active-tenant cache. Returns the number of active tenants.
    pub fn refresh_cache(&self) -> Result<usize> {
        let active: Vec<String> = self
            .list_tenants(Some(TenantStatus::Active))?
            .into_iter()
            .map(|t| t.tenant_id)
            .collect();
        let count = active.len();
        self.cache.replace(active);
        debug!(active = count, "Tenant cache refreshed");
        Ok(count)
    }

    /// Whether a tenant is active, consulting the registry when the cache is stale.
    pub fn is_active(&self, tenant_id: &str) -> Result<bool> {
        if let Some(active) = self.cache.is_active(tenant_id) {
            return Ok(active);
        }
        self.refresh_cache()?;
        Ok(self.cache.is_active(tenant_id).unwrap_or(false))
    }

    /// Resolve an explicit tenant or the configured default, requiring it to be active.
    pub fn resolve_tenant(&self, tenant_id: Option<&str>) -> Result<String> {
        let tenant_id = match tenant_id.or(self.default_tenant.as_deref()) {
            Some(id) => id.to_string(),
            None => {
                return Err(StrataError::Validation(
                    "no tenant given and no default_tenant configured".into(),
                ))
            }
        };
        if self.is_active(&tenant_id)? {
            return Ok(tenant_id);
        }
        match self.get_tenant(&tenant_id)? {
            Some(_) => Err(StrataError::TenantInactive(tenant_id)),
            None => Err(StrataError::TenantNotFound(tenant_id)),
        }
    }

    /// Run `fut` scoped to an active tenant.
    pub async fn run_as<F: Future>(&self, tenant_id: Option<&str>, fut: F) -> Result<F::Output> {
        let tenant_id = self.resolve_tenant(tenant_id)?;
        Ok(with_tenant(tenant_id, fut).await)
    }

    /// Refresh the cache every `interval` until cancelled.
    pub fn spawn_cache_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Tenant cache refresher started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        info!("Tenant cache refresher shutting down");
                        break;
                    }
                }
                if let Err(e) = registry.refresh_cache() {
                    warn!(error = %e, "Tenant cache refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::ExecutionTablesInitializer;

    fn config(dir: &std::path::Path) -> TenancyConfig {
        TenancyConfig {
            data_dir: dir.to_string_lossy().into_owned(),
            ..TenancyConfig::default()
        }
    }

    struct Failing;

    impl TenantInitializer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn initialize(&self, _tx: &Transaction<'_>, _schema: &str) -> Result<()> {
            Err(StrataError::Database("disk quota exceeded".into()))
        }
    }

    #[test]
    fn create_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path()))
            .unwrap()
            .with_initializer(ExecutionTablesInitializer);

        let tenant = registry
            .create_tenant("acme", "Acme Corp", Some("first"), json!({"tier": "gold"}))
            .unwrap();
        assert_eq!(tenant.schema_name, "tenant_acme");
        assert!(tenant.is_schema_initialized);
        assert!(dir.path().join("tenant_acme.db").exists());

        registry.create_tenant("globex", "Globex", None, json!({})).unwrap();

        let loaded = registry.get_tenant("acme").unwrap().unwrap();
        assert_eq!(loaded.name, "Acme Corp");
        assert_eq!(loaded.metadata, json!({"tier": "gold"}));
        assert!(loaded.is_schema_initialized);

        let ids: Vec<String> = registry
            .list_tenants(None)
            .unwrap()
            .into_iter()
            .map(|t| t.tenant_id)
            .collect();
        assert_eq!(ids, vec!["acme", "globex"]);
    }

    #[test]
    fn duplicate_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path())).unwrap();
        registry.create_tenant("acme", "Acme", None, json!({})).unwrap();

        let err = registry.create_tenant("acme", "Again", None, json!({})).unwrap_err();
        assert!(matches!(err, StrataError::TenantExists(_)));

        let err = registry.create_tenant("Bad-Id", "Bad", None, json!({})).unwrap_err();
        assert!(matches!(err, StrataError::InvalidTenantId(_)));
    }

    #[test]
    fn initializer_failure_leaves_no_partial_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path()))
            .unwrap()
            .with_initializer(ExecutionTablesInitializer)
            .with_initializer(Failing);

        let err = registry.create_tenant("acme", "Acme", None, json!({})).unwrap_err();
        assert!(matches!(err, StrataError::Database(_)));
        assert!(registry.get_tenant("acme").unwrap().is_none());
        assert!(!dir.path().join("tenant_acme.db").exists());
        assert_eq!(registry.cache().is_active("acme"), None);
    }

    #[test]
    fn status_transitions_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.default_tenant = Some("acme".into());
        let registry = TenantRegistry::open(&cfg).unwrap();
        registry.create_tenant("acme", "Acme", None, json!({})).unwrap();

        assert_eq!(registry.resolve_tenant(None).unwrap(), "acme");

        registry.deactivate_tenant("acme").unwrap();
        assert!(!registry.is_active("acme").unwrap());
        assert!(matches!(
            registry.resolve_tenant(Some("acme")),
            Err(StrataError::TenantInactive(_))
        ));
        assert_eq!(registry.list_tenants(Some(TenantStatus::Active)).unwrap().len(), 0);

        registry.activate_tenant("acme").unwrap();
        assert!(registry.is_active("acme").unwrap());

        assert!(matches!(
            registry.resolve_tenant(Some("nobody")),
            Err(StrataError::TenantNotFound(_))
        ));
        assert!(matches!(
            registry.deactivate_tenant("nobody"),
            Err(StrataError::TenantNotFound(_))
        ));
    }

    #[test]
    fn update_keeps_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path())).unwrap();
        registry
            .create_tenant("acme", "Acme", Some("desc"), json!({"a": 1}))
            .unwrap();
        let updated = registry
            .update_tenant(
                "acme",
                TenantUpdate {
                    name: Some("Acme Inc".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Acme Inc");
        let loaded = registry.get_tenant("acme").unwrap().unwrap();
        assert_eq!(loaded.name, "Acme Inc");
        assert_eq!(loaded.description.as_deref(), Some("desc"));
        assert_eq!(loaded.metadata, json!({"a": 1}));
    }

    #[test]
    fn delete_with_schema_drop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path())).unwrap();
        registry.create_tenant("acme", "Acme", None, json!({})).unwrap();
        registry.create_tenant("keep", "Keep", None, json!({})).unwrap();

        registry.delete_tenant("acme", true).unwrap();
        registry.delete_tenant("keep", false).unwrap();
        assert!(!dir.path().join("tenant_acme.db").exists());
        assert!(dir.path().join("tenant_keep.db").exists());
        assert!(registry.list_tenants(None).unwrap().is_empty());
        assert!(matches!(
            registry.delete_tenant("acme", true),
            Err(StrataError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_as_scopes_the_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(&config(dir.path())).unwrap();
        registry.create_tenant("acme", "Acme", None, json!({})).unwrap();
        let seen = registry
            .run_as(Some("acme"), async { strata_core::tenant::current_tenant() })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("acme"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_reloads_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TenantRegistry::open(&config(dir.path())).unwrap());
        registry.create_tenant("acme", "Acme", None, json!({})).unwrap();
        registry.cache().invalidate();
        assert_eq!(registry.cache().is_active("acme"), None);

        let cancel = CancellationToken::new();
        let handle = registry.spawn_cache_refresher(Duration::from_secs(30), cancel.clone());
        for _ in 0..10 {
            if registry.cache().is_active("acme").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert_eq!(registry.cache().is_active("acme"), Some(true));

        cancel.cancel();
        handle.await.unwrap();
    }
}
