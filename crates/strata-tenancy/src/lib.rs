pub mod cache;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod store;

pub use cache::TenantCache;
pub use strata_core::tenant::{current_tenant, with_tenant, with_tenant_sync};
pub use pool::{PooledConnection, TenantPool};
pub use registry::{TenantInitializer, TenantRegistry, TenantUpdate};
pub use schema::SchemaNaming;
pub use store::{ExecutionTablesInitializer, SqliteExecutionStore};
