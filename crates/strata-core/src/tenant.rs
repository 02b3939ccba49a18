//! Task-scoped tenant identity.
//!
//! The tenant id travels with the task, not with a connection or an engine:
//! pool checkouts and in-memory engine lookups both read it again.

use std::future::Future;

tokio::task_local! {
    static CURRENT_TENANT: String;
}

/// Run `fut` with `tenant_id` as the current tenant.
pub async fn with_tenant<F: Future>(tenant_id: impl Into<String>, fut: F) -> F::Output {
    CURRENT_TENANT.scope(tenant_id.into(), fut).await
}

/// Synchronous variant of [`with_tenant`].
pub fn with_tenant_sync<R>(tenant_id: impl Into<String>, f: impl FnOnce() -> R) -> R {
    CURRENT_TENANT.sync_scope(tenant_id.into(), f)
}

/// The tenant of the current task, if one is in scope.
pub fn current_tenant() -> Option<String> {
    CURRENT_TENANT.try_with(|t| t.clone()).ok()
}

/// Key for tenant-partitioned in-memory state. Tasks without a tenant share
/// the empty scope.
pub fn tenant_scope() -> String {
    current_tenant().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_is_task_local() {
        assert_eq!(current_tenant(), None);
        let seen = with_tenant("acme", async { current_tenant() }).await;
        assert_eq!(seen.as_deref(), Some("acme"));
        assert_eq!(current_tenant(), None);
    }

    #[tokio::test]
    async fn nested_scopes_restore_outer() {
        with_tenant("outer", async {
            let inner = with_tenant("inner", async { current_tenant() }).await;
            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(current_tenant().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn scope_defaults_to_empty() {
        assert_eq!(tenant_scope(), "");
        assert_eq!(with_tenant("acme", async { tenant_scope() }).await, "acme");
    }

    #[test]
    fn sync_scope() {
        let seen = with_tenant_sync("acme", current_tenant);
        assert_eq!(seen.as_deref(), Some("acme"));
    }
}
