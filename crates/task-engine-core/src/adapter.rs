//! The `Adapter` trait -- the persistence backend the engine runs against.
//!
//! The engine itself only needs what the task repository needs (a `PgPool`
//! today); `Adapter` exists as the seam a second backend would implement,
//! mirroring the `alias`/`flavour`/`initialize` contract.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

/// A persistence backend hosting the transactional task store.
///
/// Object-safe so it can be stored as `Box<dyn Adapter>` or `Arc<dyn
/// Adapter>` by callers that need to swap backends at runtime.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable short name identifying this adapter instance (e.g. a
    /// connection pool label), used in logs and lease ownership strings.
    fn alias(&self) -> &str;

    /// The kind of backend this adapter wraps (e.g. `"postgres"`).
    fn flavour(&self) -> &str;

    /// Perform any one-time setup (schema migration, connection warm-up).
    /// Idempotent: safe to call on an already-initialized adapter.
    async fn initialize(&self) -> Result<()>;

    /// The connection pool backing this adapter, used by the task
    /// repository for CRUD and CAS operations.
    fn pool(&self) -> &PgPool;
}

/// The bundled PostgreSQL-backed adapter.
pub struct PostgresAdapter {
    alias: String,
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(alias: impl Into<String>, pool: PgPool) -> Self {
        Self {
            alias: alias.into(),
            pool,
        }
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn flavour(&self) -> &str {
        "postgres"
    }

    async fn initialize(&self) -> Result<()> {
        task_engine_db::pool::run_migrations(&self.pool).await
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// Compile-time assertion: Adapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Adapter) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_is_object_safe() {
        fn _takes_dyn(_: &dyn Adapter) {}
    }
}
