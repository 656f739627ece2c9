//! Database pool construction. `sqlx::AnyPool` is used so `database.url`'s
//! scheme (`sqlite://` or `postgres://`) selects the backend without the
//! core depending on a concrete driver type — migrations are the only place
//! that needs a concrete backend decision, handled in `migrations/`.

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;

pub type DbPool = AnyPool;

pub async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    install_default_drivers();
    AnyPoolOptions::new().max_connections(20).connect(url).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
