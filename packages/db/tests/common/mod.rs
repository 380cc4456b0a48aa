use std::sync::LazyLock;

use tokio::runtime::Runtime;
use tokio::sync::{Mutex, MutexGuard};

use db::{DbConfig, DbError};

/// The connection is global, so tests touching it run one at a time.
static DB_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Each `#[tokio::test]` has its own runtime; the global connection's
/// background task must live on a runtime that outlives every test.
static DB_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("test runtime"));

/// Connect to the in-memory store and wipe both tables.
pub async fn fresh_store() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = DB_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("db init task panicked")?;
    db::get_db()?
        .query("DELETE job_execution; DELETE job_log;")
        .await?
        .check()?;
    Ok(guard)
}
