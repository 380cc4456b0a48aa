//! Process-wide SurrealDB connection.

use std::sync::LazyLock;

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Connection handle shared by every repository.
pub type Database = Surreal<Any>;

struct Connection {
    db: Database,
    endpoint: String,
}

static CONNECTION: LazyLock<OnceCell<Connection>> = LazyLock::new(OnceCell::new);

/// Endpoint schemes this build can open.
const SCHEMES: &[&str] = &["mem", "rocksdb", "ws", "wss", "http", "https"];

/// Where the execution store lives.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `mem://`, `rocksdb://path` or a remote `ws://host:port`.
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Root user and password for remote servers.
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::endpoint("mem://")
    }
}

impl DbConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "dispatch".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    /// On-disk store; needs the `rocksdb` feature.
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self::endpoint(format!("rocksdb://{}", path.into()))
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    fn scheme(&self) -> Option<&str> {
        self.endpoint.split_once("://").map(|(scheme, _)| scheme)
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database not initialized, call init_db first")]
    NotInitialized,
    #[error("unsupported database endpoint: {0}")]
    UnsupportedEndpoint(String),
    #[error("connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("query error: {0}")]
    Query(String),
}

async fn open(config: &DbConfig) -> Result<Connection, DbError> {
    if !config.scheme().is_some_and(|s| SCHEMES.contains(&s)) {
        return Err(DbError::UnsupportedEndpoint(config.endpoint.clone()));
    }
    tracing::info!("Connecting to execution store at {}", config.endpoint);

    let db = connect(config.endpoint.as_str()).await?;
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }
    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!("Using {}/{}", config.namespace, config.database);
    Ok(Connection {
        db,
        endpoint: config.endpoint.clone(),
    })
}

/// Open the global connection.
///
/// Only the first call connects; later calls get the same handle back.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    let connection = CONNECTION.get_or_try_init(|| open(&config)).await?;
    if connection.endpoint != config.endpoint {
        tracing::warn!(
            "Database already connected to {}, ignoring {}",
            connection.endpoint,
            config.endpoint
        );
    }
    Ok(&connection.db)
}

pub fn get_db() -> Result<&'static Database, DbError> {
    CONNECTION
        .get()
        .map(|c| &c.db)
        .ok_or(DbError::NotInitialized)
}
