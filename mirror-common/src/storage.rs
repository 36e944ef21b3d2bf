//! # Storage
//!
//! The destination of mirrored items. `Storage` is the capability the pipeline writes
//! through; `PgStorage` implements it on a PostgreSQL table.
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::error;

use crate::item::{Item, ItemId};

/// Name of the statement registered by `setup` to insert one item.
pub const INSERT_ITEM: &str = "insert_item";

/// Enumeration of errors for operations with `Storage`.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        error: sqlx::Error,
    },
    #[error("item {id} is already stored")]
    Duplicate { id: ItemId },
    #[error("no statement named {0} has been registered")]
    UnknownStatement(String),
    #[error("{0} is not a valid table name")]
    InvalidTableName(String),
    #[error("statement registry lock was poisoned")]
    PoisonedLock,
}

impl StorageError {
    /// A short, low cardinality name for use as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Connection { .. } => "connection",
            StorageError::Query { .. } => "query",
            StorageError::Duplicate { .. } => "duplicate",
            StorageError::UnknownStatement(_) => "unknown_statement",
            StorageError::InvalidTableName(_) => "invalid_table_name",
            StorageError::PoisonedLock => "poisoned_lock",
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create the destination table if needed and register the named statements.
    /// Safe to call more than once.
    async fn setup(&self) -> Result<(), StorageError>;

    /// Run a registered statement with a serialized item as its only argument.
    async fn execute(&self, statement: &str, item: &Item) -> Result<(), StorageError>;
}

/// Items stored as rows of a PostgreSQL table: `id`, `author`, `time` and the raw `item`.
pub struct PgStorage {
    table: String,
    pool: PgPool,
    statements: RwLock<HashMap<String, String>>,
}

impl PgStorage {
    /// Connect to PostgreSQL. Fails immediately if no connection can be established.
    pub async fn new(
        table: &str,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StorageError::Connection { error })?;

        Self::new_from_pool(table, pool)
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Result<Self, StorageError> {
        if !is_valid_identifier(table) {
            return Err(StorageError::InvalidTableName(table.to_owned()));
        }

        Ok(Self {
            table: table.to_owned(),
            pool,
            statements: RwLock::new(HashMap::new()),
        })
    }

    fn statement(&self, name: &str) -> Result<String, StorageError> {
        let Ok(statements) = self.statements.read() else {
            error!("poisoned PgStorage statements lock");
            return Err(StorageError::PoisonedLock);
        };

        statements
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStatement(name.to_owned()))
    }

    fn register(&self, name: &str, query: String) -> Result<(), StorageError> {
        let Ok(mut statements) = self.statements.write() else {
            error!("poisoned PgStorage statements lock");
            return Err(StorageError::PoisonedLock);
        };

        statements.insert(name.to_owned(), query);
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn setup(&self) -> Result<(), StorageError> {
        sqlx::query(&create_table_query(&self.table))
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::Query {
                command: "CREATE TABLE".to_owned(),
                error,
            })?;

        self.register(INSERT_ITEM, insert_item_query(&self.table))
    }

    async fn execute(&self, statement: &str, item: &Item) -> Result<(), StorageError> {
        let query = self.statement(statement)?;

        // sqlx prepares and caches the statement per connection, so repeated
        // executions of the same name reuse the server side plan.
        sqlx::query(&query)
            .bind(item.raw())
            .execute(&self.pool)
            .await
            .map_err(|error| match error {
                sqlx::Error::Database(ref db_error) if db_error.is_unique_violation() => {
                    StorageError::Duplicate { id: item.id }
                }
                error => StorageError::Query {
                    command: statement.to_owned(),
                    error,
                },
            })?;

        Ok(())
    }
}

/// Table names are interpolated into SQL, so we only accept plain identifiers.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn create_table_query(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT PRIMARY KEY,
    author TEXT,
    time BIGINT,
    item JSONB NOT NULL
)
        "#
    )
}

fn insert_item_query(table: &str) -> String {
    format!(
        r#"
INSERT INTO {table} (id, author, time, item)
SELECT
    (payload->>'id')::BIGINT,
    payload->>'by',
    (payload->>'time')::BIGINT,
    payload
FROM (SELECT $1::TEXT::JSONB AS payload) AS incoming
        "#
    )
}
