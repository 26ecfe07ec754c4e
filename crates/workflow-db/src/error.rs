use thiserror::Error;

/// Errors surfaced by the relational store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
