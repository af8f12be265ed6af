use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown member: {0}")]
    UnknownMember(String),

    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    #[error("duplicate definition: {0}")]
    DuplicateDefinition(String),

    #[error("cyclic measure definition: {0}")]
    CyclicDefinition(String),

    #[error("measure '{measure}' depends on '{dependency}', which is not part of this query")]
    UnresolvedDependency { measure: String, dependency: String },

    #[error("rebuild already in progress for rollup '{0}'")]
    RebuildInProgress(String),

    #[error("rollup '{0}' definition changed; run a full rebuild")]
    DefinitionChanged(String),

    #[error("incomparable periods: {0}")]
    IncomparablePeriods(String),

    #[error("raw scan exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid period format: {0}")]
    PeriodParse(String),

    #[error("invalid date range: {0}")]
    DateRange(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
