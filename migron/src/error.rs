use std::time::Duration;

/// Error type for the migron crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller passed an invalid argument, such as a zero step count or a
    /// forced version below the baseline sentinel. Not retryable.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// The migration catalog could not be loaded or is malformed: a duplicate
    /// file pair, an unparseable file name, or a down script with no up script.
    #[error("invalid migration catalog: {0}")]
    Source(String),
    /// Two migrations in the catalog share a version.
    #[error("duplicate migration version found: {0}")]
    DuplicateVersion(i64),
    /// The database reports a version that has no corresponding catalog entry.
    /// Fatal to downgrades; requires operator intervention via `force`.
    #[error("no migration found for version {0}")]
    MissingMigration(i64),
    /// A previous run left the database dirty. Up/Down/Goto refuse to operate
    /// until an operator resolves the schema manually and forces the expected
    /// version (or drops with force). `version` is `-1` when the in-flight
    /// record carried the baseline sentinel.
    #[error("database is dirty at version {version}: fix the schema manually, then force the expected version")]
    DirtyState { version: i64 },
    /// A migration's apply or revert action failed. The dirty flag remains set
    /// at the failing version; the failure is never retried automatically.
    #[error("migration {version} ('{description}') failed: {source}")]
    MigrationFailed {
        version: i64,
        description: String,
        #[source]
        source: Box<Error>,
    },
    /// The migration lock could not be acquired within the configured timeout.
    #[error("timed out after {0:?} waiting for the migration lock")]
    LockTimeout(Duration),
    /// The migration lock could not be acquired or released.
    #[error("migration lock error: {0}")]
    Lock(String),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    /// A datastore error outside the other kinds.
    #[error("{0}")]
    Driver(String),
    /// The operation was canceled by the operator.
    #[error("operation canceled")]
    Canceled,
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
