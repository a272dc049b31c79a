//! Contracts between the migration runner and datastore drivers.

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::migration::MigrationScript;

/// The wire sentinel recorded in place of a missing version. Kept compatible
/// with golang-migrate: a consumer of one can read state written by the other.
pub const NIL_VERSION: i64 = -1;

/// The durable record of what is installed: the current version (or `None`
/// for a baseline database) and whether the last write was begun but never
/// completed cleanly.
///
/// When `dirty` is true, `version` identifies the migration that was in
/// flight, never the previous successfully-applied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionState {
    pub version: Option<i64>,
    pub dirty: bool,
}

impl VersionState {
    /// The state of a database with no migrations applied.
    pub fn baseline() -> Self {
        Self {
            version: None,
            dirty: false,
        }
    }
}

/// A component that interacts with the target datastore: coordination
/// locking, version bookkeeping, and schema teardown.
///
/// The runner is the only caller; it owns the driver for its lifetime, and
/// the driver exclusively owns its connection(s).
pub trait Driver: Send + Sync {
    /// Acquire an exclusive coordination lock scoped to the target's
    /// migration table, blocking up to a configured timeout. Re-entrant
    /// within one driver instance: locking twice without an intervening
    /// unlock is a no-op. Also ensures the version table exists.
    fn lock(&self, cancel: &CancelToken) -> Result<(), Error>;

    /// Release the coordination lock. Idempotent, and never cancellable: the
    /// runner must not leak locks.
    fn unlock(&self) -> Result<(), Error>;

    /// Read the current version state. May be called without holding the
    /// lock (best-effort reads).
    fn version_state(&self) -> Result<VersionState, Error>;

    /// Atomically replace the single row of the version table. With
    /// `version == None` and `dirty == false` the table is left empty;
    /// otherwise exactly one row is present, storing [`NIL_VERSION`] in
    /// place of a missing version.
    fn set_version(
        &self,
        version: Option<i64>,
        dirty: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error>;

    /// Delete all user objects in the target's working namespace. The
    /// version table is recreated on the next operation.
    fn drop_all(&self, cancel: &CancelToken) -> Result<(), Error>;

    /// Dispose of the driver: release any held lock, then close the
    /// connection.
    fn close(self: Box<Self>) -> Result<(), Error>;

    /// Expose the script-execution capability, when this driver has it.
    /// Script-backed migrations refuse drivers that return `None`.
    fn as_script(&self) -> Option<&dyn ScriptDriver> {
        None
    }
}

/// A [`Driver`] that can execute textual script bodies against the datastore.
pub trait ScriptDriver: Driver {
    /// Execute the script body verbatim, optionally inside a transaction per
    /// driver configuration. Empty or whitespace-only bodies succeed without
    /// touching the datastore.
    fn execute_script(&self, script: &MigrationScript, cancel: &CancelToken) -> Result<(), Error>;
}
