//! The migration runner: orchestration of up, down, goto, force, and drop.
//!
//! All mutating operations follow the same discipline: acquire the driver's
//! coordination lock, run the operation body, and release the lock in an
//! uncancellable scope on every exit path. Around each individual migration
//! the runner maintains the dirty-state contract: the in-flight version is
//! durably marked dirty before the action runs, and cleared only after the
//! action completes cleanly.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::driver::{Driver, VersionState, NIL_VERSION};
use crate::error::Error;
use crate::migration::{Direction, Migration};
use crate::registry::MigrationRegistry;
use crate::source::Source;

/// A report of the steps performed by a runner operation, in execution order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<i64>,
    pub reverted: Vec<i64>,
}

type StartHook = Box<dyn Fn(i64, &str) + Send + Sync>;
type CompleteHook = Box<dyn Fn(i64, &str, std::time::Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(i64, &str, &Error) + Send + Sync>;

/// The entrypoint for advancing or rewinding a datastore's schema.
///
/// A runner exclusively owns its [`Source`] and [`Driver`] for its lifetime
/// and is the only writer of version state through the driver. The catalog is
/// loaded once, on first need, inside the lock scope.
pub struct MigrationRunner {
    source: Box<dyn Source>,
    driver: Box<dyn Driver>,
    registry: Mutex<Option<Arc<MigrationRegistry>>>,
    prefetch: usize,
    on_migration_start: Option<StartHook>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_error: Option<ErrorHook>,
}

impl MigrationRunner {
    pub fn new(source: Box<dyn Source>, driver: Box<dyn Driver>) -> Self {
        Self {
            source,
            driver,
            registry: Mutex::new(None),
            prefetch: 0,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        }
    }

    /// Load up to `count` script bodies ahead of execution for each
    /// operation. Defaults to 0 (no prefetch).
    pub fn with_prefetch(mut self, count: usize) -> Self {
        self.prefetch = count;
        self
    }

    /// Set a callback to be invoked when a migration step starts.
    /// The callback receives the migration version and description.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64, &str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration step completes.
    /// The callback receives the migration version, description, and duration.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64, &str, std::time::Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration step fails.
    /// The callback receives the migration version, description, and error.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64, &str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Read the current version state. Does not take the migration lock.
    pub fn version(&self) -> Result<VersionState, Error> {
        self.driver.version_state()
    }

    /// Apply pending migrations: all of them, or at most `limit`.
    /// A fully-applied database is a no-op, not an error.
    pub fn up(&self, limit: Option<usize>, cancel: &CancelToken) -> Result<RunReport, Error> {
        if limit == Some(0) {
            return Err(Error::Argument("step count must be greater than 0".into()));
        }
        self.with_lock(cancel, |runner| runner.run_up(limit, cancel))
    }

    /// Revert migrations in descending version order: exactly one (the one
    /// matching the current version) when `limit` is `None`, else at most
    /// `limit`.
    pub fn down(&self, limit: Option<usize>, cancel: &CancelToken) -> Result<RunReport, Error> {
        if limit == Some(0) {
            return Err(Error::Argument("step count must be greater than 0".into()));
        }
        self.with_lock(cancel, |runner| runner.run_down(limit.unwrap_or(1), cancel))
    }

    /// Revert every applied migration.
    pub fn down_all(&self, cancel: &CancelToken) -> Result<RunReport, Error> {
        self.with_lock(cancel, |runner| runner.run_down(usize::MAX, cancel))
    }

    /// Apply `n` migrations forward when positive, revert `|n|` when
    /// negative; zero is a no-op.
    pub fn steps(&self, n: i64, cancel: &CancelToken) -> Result<RunReport, Error> {
        if n == 0 {
            return Ok(RunReport::default());
        }
        if n > 0 {
            self.up(Some(n as usize), cancel)
        } else {
            self.down(Some(n.unsigned_abs() as usize), cancel)
        }
    }

    /// Migrate up or down to `target`. The step count reflects registry
    /// membership only: missing intermediate versions are not counted, and a
    /// target equal to the current version is a no-op.
    pub fn goto(&self, target: i64, cancel: &CancelToken) -> Result<RunReport, Error> {
        if target < 0 {
            return Err(Error::Argument(format!(
                "target version must be non-negative, got {target}"
            )));
        }
        self.with_lock(cancel, |runner| {
            let state = runner.driver.version_state()?;
            if state.dirty {
                return Err(Self::dirty_error(&state));
            }
            let registry = runner.registry()?;
            if let Some(current) = state.version {
                if target == current {
                    return Ok(RunReport::default());
                }
                if target < current {
                    let count = registry.count_between(Some(target), current);
                    if count == 0 {
                        return Ok(RunReport::default());
                    }
                    return runner.run_down(count, cancel);
                }
            }
            let count = registry.count_between(state.version, target);
            if count == 0 {
                return Ok(RunReport::default());
            }
            runner.run_up(Some(count), cancel)
        })
    }

    /// Directly overwrite the version state without running any migration:
    /// `version <= 0` records the baseline, anything else records
    /// `(version, clean)`. This is the operator escape hatch: it does not
    /// require a clean state.
    pub fn force(&self, version: i64, cancel: &CancelToken) -> Result<(), Error> {
        if version < NIL_VERSION {
            return Err(Error::Argument(format!(
                "forced version must be {NIL_VERSION} or greater, got {version}"
            )));
        }
        self.with_lock(cancel, |runner| {
            let version = if version <= 0 { None } else { Some(version) };
            runner
                .driver
                .set_version(version, false, &CancelToken::never())
        })
    }

    /// Delete every object in the datastore's working namespace. Refuses a
    /// dirty database unless `force` is set; afterwards the version state is
    /// the baseline.
    pub fn drop_all(&self, force: bool, cancel: &CancelToken) -> Result<(), Error> {
        self.with_lock(cancel, |runner| {
            let state = runner.driver.version_state()?;
            if state.dirty {
                if !force {
                    return Err(Self::dirty_error(&state));
                }
                runner
                    .driver
                    .set_version(state.version, false, &CancelToken::never())?;
            }
            runner.driver.drop_all(cancel)?;
            runner
                .driver
                .set_version(None, false, &CancelToken::never())
        })
    }

    /// Dispose of the runner, releasing the driver's lock and connection.
    pub fn close(self) -> Result<(), Error> {
        self.driver.close()
    }

    fn with_lock<T>(
        &self,
        cancel: &CancelToken,
        body: impl FnOnce(&Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        cancel.check()?;
        self.driver.lock(cancel)?;
        let result = body(self);
        // The unlock runs on every exit path, under no cancellation scope.
        let unlocked = self.driver.unlock();
        match (result, unlocked) {
            (Err(error), _) => Err(error),
            (Ok(_), Err(error)) => Err(error),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// The memoized registry, loaded from the source on first need.
    fn registry(&self) -> Result<Arc<MigrationRegistry>, Error> {
        let mut slot = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(registry) = slot.as_ref() {
            return Ok(Arc::clone(registry));
        }
        let catalog = self.source.load()?;
        let registry = Arc::new(MigrationRegistry::new(catalog)?);
        *slot = Some(Arc::clone(&registry));
        Ok(registry)
    }

    fn run_up(&self, limit: Option<usize>, cancel: &CancelToken) -> Result<RunReport, Error> {
        let state = self.driver.version_state()?;
        if state.dirty {
            return Err(Self::dirty_error(&state));
        }
        let registry = self.registry()?;
        let pending = registry.next_after(state.version, limit);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            current_version = ?state.version,
            pending = pending.len(),
            "selected pending migrations"
        );

        self.prefetch_bodies(&pending, Direction::Up);
        let mut report = RunReport::default();
        for migration in pending {
            cancel.check()?;
            self.step(migration, Direction::Up, &registry, cancel)?;
            report.applied.push(migration.version());
        }
        Ok(report)
    }

    fn run_down(&self, limit: usize, cancel: &CancelToken) -> Result<RunReport, Error> {
        let state = self.driver.version_state()?;
        if state.dirty {
            return Err(Self::dirty_error(&state));
        }
        let Some(current) = state.version else {
            return Ok(RunReport::default());
        };
        let registry = self.registry()?;
        if !registry.contains(current) {
            return Err(Error::MissingMigration(current));
        }
        let selected = registry.at_or_below(current, Some(limit));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            current_version = current,
            selected = selected.len(),
            "selected migrations to revert"
        );

        self.prefetch_bodies(&selected, Direction::Down);
        let mut report = RunReport::default();
        for migration in selected {
            cancel.check()?;
            self.step(migration, Direction::Down, &registry, cancel)?;
            report.reverted.push(migration.version());
        }
        Ok(report)
    }

    /// Run one migration under the dirty-state contract.
    fn step(
        &self,
        migration: &Migration,
        direction: Direction,
        registry: &MigrationRegistry,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let version = migration.version();

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "migration_step",
            version,
            direction = %direction,
            description = %migration.description()
        )
        .entered();

        if let Some(ref callback) = self.on_migration_start {
            callback(version, migration.description());
        }
        let started = Instant::now();

        // The in-flight mark must be durably visible before the action runs.
        self.driver
            .set_version(Some(version), true, &CancelToken::never())?;

        let result = match direction {
            Direction::Up => migration.apply(self.driver.as_ref(), cancel),
            Direction::Down => migration.revert(self.driver.as_ref(), cancel),
        };

        match result {
            Ok(()) => {
                let next = match direction {
                    Direction::Up => Some(version),
                    // After a revert the recorded version is the registry
                    // predecessor, which is None when reverting the first
                    // migration.
                    Direction::Down => registry.previous_of(version),
                };
                self.driver.set_version(next, false, &CancelToken::never())?;

                let elapsed = started.elapsed();
                #[cfg(feature = "tracing")]
                tracing::info!(duration_ms = elapsed.as_millis() as u64, "migration step completed");
                if let Some(ref callback) = self.on_migration_complete {
                    callback(version, migration.description(), elapsed);
                }
                Ok(())
            }
            Err(cause) => {
                self.reassert_dirty(version);
                let error = if cancel.is_canceled() {
                    Error::Canceled
                } else {
                    Error::MigrationFailed {
                        version,
                        description: migration.description().to_string(),
                        source: Box::new(cause),
                    }
                };
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "migration step failed");
                if let Some(ref callback) = self.on_migration_error {
                    callback(version, migration.description(), &error);
                }
                Err(error)
            }
        }
    }

    /// Leave a durable dirty record of the in-flight migration. Best effort:
    /// the step's own error still propagates if this write fails.
    fn reassert_dirty(&self, version: i64) {
        if let Err(_reassert) = self
            .driver
            .set_version(Some(version), true, &CancelToken::never())
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(version, error = %_reassert, "failed to re-assert the dirty flag");
        }
    }

    fn prefetch_bodies(&self, selected: &[&Migration], direction: Direction) {
        for migration in selected.iter().take(self.prefetch) {
            // Fetch failures surface when the step actually runs.
            let _ = migration.prefetch(direction);
        }
    }

    fn dirty_error(state: &VersionState) -> Error {
        Error::DirtyState {
            version: state.version.unwrap_or(NIL_VERSION),
        }
    }
}

impl fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("prefetch", &self.prefetch)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}
