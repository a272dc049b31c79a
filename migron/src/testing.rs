//! In-memory test doubles for exercising migration logic without a database.
//!
//! [`MemorySource`] builds code-first catalogs from closures and
//! [`MemoryDriver`] records every version write and executed script, so tests
//! can assert on the exact sequence of driver interactions an operation
//! performs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cancel::CancelToken;
use crate::driver::{Driver, ScriptDriver, VersionState};
use crate::error::Error;
use crate::migration::{Direction, Migration, MigrationScript};
use crate::source::Source;

/// A record of one script executed through [`MemoryDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedScript {
    pub version: i64,
    pub direction: Direction,
    pub body: String,
}

#[derive(Default)]
struct MemoryState {
    version: Option<i64>,
    dirty: bool,
    locked: bool,
    closed: bool,
    lock_count: u32,
    writes: Vec<(Option<i64>, bool)>,
    executed: Vec<ExecutedScript>,
    drops: u32,
}

/// An in-memory [`Driver`] (with the script capability) backed by shared
/// state: clones observe the same journal, so tests keep a clone as an
/// inspection handle while the runner owns the original.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the stored state directly, bypassing the driver protocol.
    pub fn seed(&self, version: Option<i64>, dirty: bool) {
        let mut state = self.state();
        state.version = version;
        state.dirty = dirty;
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// How many times the lock has been acquired (re-entrant no-ops
    /// excluded).
    pub fn lock_count(&self) -> u32 {
        self.state().lock_count
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Every `set_version` write in order, as `(version, dirty)` pairs.
    pub fn writes(&self) -> Vec<(Option<i64>, bool)> {
        self.state().writes.clone()
    }

    /// Every script executed in order.
    pub fn executed(&self) -> Vec<ExecutedScript> {
        self.state().executed.clone()
    }

    pub fn drop_count(&self) -> u32 {
        self.state().drops
    }
}

impl Driver for MemoryDriver {
    fn lock(&self, cancel: &CancelToken) -> Result<(), Error> {
        cancel.check()?;
        let mut state = self.state();
        if !state.locked {
            state.locked = true;
            state.lock_count += 1;
        }
        Ok(())
    }

    fn unlock(&self) -> Result<(), Error> {
        self.state().locked = false;
        Ok(())
    }

    fn version_state(&self) -> Result<VersionState, Error> {
        let state = self.state();
        Ok(VersionState {
            version: state.version,
            dirty: state.dirty,
        })
    }

    fn set_version(
        &self,
        version: Option<i64>,
        dirty: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        cancel.check()?;
        let mut state = self.state();
        state.writes.push((version, dirty));
        state.version = version;
        state.dirty = dirty;
        Ok(())
    }

    fn drop_all(&self, cancel: &CancelToken) -> Result<(), Error> {
        cancel.check()?;
        let mut state = self.state();
        state.drops += 1;
        // Dropping the namespace takes the version table with it; reads then
        // see a baseline until the next write recreates the row.
        state.version = None;
        state.dirty = false;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let mut state = self.state();
        state.locked = false;
        state.closed = true;
        Ok(())
    }

    fn as_script(&self) -> Option<&dyn ScriptDriver> {
        Some(self)
    }
}

impl ScriptDriver for MemoryDriver {
    fn execute_script(&self, script: &MigrationScript, cancel: &CancelToken) -> Result<(), Error> {
        cancel.check()?;
        let body = script.body()?.to_string();
        self.state().executed.push(ExecutedScript {
            version: script.version(),
            direction: script.direction(),
            body,
        });
        Ok(())
    }
}

type ActionFn = Arc<dyn Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync>;

struct MemoryEntry {
    version: i64,
    description: String,
    apply: ActionFn,
    revert: ActionFn,
}

/// A [`Source`] built from closures, for code-first catalogs in tests.
#[derive(Default)]
pub struct MemorySource {
    entries: Vec<MemoryEntry>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_migration(
        mut self,
        version: i64,
        description: &str,
        apply: impl Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync + 'static,
        revert: impl Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.entries.push(MemoryEntry {
            version,
            description: description.to_string(),
            apply: Arc::new(apply),
            revert: Arc::new(revert),
        });
        self
    }

    /// A migration whose apply and revert both succeed without side effects.
    pub fn with_noop_migration(self, version: i64, description: &str) -> Self {
        self.with_migration(version, description, |_, _| Ok(()), |_, _| Ok(()))
    }
}

impl Source for MemorySource {
    fn load(&self) -> Result<Vec<Migration>, Error> {
        self.entries
            .iter()
            .map(|entry| {
                let apply = Arc::clone(&entry.apply);
                let revert = Arc::clone(&entry.revert);
                Migration::from_fns(
                    entry.version,
                    entry.description.clone(),
                    move |driver, cancel| apply(driver, cancel),
                    move |driver, cancel| revert(driver, cancel),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_driver_honors_the_version_protocol() {
        let driver = MemoryDriver::new();
        let cancel = CancelToken::new();

        assert_eq!(driver.version_state().unwrap(), VersionState::baseline());

        driver.set_version(Some(4), true, &cancel).unwrap();
        assert_eq!(
            driver.version_state().unwrap(),
            VersionState {
                version: Some(4),
                dirty: true
            }
        );

        driver.set_version(None, false, &cancel).unwrap();
        assert_eq!(driver.version_state().unwrap(), VersionState::baseline());
        assert_eq!(driver.writes(), vec![(Some(4), true), (None, false)]);
    }

    #[test]
    fn lock_is_reentrant_and_unlock_idempotent() {
        let driver = MemoryDriver::new();
        let cancel = CancelToken::new();

        driver.lock(&cancel).unwrap();
        driver.lock(&cancel).unwrap();
        assert_eq!(driver.lock_count(), 1);
        driver.unlock().unwrap();
        driver.unlock().unwrap();
        assert!(!driver.is_locked());
    }

    #[test]
    fn executed_scripts_are_journaled() {
        let driver = MemoryDriver::new();
        let script = MigrationScript::new(
            3,
            "add index",
            Direction::Down,
            "3_add_index.down.sql",
            Box::new(|| Ok("DROP INDEX idx".to_string())),
        );
        driver.execute_script(&script, &CancelToken::new()).unwrap();
        assert_eq!(
            driver.executed(),
            vec![ExecutedScript {
                version: 3,
                direction: Direction::Down,
                body: "DROP INDEX idx".to_string(),
            }]
        );
    }

    #[test]
    fn close_releases_the_lock() {
        let driver = MemoryDriver::new();
        let handle = driver.clone();
        driver.lock(&CancelToken::new()).unwrap();
        Driver::close(Box::new(driver)).unwrap();
        assert!(!handle.is_locked());
        assert!(handle.is_closed());
    }

    #[test]
    fn memory_source_loads_deterministically() {
        let source = MemorySource::new()
            .with_noop_migration(1, "a")
            .with_noop_migration(2, "b");
        let first = source.load().unwrap();
        let second = source.load().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(Migration::version).collect::<Vec<_>>(),
            second.iter().map(Migration::version).collect::<Vec<_>>()
        );
    }
}
