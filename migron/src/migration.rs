//! Migration entities and their executable actions.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::cancel::CancelToken;
use crate::driver::Driver;
use crate::error::Error;

/// The direction of a migration script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Up => "up",
            Direction::Down => "down",
        })
    }
}

/// The executable half of a [`Migration`]: how to apply it and how to revert
/// it. Implementations receive the runner's driver and the operation's
/// cancellation token.
pub trait MigrationAction: Send + Sync {
    fn apply(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error>;

    fn revert(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error>;

    /// Warm any lazily-loaded resources (script bodies) ahead of execution.
    /// Failures here are not fatal; they surface again when the step runs.
    fn prefetch(&self, _direction: Direction) -> Result<(), Error> {
        Ok(())
    }
}

/// A single versioned migration: a positive version, a human-readable
/// description, and the actions that apply and revert it. Immutable once
/// constructed; two migrations with the same version are forbidden within a
/// catalog.
pub struct Migration {
    version: i64,
    description: String,
    action: Box<dyn MigrationAction>,
}

impl Migration {
    /// Create a migration, validating that the version is positive.
    pub fn new(
        version: i64,
        description: impl Into<String>,
        action: Box<dyn MigrationAction>,
    ) -> Result<Self, Error> {
        if version <= 0 {
            return Err(Error::Source(format!(
                "migration version must be greater than 0, found {version}"
            )));
        }
        Ok(Self {
            version,
            description: description.into(),
            action,
        })
    }

    /// Create a code-first migration from a pair of closures.
    pub fn from_fns<A, R>(
        version: i64,
        description: impl Into<String>,
        apply: A,
        revert: R,
    ) -> Result<Self, Error>
    where
        A: Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync + 'static,
        R: Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync + 'static,
    {
        Self::new(version, description, Box::new(FnAction { apply, revert }))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn apply(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        self.action.apply(driver, cancel)
    }

    pub fn revert(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        self.action.revert(driver, cancel)
    }

    pub fn prefetch(&self, direction: Direction) -> Result<(), Error> {
        self.action.prefetch(direction)
    }
}

impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

struct FnAction<A, R> {
    apply: A,
    revert: R,
}

impl<A, R> MigrationAction for FnAction<A, R>
where
    A: Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync,
    R: Fn(&dyn Driver, &CancelToken) -> Result<(), Error> + Send + Sync,
{
    fn apply(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        (self.apply)(driver, cancel)
    }

    fn revert(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        (self.revert)(driver, cancel)
    }
}

/// Supplies a script body on demand. Providers may defer expensive reads
/// until the body is first requested.
pub trait ScriptContent: Send + Sync {
    fn fetch(&self) -> Result<String, Error>;
}

impl<F> ScriptContent for F
where
    F: Fn() -> Result<String, Error> + Send + Sync,
{
    fn fetch(&self) -> Result<String, Error> {
        self()
    }
}

/// A versioned script in one direction. The body is fetched lazily through
/// the content provider and cached, so it is read at most once.
pub struct MigrationScript {
    version: i64,
    description: String,
    direction: Direction,
    path: String,
    content: Box<dyn ScriptContent>,
    body: OnceLock<String>,
}

impl MigrationScript {
    pub fn new(
        version: i64,
        description: impl Into<String>,
        direction: Direction,
        path: impl Into<String>,
        content: Box<dyn ScriptContent>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            direction,
            path: path.into(),
            content,
            body: OnceLock::new(),
        }
    }

    /// A script whose body is read from a file when first requested.
    pub fn from_file(
        version: i64,
        description: impl Into<String>,
        direction: Direction,
        path: PathBuf,
    ) -> Self {
        let display = path.display().to_string();
        let provider = move || {
            fs::read_to_string(&path).map_err(|e| {
                Error::Source(format!(
                    "failed to read migration script {}: {e}",
                    path.display()
                ))
            })
        };
        Self::new(version, description, direction, display, Box::new(provider))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// An opaque identifier for diagnostics, typically the file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The script body, fetched from the provider on first access.
    pub fn body(&self) -> Result<&str, Error> {
        if let Some(body) = self.body.get() {
            return Ok(body);
        }
        let fetched = self.content.fetch()?;
        Ok(self.body.get_or_init(|| fetched))
    }
}

impl fmt::Debug for MigrationScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationScript")
            .field("version", &self.version)
            .field("direction", &self.direction)
            .field("path", &self.path)
            .field("fetched", &self.body.get().is_some())
            .finish()
    }
}

/// The action for script-backed migrations: an up script and, when the
/// migration is reversible, a down script. Requires a driver with the
/// [`ScriptDriver`](crate::ScriptDriver) capability.
pub struct ScriptAction {
    up: MigrationScript,
    down: Option<MigrationScript>,
}

impl ScriptAction {
    pub fn new(up: MigrationScript, down: Option<MigrationScript>) -> Self {
        Self { up, down }
    }

    fn script_driver<'d>(&self, driver: &'d dyn Driver) -> Result<&'d dyn crate::ScriptDriver, Error> {
        driver.as_script().ok_or_else(|| {
            Error::Driver(format!(
                "driver does not support script execution, required by migration {}",
                self.up.version()
            ))
        })
    }
}

impl MigrationAction for ScriptAction {
    fn apply(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        self.script_driver(driver)?.execute_script(&self.up, cancel)
    }

    fn revert(&self, driver: &dyn Driver, cancel: &CancelToken) -> Result<(), Error> {
        let down = self.down.as_ref().ok_or_else(|| {
            Error::Source(format!(
                "migration {} ('{}') has no down script",
                self.up.version(),
                self.up.description()
            ))
        })?;
        self.script_driver(driver)?.execute_script(down, cancel)
    }

    fn prefetch(&self, direction: Direction) -> Result<(), Error> {
        match direction {
            Direction::Up => self.up.body().map(|_| ()),
            Direction::Down => match &self.down {
                Some(down) => down.body().map(|_| ()),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn rejects_non_positive_versions() {
        let result = Migration::from_fns(0, "zero", |_, _| Ok(()), |_, _| Ok(()));
        assert!(matches!(result, Err(Error::Source(_))));
        let result = Migration::from_fns(-3, "negative", |_, _| Ok(()), |_, _| Ok(()));
        assert!(matches!(result, Err(Error::Source(_))));
    }

    #[test]
    fn script_body_is_fetched_at_most_once() {
        let fetches = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fetches);
        let script = MigrationScript::new(
            1,
            "create users",
            Direction::Up,
            "1_create_users.up.sql",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("CREATE TABLE users (id bigint)".to_string())
            }),
        );
        assert_eq!(script.body().unwrap(), "CREATE TABLE users (id bigint)");
        assert_eq!(script.body().unwrap(), "CREATE TABLE users (id bigint)");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_fetch_is_retried_on_next_access() {
        let fetches = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fetches);
        let script = MigrationScript::new(
            2,
            "flaky",
            Direction::Up,
            "2_flaky.up.sql",
            Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Source("transient read failure".to_string()))
                } else {
                    Ok("SELECT 1".to_string())
                }
            }),
        );
        assert!(script.body().is_err());
        assert_eq!(script.body().unwrap(), "SELECT 1");
    }
}
