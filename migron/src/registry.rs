//! The ordered, indexed catalog of migrations.

use crate::error::Error;
use crate::migration::Migration;

/// An immutable, version-ordered index over a migration catalog.
///
/// Built once per runner from a [`Source`](crate::Source)'s full catalog.
/// Versions are strictly increasing, positive, and unique; construction
/// fails with [`Error::DuplicateVersion`] on collision. Selection operations
/// are binary-search based.
#[derive(Debug)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self, Error> {
        migrations.sort_by_key(Migration::version);
        for pair in migrations.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(Error::DuplicateVersion(pair[0].version()));
            }
        }
        Ok(Self { migrations })
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn contains(&self, version: i64) -> bool {
        self.get(version).is_some()
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, Migration::version)
            .ok()
            .map(|index| &self.migrations[index])
    }

    /// Migrations with version strictly greater than `after` (all of them
    /// when `after` is `None`), ascending, up to `limit`.
    pub fn next_after(&self, after: Option<i64>, limit: Option<usize>) -> Vec<&Migration> {
        let start = match after {
            None => 0,
            Some(version) => self.migrations.partition_point(|m| m.version() <= version),
        };
        self.migrations[start..]
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Migrations with version at or below `version`, descending, up to
    /// `limit`.
    pub fn at_or_below(&self, version: i64, limit: Option<usize>) -> Vec<&Migration> {
        let end = self.migrations.partition_point(|m| m.version() <= version);
        self.migrations[..end]
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// The version immediately preceding `version` in the registry, or
    /// `None` when `version` is the first entry.
    pub fn previous_of(&self, version: i64) -> Option<i64> {
        let index = self.migrations.partition_point(|m| m.version() < version);
        index.checked_sub(1).map(|i| self.migrations[i].version())
    }

    /// Count of registry entries with version in `(lower, upper]`.
    pub fn count_between(&self, lower_exclusive: Option<i64>, upper_inclusive: i64) -> usize {
        let low = match lower_exclusive {
            None => 0,
            Some(version) => self.migrations.partition_point(|m| m.version() <= version),
        };
        let high = self
            .migrations
            .partition_point(|m| m.version() <= upper_inclusive);
        high.saturating_sub(low)
    }
}
