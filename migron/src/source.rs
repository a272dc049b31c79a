//! Migration catalogs and where they come from.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;
use crate::migration::{Direction, Migration, MigrationScript, ScriptAction};

/// Loads the complete migration catalog.
///
/// A source must be deterministic within a run and enumerate the full
/// catalog before returning: the registry built from it is a closed set.
/// Sources do not interpret script content.
pub trait Source: Send + Sync {
    fn load(&self) -> Result<Vec<Migration>, Error>;
}

/// A parsed migration file name.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ParsedName {
    pub version: i64,
    pub description: String,
    pub direction: Direction,
}

fn name_regex() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| {
        Regex::new(r"^([0-9]+)_(.*)\.((?i:up|down))\.(.+)$").expect("migration name pattern")
    })
}

/// Parse `<version>_<description>.<direction>.<ext>`. Returns `Ok(None)` for
/// files that are not migration candidates at all; fails for candidates
/// (names containing an `.up.` or `.down.` segment) that do not parse.
/// Underscores in the description are shown to operators as spaces.
pub(crate) fn parse_file_name(name: &str) -> Result<Option<ParsedName>, Error> {
    let lowered = name.to_ascii_lowercase();
    if !lowered.contains(".up.") && !lowered.contains(".down.") {
        return Ok(None);
    }
    let captures = name_regex()
        .captures(name)
        .ok_or_else(|| Error::Source(format!("unrecognized migration file name: {name}")))?;
    let version: i64 = captures[1]
        .parse()
        .map_err(|_| Error::Source(format!("migration version out of range in: {name}")))?;
    let direction = if captures[3].eq_ignore_ascii_case("up") {
        Direction::Up
    } else {
        Direction::Down
    };
    Ok(Some(ParsedName {
        version,
        description: captures[2].replace('_', " "),
        direction,
    }))
}

#[derive(Default)]
struct ScriptPair {
    up: Option<MigrationScript>,
    down: Option<MigrationScript>,
}

/// A [`Source`] reading `<version>_<description>.{up|down}.<ext>` script
/// pairs from a directory. Bodies are read lazily, when a script is about to
/// execute (or is prefetched).
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Parse a `file://<path>` URL into a source.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| Error::Source(format!("unsupported source url: {url}")))?;
        if path.is_empty() {
            return Err(Error::Source(format!("source url has an empty path: {url}")));
        }
        Ok(Self::new(path))
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl Source for FileSource {
    fn load(&self) -> Result<Vec<Migration>, Error> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::Source(format!(
                "failed to read migration directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut pairs: BTreeMap<i64, ScriptPair> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::Source(format!(
                    "failed to read migration directory {}: {e}",
                    self.dir.display()
                ))
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(parsed) = parse_file_name(name)? else {
                continue;
            };

            let script = MigrationScript::from_file(
                parsed.version,
                parsed.description,
                parsed.direction,
                entry.path(),
            );
            let pair = pairs.entry(parsed.version).or_default();
            let slot = match parsed.direction {
                Direction::Up => &mut pair.up,
                Direction::Down => &mut pair.down,
            };
            if slot.is_some() {
                return Err(Error::Source(format!(
                    "duplicate {} migration for version {}: {name}",
                    parsed.direction, parsed.version
                )));
            }
            *slot = Some(script);
        }

        pairs
            .into_iter()
            .map(|(version, pair)| {
                let up = pair.up.ok_or_else(|| {
                    Error::Source(format!(
                        "migration {version} has a down script but no up script"
                    ))
                })?;
                let description = up.description().to_string();
                Migration::new(
                    version,
                    description,
                    Box::new(ScriptAction::new(up, pair.down)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(dir: &std::path::Path, name: &str, body: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn parses_well_formed_names() {
        let parsed = parse_file_name("42_create_users_table.up.sql")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.version, 42);
        assert_eq!(parsed.description, "create users table");
        assert_eq!(parsed.direction, Direction::Up);

        let parsed = parse_file_name("7_drop_index.DOWN.sql").unwrap().unwrap();
        assert_eq!(parsed.direction, Direction::Down);

        // Empty descriptions are allowed by the naming convention.
        let parsed = parse_file_name("3_.up.sql").unwrap().unwrap();
        assert_eq!(parsed.description, "");
    }

    #[test]
    fn skips_files_that_are_not_migrations() {
        assert!(parse_file_name("README.md").unwrap().is_none());
        assert!(parse_file_name("notes.txt").unwrap().is_none());
        assert!(parse_file_name("1_create.sql").unwrap().is_none());
    }

    #[test]
    fn rejects_unparseable_candidates() {
        assert!(parse_file_name("abc_foo.up.sql").is_err());
        assert!(parse_file_name("nounderscore.up.sql").is_err());
        // Larger than i64.
        assert!(parse_file_name("99999999999999999999_x.up.sql").is_err());
    }

    #[test]
    fn loads_pairs_and_up_only_migrations() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_create_users.up.sql", "CREATE TABLE users ()");
        touch(dir.path(), "1_create_users.down.sql", "DROP TABLE users");
        touch(dir.path(), "2_add_email.up.sql", "ALTER TABLE users ADD email text");
        touch(dir.path(), "README.md", "not a migration");

        let catalog = FileSource::new(dir.path()).load().unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].version(), 1);
        assert_eq!(catalog[0].description(), "create users");
        assert_eq!(catalog[1].version(), 2);
        assert_eq!(catalog[1].description(), "add email");
    }

    #[test]
    fn rejects_duplicate_pairs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_first.up.sql", "SELECT 1");
        touch(dir.path(), "1_second.up.sql", "SELECT 2");

        let result = FileSource::new(dir.path()).load();
        match result {
            Err(Error::Source(message)) => assert!(message.contains("duplicate")),
            other => panic!("expected a source error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_down_only_versions() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_init.up.sql", "SELECT 1");
        touch(dir.path(), "2_orphan.down.sql", "SELECT 2");

        let result = FileSource::new(dir.path()).load();
        match result {
            Err(Error::Source(message)) => assert!(message.contains("no up script")),
            other => panic!("expected a source error, got {other:?}"),
        }
    }

    #[test]
    fn body_reads_are_deferred_until_requested() {
        use crate::cancel::CancelToken;
        use crate::testing::MemoryDriver;

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_lazy.up.sql", "original body");

        let catalog = FileSource::new(dir.path()).load().unwrap();
        // Rewriting the file after load proves the body was not read eagerly.
        touch(dir.path(), "1_lazy.up.sql", "rewritten body");

        let driver = MemoryDriver::new();
        catalog[0].apply(&driver, &CancelToken::new()).unwrap();
        assert_eq!(driver.executed()[0].body, "rewritten body");
    }

    #[test]
    fn from_url_requires_the_file_scheme() {
        assert!(FileSource::from_url("file:///tmp/migrations").is_ok());
        assert!(FileSource::from_url("s3://bucket/migrations").is_err());
        assert!(FileSource::from_url("file://").is_err());
    }
}
