//! Atomic record storage: all-or-nothing JSON reads and writes.
//!
//! Writes land in a temporary sibling file and are renamed into place, so a
//! reader never observes a half-written record and a crash before the rename
//! leaves the original untouched. Read-modify-write goes through
//! [`update_atomic`], the only sanctioned way to mutate a shared record:
//! lock-acquire, read, mutate, write, lock-release as one unit. Direct
//! unlocked writes are never permitted; unlocked reads are allowed and must
//! tolerate staleness.

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::io::lock::{self, LockSettings};

/// Read a record, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> CoordResult<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(CoordError::Storage(
                anyhow::Error::new(err).context(format!("read record {}", path.display())),
            ));
        }
    };
    let record = serde_json::from_str(&raw)
        .with_context(|| format!("parse record {}", path.display()))?;
    Ok(Some(record))
}

/// Read a record that must exist.
pub fn require_json<T: DeserializeOwned>(
    kind: &'static str,
    id: &str,
    path: &Path,
) -> CoordResult<T> {
    read_json(path)?.ok_or_else(|| CoordError::NotFound {
        kind,
        id: id.to_string(),
    })
}

/// Atomically write a record (temp sibling + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> CoordResult<()> {
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;

    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize record {}", path.display()))?;
    buf.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}

/// Lock, read, mutate, write, release — the read-modify-write critical
/// section for one shared record. The mutation must not perform I/O or call
/// external collaborators; the lock is held only around this unit.
pub fn update_atomic<T, R>(
    kind: &'static str,
    id: &str,
    path: &Path,
    settings: &LockSettings,
    mutate: impl FnOnce(&mut T) -> CoordResult<R>,
) -> CoordResult<R>
where
    T: Serialize + DeserializeOwned,
{
    let mut handle = lock::acquire(path, settings)?;
    let result = (|| {
        let mut record: T = require_json(kind, id, path)?;
        let out = mutate(&mut record)?;
        write_json(path, &record)?;
        Ok(out)
    })();
    handle.release();
    debug!(kind, id, ok = result.is_ok(), "atomic update");
    result
}

/// Create a record that must not already exist, under the record lock.
pub fn create_atomic<T>(
    kind: &'static str,
    id: &str,
    path: &Path,
    settings: &LockSettings,
    value: &T,
) -> CoordResult<()>
where
    T: Serialize + DeserializeOwned,
{
    let mut handle = lock::acquire(path, settings)?;
    let result = (|| {
        if path.exists() {
            return Err(CoordError::Storage(anyhow::anyhow!(
                "{kind} '{id}' already exists at {}",
                path.display()
            )));
        }
        write_json(path, value)
    })();
    handle.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct Counter {
        id: String,
        count: u32,
    }

    #[test]
    fn read_missing_returns_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Option<Counter> =
            read_json(&temp.path().join("missing.json")).expect("read");
        assert!(loaded.is_none());
    }

    #[test]
    fn require_missing_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = require_json::<Counter>("counter", "c1", &temp.path().join("c1.json"))
            .expect_err("missing");
        assert!(matches!(err, CoordError::NotFound { kind: "counter", .. }));
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("c1.json");
        let record = Counter {
            id: "c1".to_string(),
            count: 7,
        };

        write_json(&path, &record).expect("write");
        let loaded: Counter = require_json("counter", "c1", &path).expect("read");
        assert_eq!(loaded, record);
    }

    /// A leftover temp file from a crashed writer must not disturb the
    /// original record.
    #[test]
    fn crash_before_rename_leaves_original_intact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("c1.json");
        let record = Counter {
            id: "c1".to_string(),
            count: 1,
        };
        write_json(&path, &record).expect("write");
        let before = fs::read_to_string(&path).expect("read");

        // Simulate a writer that died after the temp write.
        fs::write(path.with_extension("json.tmp"), "{\"half\": tru").expect("write temp");

        let after = fs::read_to_string(&path).expect("read");
        assert_eq!(before, after);
        let loaded: Counter = require_json("counter", "c1", &path).expect("read");
        assert_eq!(loaded.count, 1);
    }

    #[test]
    fn update_atomic_applies_mutation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("c1.json");
        write_json(
            &path,
            &Counter {
                id: "c1".to_string(),
                count: 0,
            },
        )
        .expect("write");

        let settings = LockSettings::default();
        let new_count = update_atomic("counter", "c1", &path, &settings, |c: &mut Counter| {
            c.count += 1;
            Ok(c.count)
        })
        .expect("update");
        assert_eq!(new_count, 1);

        let loaded: Counter = require_json("counter", "c1", &path).expect("read");
        assert_eq!(loaded.count, 1);
    }

    #[test]
    fn update_atomic_mutation_error_leaves_record_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("c1.json");
        write_json(
            &path,
            &Counter {
                id: "c1".to_string(),
                count: 3,
            },
        )
        .expect("write");

        let settings = LockSettings::default();
        let err = update_atomic("counter", "c1", &path, &settings, |c: &mut Counter| {
            c.count = 99;
            Err::<(), _>(CoordError::NotFound {
                kind: "counter",
                id: "other".to_string(),
            })
        })
        .expect_err("mutation error");
        assert!(matches!(err, CoordError::NotFound { .. }));

        let loaded: Counter = require_json("counter", "c1", &path).expect("read");
        assert_eq!(loaded.count, 3);
    }

    #[test]
    fn create_atomic_refuses_existing_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("c1.json");
        let record = Counter {
            id: "c1".to_string(),
            count: 0,
        };
        let settings = LockSettings::default();

        create_atomic("counter", "c1", &path, &settings, &record).expect("create");
        let err = create_atomic("counter", "c1", &path, &settings, &record)
            .expect_err("duplicate create");
        assert!(err.to_string().contains("already exists"));
    }
}
