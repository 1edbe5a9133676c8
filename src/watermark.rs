//! Durable watermark cursor.
//!
//! The watermark is the last processed position in the source's ordered
//! column. It is read once at the start of a run and committed once at the
//! end with compare-and-swap, so an overlapping run fails loudly instead of
//! silently rewinding the cursor.

use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::dataset::{format_datetime, parse_datetime, Value};

/// Starting point when no watermark has been committed yet.
pub const MIN_WATERMARK: &str = "1970-01-01 00:00:00";

/// Last processed watermark-column value, rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watermark(String);

impl Watermark {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.len() == value.len() {
            Self(value)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn minimum() -> Self {
        Self(MIN_WATERMARK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Watermark for an extracted `_wm_col` value. Nulls carry no position.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Timestamp(ts) => Some(Self(format_datetime(ts))),
            Value::TimestampTz(ts) => Some(Self(format_datetime(&ts.naive_utc()))),
            Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|ts| Self(format_datetime(&ts))),
            other => Some(Self::new(other.to_string())),
        }
    }

    pub fn is_minimum(&self) -> bool {
        self.0 == MIN_WATERMARK
    }

    /// Position ordering: chronological when both sides are datetimes,
    /// numeric when both are numbers, lexicographic otherwise.
    ///
    /// Against a non-datetime value the initial watermark sorts first, since
    /// the extractor binds it as the column type's minimum.
    pub fn cmp_position(&self, other: &Watermark) -> Ordering {
        if self.0 == other.0 {
            return Ordering::Equal;
        }
        if let (Some(a), Some(b)) = (parse_datetime(&self.0), parse_datetime(&other.0)) {
            return a.cmp(&b);
        }
        if self.is_minimum() {
            return Ordering::Less;
        }
        if other.is_minimum() {
            return Ordering::Greater;
        }
        if let (Ok(a), Ok(b)) = (self.0.parse::<i128>(), other.0.parse::<i128>()) {
            return a.cmp(&b);
        }
        if let (Ok(a), Ok(b)) = (Decimal::from_str(&self.0), Decimal::from_str(&other.0)) {
            return a.cmp(&b);
        }
        if let (Ok(a), Ok(b)) = (self.0.parse::<f64>(), other.0.parse::<f64>()) {
            return a.total_cmp(&b);
        }
        self.0.cmp(&other.0)
    }

    /// Largest watermark among `values`, ignoring nulls.
    pub fn max_of<'a, I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        values
            .into_iter()
            .filter_map(Watermark::from_value)
            .max_by(|a, b| a.cmp_position(b))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::minimum()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors produced by [`WatermarkStore`] operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File-system failure on the state file.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("watermark store lock poisoned")]
    LockPoisoned,

    /// Another process holds the commit lock file.
    #[error("watermark store is locked by '{path}'; remove it if no run is active")]
    Locked { path: PathBuf },

    /// Another writer committed between this run's read and its commit.
    #[error("watermark changed concurrently: expected '{expected}', found '{found}'")]
    Conflict { expected: Watermark, found: Watermark },

    /// The proposed watermark would move the cursor backwards.
    #[error("refusing to move watermark backwards from '{current}' to '{proposed}'")]
    Regression {
        current: Watermark,
        proposed: Watermark,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Storage contract for the single watermark value.
///
/// Implementations must be `Send + Sync` for use behind `Box<dyn WatermarkStore>`.
pub trait WatermarkStore: Send + Sync {
    /// Last committed watermark, or [`Watermark::minimum`] when none exists.
    fn read(&self) -> Result<Watermark, StorageError>;

    /// Persist `watermark` unconditionally.
    fn write(&self, watermark: &Watermark) -> Result<(), StorageError>;

    /// Write `new` only if the stored value still equals `expected`.
    ///
    /// Returns `true` if the update was applied. An absent value compares
    /// equal to [`Watermark::minimum`].
    fn compare_and_swap(&self, expected: &Watermark, new: &Watermark)
        -> Result<bool, StorageError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Watermark persisted as a single text file.
///
/// Writes go to a sibling temp file and are renamed into place, so readers
/// never observe a torn value. [`compare_and_swap`](WatermarkStore::compare_and_swap)
/// holds a sibling `.lock` file, created exclusively, for the duration of the
/// read and the write.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn create_parent(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<LockFile, StorageError> {
        self.create_parent()?;
        let path = self.lock_path();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::Locked { path });
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        // Owner pid, for whoever finds a stale lock
        let _ = writeln!(file, "{}", std::process::id());
        Ok(LockFile { path })
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove watermark lock file"
            );
        }
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn read(&self) -> Result<Watermark, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if !content.trim().is_empty() => Ok(Watermark::new(content)),
            Ok(_) => Ok(Watermark::minimum()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Watermark::minimum()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    fn write(&self, watermark: &Watermark) -> Result<(), StorageError> {
        self.create_parent()?;

        let tmp = self.temp_path();
        fs::write(&tmp, watermark.as_str()).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        expected: &Watermark,
        new: &Watermark,
    ) -> Result<bool, StorageError> {
        let _lock = self.lock()?;
        if self.read()? != *expected {
            return Ok(false);
        }
        self.write(new)?;
        Ok(true)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Mutex-guarded watermark for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: Mutex<Option<Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(watermark: Watermark) -> Self {
        Self {
            value: Mutex::new(Some(watermark)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Watermark>>, StorageError> {
        self.value.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn read(&self) -> Result<Watermark, StorageError> {
        Ok(self.lock()?.clone().unwrap_or_default())
    }

    fn write(&self, watermark: &Watermark) -> Result<(), StorageError> {
        *self.lock()? = Some(watermark.clone());
        Ok(())
    }

    fn compare_and_swap(
        &self,
        expected: &Watermark,
        new: &Watermark,
    ) -> Result<bool, StorageError> {
        let mut guard = self.lock()?;
        let current = guard.clone().unwrap_or_default();
        if current != *expected {
            return Ok(false);
        }
        *guard = Some(new.clone());
        Ok(true)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn file_store_defaults_to_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state/last_watermark.txt"));
        assert_eq!(store.read().unwrap(), Watermark::minimum());
    }

    #[test]
    fn file_store_treats_blank_file_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_watermark.txt");
        fs::write(&path, "  \n").unwrap();
        let store = FileWatermarkStore::new(&path);
        assert_eq!(store.read().unwrap().as_str(), MIN_WATERMARK);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("last_watermark.txt");

        FileWatermarkStore::new(&path)
            .write(&Watermark::new("2025-01-02 00:00:00"))
            .unwrap();

        let reopened = FileWatermarkStore::new(&path);
        assert_eq!(reopened.read().unwrap().as_str(), "2025-01-02 00:00:00");
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn file_store_trims_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_watermark.txt");
        fs::write(&path, "2025-01-01 00:00:01\n").unwrap();
        let store = FileWatermarkStore::new(&path);
        assert_eq!(store.read().unwrap().as_str(), "2025-01-01 00:00:01");
    }

    #[test]
    fn compare_and_swap_rejects_stale_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("wm.txt"));
        let first = Watermark::new("2025-01-01 00:00:00");
        let second = Watermark::new("2025-01-02 00:00:00");

        assert!(store
            .compare_and_swap(&Watermark::minimum(), &first)
            .unwrap());
        assert!(!store
            .compare_and_swap(&Watermark::minimum(), &second)
            .unwrap());
        assert_eq!(store.read().unwrap(), first);
    }

    #[test]
    fn compare_and_swap_releases_its_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state/wm.txt"));
        let next = Watermark::new("2025-01-01 00:00:00");

        assert!(store.compare_and_swap(&Watermark::minimum(), &next).unwrap());
        assert!(!store.lock_path().exists());
        assert!(!store.compare_and_swap(&Watermark::minimum(), &next).unwrap());
        assert!(!store.lock_path().exists());
    }

    #[test]
    fn held_lock_blocks_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("wm.txt"));
        let current = Watermark::new("2025-01-01 00:00:00");
        store.write(&current).unwrap();
        fs::write(store.lock_path(), "4242\n").unwrap();

        let err = store
            .compare_and_swap(&current, &Watermark::new("2025-01-02 00:00:00"))
            .unwrap_err();

        assert!(matches!(&err, StorageError::Locked { path } if *path == store.lock_path()));
        assert_eq!(store.read().unwrap(), current);
        // A lock held by someone else is left in place
        assert!(store.lock_path().exists());
    }

    #[test]
    fn memory_store_compare_and_swap() {
        let store = MemoryWatermarkStore::new();
        let next = Watermark::new("2025-01-01 00:00:02");
        assert!(store.compare_and_swap(&Watermark::minimum(), &next).unwrap());
        assert!(!store.compare_and_swap(&Watermark::minimum(), &next).unwrap());
        assert_eq!(store.read().unwrap(), next);
    }

    #[test]
    fn ordering_prefers_chronology_then_numbers() {
        let a = Watermark::new("2025-01-01 00:00:02");
        let b = Watermark::new("2025-01-01T00:00:10Z");
        assert_eq!(a.cmp_position(&b), Ordering::Less);

        let small = Watermark::new("9");
        let large = Watermark::new("10");
        assert_eq!(small.cmp_position(&large), Ordering::Less);
    }

    #[test]
    fn ordering_compares_decimals_and_floats_numerically() {
        let cases = [("9.5", "10.5"), ("-1.25", "0.5"), ("1e3", "1500.0"), ("99", "100.01")];
        for (low, high) in cases {
            let (low, high) = (Watermark::new(low), Watermark::new(high));
            assert_eq!(low.cmp_position(&high), Ordering::Less, "{low} < {high}");
            assert_eq!(high.cmp_position(&low), Ordering::Greater, "{high} > {low}");
        }
        assert_eq!(
            Watermark::new("10.50").cmp_position(&Watermark::new("10.5")),
            Ordering::Equal
        );
    }

    #[test]
    fn initial_watermark_precedes_numbers() {
        let initial = Watermark::minimum();
        for value in ["100", "-5", "0.5", "abc"] {
            let value = Watermark::new(value);
            assert_eq!(initial.cmp_position(&value), Ordering::Less, "{value}");
            assert_eq!(value.cmp_position(&initial), Ordering::Greater, "{value}");
        }
        assert_eq!(initial.cmp_position(&Watermark::minimum()), Ordering::Equal);

        // Datetimes before the epoch still compare chronologically
        let early = Watermark::new("1960-01-01 00:00:00");
        assert_eq!(early.cmp_position(&initial), Ordering::Less);
    }

    #[test]
    fn max_of_integer_column() {
        let values: Vec<Value> = [7, 100, 42].into_iter().map(Value::Int).collect();
        assert_eq!(Watermark::max_of(&values).unwrap().as_str(), "100");
    }

    #[test]
    fn max_of_skips_nulls_and_normalizes() {
        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let values = vec![
            Value::Text("2025-01-01 00:00:01".into()),
            Value::Null,
            Value::Timestamp(day.and_hms_opt(0, 0, 0).unwrap()),
            Value::Text("2025-01-01 00:00:02".into()),
        ];
        assert_eq!(
            Watermark::max_of(&values).unwrap().as_str(),
            "2025-01-02 00:00:00"
        );
        assert_eq!(Watermark::max_of(&[Value::Null]), None);
    }
}
