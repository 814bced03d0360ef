//! Persistence boundary for day ledgers, the roster and the gallery.
//!
//! On disk ([`JsonDirectory`]):
//! - `<records>/attendance_<YYYY-MM-DD>.json`: `{identity: {category: "HH:MM:SS"}}`
//! - `<data>/roster.json`: `{identity: {category: {"present": n, "total": n}}}`
//! - `<data>/gallery.json`: dimension plus enrollments in registration order
//! - `<data>/retired.json`: ledger cells withdrawn from the roster by removals
//!
//! Files are replaced atomically: content goes to a temp file in the same
//! directory, is synced, then renamed over the target. The directory is
//! synced after the rename so a newly created file survives a crash.

use crate::ledger::{DayKey, DayLedger};
use crate::roster::{Retirements, Roster};
use crate::types::Enrollment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const DAY_FILE_PREFIX: &str = "attendance_";
const DAY_FILE_SUFFIX: &str = ".json";
const ROSTER_FILE: &str = "roster.json";
const GALLERY_FILE: &str = "gallery.json";
const RETIRED_FILE: &str = "retired.json";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Stored identities and embeddings, in registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub dimension: usize,
    pub enrollments: Vec<Enrollment>,
}

/// Durable storage used by the attendance service.
///
/// `save_*` must be atomic: a reader sees either the old or the new content.
pub trait Persistence: Send + Sync {
    /// Load one day. A day that was never saved is empty.
    fn load_day(&self, day: DayKey) -> Result<DayLedger, PersistenceError>;
    fn save_day(&self, day: DayKey, ledger: &DayLedger) -> Result<(), PersistenceError>;
    /// Drop a day unit. Only used to roll back a day created by an uncommitted mark.
    fn remove_day(&self, day: DayKey) -> Result<(), PersistenceError>;
    /// Every day that has a ledger unit, ascending.
    fn list_days(&self) -> Result<Vec<DayKey>, PersistenceError>;

    fn load_roster(&self) -> Result<Option<Roster>, PersistenceError>;
    fn save_roster(&self, roster: &Roster) -> Result<(), PersistenceError>;

    fn load_gallery(&self) -> Result<Option<Gallery>, PersistenceError>;
    fn save_gallery(&self, gallery: &Gallery) -> Result<(), PersistenceError>;

    /// Retired cells; empty when nothing was ever removed.
    fn load_retired(&self) -> Result<Retirements, PersistenceError>;
    fn save_retired(&self, retired: &Retirements) -> Result<(), PersistenceError>;
}

/// JSON files on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonDirectory {
    data_dir: PathBuf,
    records_dir: PathBuf,
}

impl JsonDirectory {
    pub fn new(data_dir: impl Into<PathBuf>, records_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            records_dir: records_dir.into(),
        }
    }

    pub fn day_path(&self, day: DayKey) -> PathBuf {
        self.records_dir
            .join(format!("{DAY_FILE_PREFIX}{day}{DAY_FILE_SUFFIX}"))
    }

    pub fn roster_path(&self) -> PathBuf {
        self.data_dir.join(ROSTER_FILE)
    }

    pub fn gallery_path(&self) -> PathBuf {
        self.data_dir.join(GALLERY_FILE)
    }

    pub fn retired_path(&self) -> PathBuf {
        self.data_dir.join(RETIRED_FILE)
    }

    fn read_optional(path: &Path) -> Result<Option<String>, PersistenceError> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(path, e)),
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(path: &Path, text: &str) -> Result<T, PersistenceError> {
        serde_json::from_str(text).map_err(|e| PersistenceError::Malformed {
            what: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize with 4-space indentation and atomically replace `path`.
    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
        let dir = path
            .parent()
            .ok_or_else(|| PersistenceError::Unavailable(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PersistenceError::io(dir, e))?;
        tmp.write_all(&buf).map_err(|e| PersistenceError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PersistenceError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| PersistenceError::io(path, e.error))?;
        Self::sync_dir(dir)
    }

    /// Flush the directory entry of a rename.
    #[cfg(unix)]
    fn sync_dir(dir: &Path) -> Result<(), PersistenceError> {
        std::fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| PersistenceError::io(dir, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(_dir: &Path) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn parse_day_file_name(name: &str) -> Option<DayKey> {
        name.strip_prefix(DAY_FILE_PREFIX)?
            .strip_suffix(DAY_FILE_SUFFIX)?
            .parse()
            .ok()
    }
}

impl Persistence for JsonDirectory {
    fn load_day(&self, day: DayKey) -> Result<DayLedger, PersistenceError> {
        let path = self.day_path(day);
        match Self::read_optional(&path)? {
            Some(text) => Self::parse(&path, &text),
            None => Ok(DayLedger::new()),
        }
    }

    fn save_day(&self, day: DayKey, ledger: &DayLedger) -> Result<(), PersistenceError> {
        Self::write_atomic(&self.day_path(day), ledger)
    }

    fn remove_day(&self, day: DayKey) -> Result<(), PersistenceError> {
        let path = self.day_path(day);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    fn list_days(&self) -> Result<Vec<DayKey>, PersistenceError> {
        let entries = match std::fs::read_dir(&self.records_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.records_dir, e)),
        };

        let mut days = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::io(&self.records_dir, e))?;
            if let Some(day) = entry.file_name().to_str().and_then(Self::parse_day_file_name) {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }

    fn load_roster(&self) -> Result<Option<Roster>, PersistenceError> {
        let path = self.roster_path();
        let Some(text) = Self::read_optional(&path)? else {
            return Ok(None);
        };
        let roster: Roster = Self::parse(&path, &text)?;
        roster.validate().map_err(|e| PersistenceError::Malformed {
            what: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(roster))
    }

    fn save_roster(&self, roster: &Roster) -> Result<(), PersistenceError> {
        Self::write_atomic(&self.roster_path(), roster)
    }

    fn load_gallery(&self) -> Result<Option<Gallery>, PersistenceError> {
        let path = self.gallery_path();
        match Self::read_optional(&path)? {
            Some(text) => Self::parse(&path, &text).map(Some),
            None => Ok(None),
        }
    }

    fn save_gallery(&self, gallery: &Gallery) -> Result<(), PersistenceError> {
        Self::write_atomic(&self.gallery_path(), gallery)
    }

    fn load_retired(&self) -> Result<Retirements, PersistenceError> {
        let path = self.retired_path();
        match Self::read_optional(&path)? {
            Some(text) => Self::parse(&path, &text),
            None => Ok(Retirements::new()),
        }
    }

    fn save_retired(&self, retired: &Retirements) -> Result<(), PersistenceError> {
        Self::write_atomic(&self.retired_path(), retired)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    days: BTreeMap<DayKey, DayLedger>,
    roster: Option<Roster>,
    gallery: Option<Gallery>,
    retired: Retirements,
}

/// In-process persistence with no disk state.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, PersistenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory store lock poisoned".into()))?;
        Ok(f(&mut state))
    }
}

impl Persistence for MemoryPersistence {
    fn load_day(&self, day: DayKey) -> Result<DayLedger, PersistenceError> {
        self.with_state(|s| s.days.get(&day).cloned().unwrap_or_default())
    }

    fn save_day(&self, day: DayKey, ledger: &DayLedger) -> Result<(), PersistenceError> {
        self.with_state(|s| {
            s.days.insert(day, ledger.clone());
        })
    }

    fn remove_day(&self, day: DayKey) -> Result<(), PersistenceError> {
        self.with_state(|s| {
            s.days.remove(&day);
        })
    }

    fn list_days(&self) -> Result<Vec<DayKey>, PersistenceError> {
        self.with_state(|s| s.days.keys().copied().collect())
    }

    fn load_roster(&self) -> Result<Option<Roster>, PersistenceError> {
        self.with_state(|s| s.roster.clone())
    }

    fn save_roster(&self, roster: &Roster) -> Result<(), PersistenceError> {
        self.with_state(|s| s.roster = Some(roster.clone()))
    }

    fn load_gallery(&self) -> Result<Option<Gallery>, PersistenceError> {
        self.with_state(|s| s.gallery.clone())
    }

    fn save_gallery(&self, gallery: &Gallery) -> Result<(), PersistenceError> {
        self.with_state(|s| s.gallery = Some(gallery.clone()))
    }

    fn load_retired(&self) -> Result<Retirements, PersistenceError> {
        self.with_state(|s| s.retired.clone())
    }

    fn save_retired(&self, retired: &Retirements) -> Result<(), PersistenceError> {
        self.with_state(|s| s.retired = retired.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategorySet;
    use crate::ledger::AttendanceLedger;
    use chrono::NaiveDateTime;
    use std::sync::Arc;

    fn store(dir: &Path) -> JsonDirectory {
        JsonDirectory::new(dir, dir.join("attendance_records"))
    }

    #[test]
    fn test_day_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let mut ledger = AttendanceLedger::open(store.clone(), CategorySet::default()).unwrap();
        let now = NaiveDateTime::parse_from_str("2024-01-10 09:02:11", "%Y-%m-%d %H:%M:%S").unwrap();
        ledger.mark("alice", "Mathematics", now).unwrap();

        let path = dir.path().join("attendance_records/attendance_2024-01-10.json");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"alice": {"Mathematics": "09:02:11"}}));
    }

    #[test]
    fn test_load_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let day: DayKey = "2024-05-05".parse().unwrap();
        assert!(store(dir.path()).load_day(day).unwrap().is_empty());
        assert!(store(dir.path()).list_days().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_day_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        std::fs::create_dir_all(dir.path().join("attendance_records")).unwrap();
        let day: DayKey = "2024-01-10".parse().unwrap();
        std::fs::write(s.day_path(day), r#"{"alice": ["Mathematics"]}"#).unwrap();

        let err = s.load_day(day).unwrap_err();
        assert!(matches!(err, PersistenceError::Malformed { .. }));
    }

    #[test]
    fn test_list_days_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let records = dir.path().join("attendance_records");
        std::fs::create_dir_all(&records).unwrap();
        std::fs::write(records.join("attendance_2024-01-11.json"), "{}").unwrap();
        std::fs::write(records.join("attendance_2024-01-10.json"), "{}").unwrap();
        std::fs::write(records.join("attendance_latest.json"), "{}").unwrap();
        std::fs::write(records.join("readme.txt"), "").unwrap();

        let days: Vec<String> = s.list_days().unwrap().iter().map(|d| d.to_string()).collect();
        assert_eq!(days, ["2024-01-10", "2024-01-11"]);
    }

    #[test]
    fn test_roster_with_impossible_counts_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        std::fs::write(s.roster_path(), r#"{"bob": {"Physics": {"present": 4, "total": 2}}}"#).unwrap();
        assert!(matches!(s.load_roster(), Err(PersistenceError::Malformed { .. })));
    }

    #[test]
    fn test_write_into_new_directory_is_synced_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let s = JsonDirectory::new(dir.path().join("nested/data"), dir.path().join("nested/records"));
        s.save_roster(&Roster::new()).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested/data"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["roster.json"]);
        assert!(JsonDirectory::sync_dir(&dir.path().join("nested/data")).is_ok());
        assert!(JsonDirectory::sync_dir(&dir.path().join("missing")).is_err() || cfg!(not(unix)));
    }

    #[test]
    fn test_retired_cells_persist() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.load_retired().unwrap().is_empty());

        let history: BTreeMap<DayKey, DayLedger> = [(
            "2024-01-10".parse().unwrap(),
            serde_json::from_str(r#"{"alice": {"Physics": "09:00:00"}}"#).unwrap(),
        )]
        .into_iter()
        .collect();
        let mut retired = Retirements::new();
        retired.retire("alice", &history);
        s.save_retired(&retired).unwrap();
        assert_eq!(s.load_retired().unwrap(), retired);

        std::fs::write(s.retired_path(), r#"{"alice": {"yesterday": ["Physics"]}}"#).unwrap();
        assert!(matches!(s.load_retired(), Err(PersistenceError::Malformed { .. })));
    }

    #[test]
    fn test_remove_day_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let day: DayKey = "2024-01-10".parse().unwrap();
        assert!(store(dir.path()).remove_day(day).is_ok());
    }
}
