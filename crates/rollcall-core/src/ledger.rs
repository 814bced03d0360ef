//! Day-sharded attendance ledger.
//!
//! Each calendar day is one [`DayLedger`] mapping identity → category →
//! time of the first mark. A cell goes from unmarked to marked exactly once;
//! later marks for the same cell return the original time untouched. New
//! marks are persisted before `mark` returns.

use crate::category::{Category, CategorySet};
use crate::persistence::{Persistence, PersistenceError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid category: {0}")]
    InvalidCategory(String),
    #[error("identity key is empty")]
    EmptyIdentity,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Calendar date keying one day ledger, rendered `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for DayKey {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, DAY_FORMAT).map(Self)
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Time of a mark at one-second resolution, rendered `HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkTime(NaiveTime);

impl MarkTime {
    pub fn new(time: NaiveTime) -> Self {
        // Sub-second precision is not representable in the stored format.
        Self(time.with_nanosecond(0).unwrap_or(time))
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

impl From<NaiveTime> for MarkTime {
    fn from(time: NaiveTime) -> Self {
        Self::new(time)
    }
}

impl fmt::Display for MarkTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIME_FORMAT))
    }
}

impl FromStr for MarkTime {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s, TIME_FORMAT).map(Self)
    }
}

impl Serialize for MarkTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MarkTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Attendance for one calendar day: identity → category → first mark time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayLedger {
    marks: BTreeMap<String, BTreeMap<Category, MarkTime>>,
}

impl DayLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str, category: &str) -> Option<MarkTime> {
        self.marks
            .get(identity)
            .and_then(|cats| cats.iter().find(|(c, _)| c.as_str() == category))
            .map(|(_, t)| *t)
    }

    pub fn is_marked(&self, identity: &str, category: &str) -> bool {
        self.get(identity, category).is_some()
    }

    /// Categories marked for an identity on this day.
    pub fn entries(&self, identity: &str) -> Option<&BTreeMap<Category, MarkTime>> {
        self.marks.get(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.marks.keys().map(String::as_str)
    }

    /// Every `(identity, category, time)` cell, in key order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &Category, MarkTime)> {
        self.marks.iter().flat_map(|(identity, cats)| {
            cats.iter()
                .map(move |(category, time)| (identity.as_str(), category, *time))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Set a cell if it is unmarked. Returns the existing time otherwise.
    fn mark_once(&mut self, identity: &str, category: &Category, time: MarkTime) -> Result<(), MarkTime> {
        let cats = self.marks.entry(identity.to_string()).or_default();
        match cats.get(category) {
            Some(existing) => Err(*existing),
            None => {
                cats.insert(category.clone(), time);
                Ok(())
            }
        }
    }

    fn unmark(&mut self, identity: &str, category: &Category) {
        if let Some(cats) = self.marks.get_mut(identity) {
            cats.remove(category);
            if cats.is_empty() {
                self.marks.remove(identity);
            }
        }
    }
}

/// Result of a mark request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkOutcome {
    pub identity: String,
    pub category: Category,
    pub day: DayKey,
    /// False when the cell was already marked; `time` is then the original.
    pub newly_marked: bool,
    pub time: MarkTime,
    /// This mark created the day's ledger unit.
    #[serde(skip)]
    pub(crate) created_day: bool,
}

pub struct AttendanceLedger {
    persistence: Arc<dyn Persistence>,
    categories: CategorySet,
    days: BTreeMap<DayKey, DayLedger>,
    known_days: BTreeSet<DayKey>,
}

impl AttendanceLedger {
    /// Open the ledger, indexing the days already persisted.
    pub fn open(persistence: Arc<dyn Persistence>, categories: CategorySet) -> Result<Self, PersistenceError> {
        let known_days: BTreeSet<DayKey> = persistence.list_days()?.into_iter().collect();
        tracing::debug!(days = known_days.len(), "ledger opened");
        Ok(Self {
            persistence,
            categories,
            days: BTreeMap::new(),
            known_days,
        })
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// Validate a category name against the configured set.
    pub fn resolve_category(&self, name: &str) -> Result<Category, LedgerError> {
        self.categories
            .resolve(name)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidCategory(name.to_string()))
    }

    fn load(&mut self, day: DayKey) -> Result<&mut DayLedger, PersistenceError> {
        if !self.days.contains_key(&day) {
            let ledger = if self.known_days.contains(&day) {
                self.persistence.load_day(day)?
            } else {
                DayLedger::new()
            };
            self.days.insert(day, ledger);
        }
        // Inserted above when missing.
        Ok(self.days.entry(day).or_default())
    }

    /// Record that `identity` was seen for `category` at `now`.
    ///
    /// Idempotent per (day, identity, category): a repeated mark reports
    /// `newly_marked = false` with the first recorded time.
    pub fn mark(&mut self, identity: &str, category: &str, now: NaiveDateTime) -> Result<MarkOutcome, LedgerError> {
        let category = self.resolve_category(category)?;
        if identity.trim().is_empty() {
            return Err(LedgerError::EmptyIdentity);
        }

        let day = DayKey::from(now.date());
        let time = MarkTime::from(now.time());
        let created_day = !self.known_days.contains(&day);

        let ledger = self.load(day)?;
        if let Err(existing) = ledger.mark_once(identity, &category, time) {
            return Ok(MarkOutcome {
                identity: identity.to_string(),
                category,
                day,
                newly_marked: false,
                time: existing,
                created_day: false,
            });
        }

        let snapshot = ledger.clone();
        if let Err(err) = self.persistence.save_day(day, &snapshot) {
            tracing::error!(%day, identity, %category, error = %err, "day ledger write failed");
            if let Some(ledger) = self.days.get_mut(&day) {
                ledger.unmark(identity, &category);
            }
            return Err(err.into());
        }
        self.known_days.insert(day);

        Ok(MarkOutcome {
            identity: identity.to_string(),
            category,
            day,
            newly_marked: true,
            time,
            created_day,
        })
    }

    /// Undo a committed new mark. Used when a dependent write fails.
    pub(crate) fn revert(&mut self, outcome: &MarkOutcome) -> Result<(), PersistenceError> {
        if !outcome.newly_marked {
            return Ok(());
        }
        let day = outcome.day;
        let Some(ledger) = self.days.get_mut(&day) else {
            return Ok(());
        };
        ledger.unmark(&outcome.identity, &outcome.category);

        if outcome.created_day && ledger.is_empty() {
            self.persistence.remove_day(day)?;
            self.days.remove(&day);
            self.known_days.remove(&day);
        } else {
            let snapshot = ledger.clone();
            self.persistence.save_day(day, &snapshot)?;
        }
        Ok(())
    }

    /// The ledger for one day; empty when nothing was recorded.
    pub fn day(&mut self, day: DayKey) -> Result<DayLedger, PersistenceError> {
        if !self.known_days.contains(&day) {
            return Ok(DayLedger::new());
        }
        Ok(self.load(day)?.clone())
    }

    /// Every persisted day ledger, ascending by date.
    pub fn history(&mut self) -> Result<&BTreeMap<DayKey, DayLedger>, PersistenceError> {
        for day in self.persistence.list_days()? {
            self.known_days.insert(day);
        }
        let days: Vec<DayKey> = self.known_days.iter().copied().collect();
        for day in days {
            self.load(day)?;
        }
        self.days.retain(|day, _| self.known_days.contains(day));
        Ok(&self.days)
    }
}
