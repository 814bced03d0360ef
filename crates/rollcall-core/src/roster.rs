//! Aggregate roster: per identity and category present/total counters.
//!
//! The roster is a materialized view over the ledger. Counters move only
//! when the ledger accepts a new mark, and [`Roster::replay`] rebuilds the
//! same counters from ledger history.
//!
//! Removing an identity retires the ledger cells it held at that moment
//! ([`Retirements`]). The day ledgers keep those marks, but replay skips
//! them, so an identity that is marked again starts counting from zero on
//! both paths.

use crate::category::Category;
use crate::ledger::{DayKey, DayLedger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("{identity}/{category}: present {present} exceeds total {total}")]
    PresentExceedsTotal {
        identity: String,
        category: Category,
        present: u32,
        total: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub present: u32,
    pub total: u32,
}

impl RosterEntry {
    /// Attendance percentage rounded to one decimal; 0 when `total` is 0.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.present as f64 / self.total as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// One category line of a roster snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub category: Category,
    pub present: u32,
    pub total: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster {
    entries: BTreeMap<String, BTreeMap<Category, RosterEntry>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a ledger mark. Only newly accepted marks move the counters.
    pub fn on_mark(&mut self, identity: &str, category: &Category, newly_marked: bool) {
        if !newly_marked {
            return;
        }
        let entry = self
            .entries
            .entry(identity.to_string())
            .or_default()
            .entry(category.clone())
            .or_default();
        entry.present += 1;
        entry.total += 1;
    }

    /// Take back one counted mark. Removes entries that drop to zero.
    pub(crate) fn revert_mark(&mut self, identity: &str, category: &Category) {
        let Some(cats) = self.entries.get_mut(identity) else {
            return;
        };
        if let Some(entry) = cats.get_mut(category) {
            entry.present = entry.present.saturating_sub(1);
            entry.total = entry.total.saturating_sub(1);
            if entry.total == 0 {
                cats.remove(category);
            }
        }
        if cats.is_empty() {
            self.entries.remove(identity);
        }
    }

    pub fn entry(&self, identity: &str, category: &str) -> Option<RosterEntry> {
        self.entries
            .get(identity)?
            .iter()
            .find(|(c, _)| c.as_str() == category)
            .map(|(_, e)| *e)
    }

    pub fn entries(&self, identity: &str) -> Option<&BTreeMap<Category, RosterEntry>> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Drop every counter for an identity, returning what was removed.
    pub fn remove(&mut self, identity: &str) -> Option<BTreeMap<Category, RosterEntry>> {
        self.entries.remove(identity)
    }

    pub(crate) fn insert(&mut self, identity: &str, counters: BTreeMap<Category, RosterEntry>) {
        self.entries.insert(identity.to_string(), counters);
    }

    /// Per-category standing for one identity, ordered by category name.
    pub fn snapshot(&self, identity: &str) -> Vec<Standing> {
        self.entries
            .get(identity)
            .map(|cats| {
                cats.iter()
                    .map(|(category, entry)| Standing {
                        category: category.clone(),
                        present: entry.present,
                        total: entry.total,
                        percentage: entry.percentage(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuild counters from scratch by replaying every ledger cell in day
    /// order, skipping retired cells.
    pub fn replay(history: &BTreeMap<DayKey, DayLedger>, retired: &Retirements) -> Self {
        let mut roster = Self::new();
        for (day, ledger) in history {
            for (identity, category, _) in ledger.cells() {
                if !retired.excludes(identity, *day, category) {
                    roster.on_mark(identity, category, true);
                }
            }
        }
        roster
    }

    /// Identities whose counters differ between `self` and `other`.
    pub fn diff_identities(&self, other: &Roster) -> Vec<String> {
        let keys: BTreeSet<&str> = self.identities().chain(other.identities()).collect();
        keys.into_iter()
            .filter(|key| self.entries(key) != other.entries(key))
            .map(str::to_string)
            .collect()
    }

    /// Check `present <= total` for every entry.
    pub fn validate(&self) -> Result<(), RosterError> {
        for (identity, cats) in &self.entries {
            for (category, entry) in cats {
                if entry.present > entry.total {
                    return Err(RosterError::PresentExceedsTotal {
                        identity: identity.clone(),
                        category: category.clone(),
                        present: entry.present,
                        total: entry.total,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Ledger cells withdrawn from the roster by identity removals.
///
/// Stored as `{identity: {"YYYY-MM-DD": [category, ...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Retirements {
    cells: BTreeMap<String, BTreeMap<DayKey, BTreeSet<Category>>>,
}

impl Retirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire every cell `identity` holds in `history`.
    ///
    /// Returns false when nothing new was retired.
    pub fn retire(&mut self, identity: &str, history: &BTreeMap<DayKey, DayLedger>) -> bool {
        let mut changed = false;
        for (day, ledger) in history {
            let Some(cats) = ledger.entries(identity) else {
                continue;
            };
            let retired = self
                .cells
                .entry(identity.to_string())
                .or_default()
                .entry(*day)
                .or_default();
            for category in cats.keys() {
                changed |= retired.insert(category.clone());
            }
        }
        changed
    }

    pub fn excludes(&self, identity: &str, day: DayKey, category: &Category) -> bool {
        self.cells
            .get(identity)
            .and_then(|days| days.get(&day))
            .is_some_and(|cats| cats.contains(category))
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategorySet;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn history(days: &[(&str, &str)]) -> BTreeMap<DayKey, DayLedger> {
        days.iter()
            .map(|(d, json)| (day(d), serde_json::from_str(json).unwrap()))
            .collect()
    }

    fn cat(name: &str) -> Category {
        CategorySet::default().resolve(name).unwrap().clone()
    }

    #[test]
    fn test_on_mark_counts_only_new_marks() {
        let mut roster = Roster::new();
        let math = cat("Mathematics");
        roster.on_mark("alice", &math, true);
        roster.on_mark("alice", &math, false);
        roster.on_mark("alice", &math, true);
        assert_eq!(roster.entry("alice", "Mathematics"), Some(RosterEntry { present: 2, total: 2 }));
    }

    #[test]
    fn test_percentage_rounding_and_zero_total() {
        assert_eq!(RosterEntry { present: 0, total: 0 }.percentage(), 0.0);
        assert_eq!(RosterEntry { present: 28, total: 30 }.percentage(), 93.3);
        assert_eq!(RosterEntry { present: 2, total: 3 }.percentage(), 66.7);
        assert_eq!(RosterEntry { present: 5, total: 5 }.percentage(), 100.0);
    }

    #[test]
    fn test_snapshot_unknown_identity_is_empty() {
        assert!(Roster::new().snapshot("ghost").is_empty());
    }

    #[test]
    fn test_snapshot_lists_categories() {
        let mut roster = Roster::new();
        roster.on_mark("alice", &cat("Physics"), true);
        roster.on_mark("alice", &cat("English"), true);
        let snap = roster.snapshot("alice");
        let names: Vec<_> = snap.iter().map(|s| s.category.as_str()).collect();
        assert_eq!(names, ["English", "Physics"]);
        assert_eq!(snap[0].percentage, 100.0);
    }

    #[test]
    fn test_revert_mark_drops_empty_entries() {
        let mut roster = Roster::new();
        roster.on_mark("alice", &cat("Physics"), true);
        roster.revert_mark("alice", &cat("Physics"));
        assert!(!roster.contains("alice"));
        assert_eq!(roster, Roster::new());
    }

    #[test]
    fn test_roster_json_shape_and_validation() {
        let roster: Roster =
            serde_json::from_str(r#"{"alice": {"Mathematics": {"present": 1, "total": 1}}}"#).unwrap();
        assert_eq!(roster.entry("alice", "Mathematics"), Some(RosterEntry { present: 1, total: 1 }));
        assert!(roster.validate().is_ok());

        let bad: Roster =
            serde_json::from_str(r#"{"alice": {"Physics": {"present": 3, "total": 1}}}"#).unwrap();
        assert_eq!(
            bad.validate(),
            Err(RosterError::PresentExceedsTotal {
                identity: "alice".into(),
                category: cat("Physics"),
                present: 3,
                total: 1,
            })
        );
    }

    #[test]
    fn test_replay_skips_retired_cells() {
        let mut h = history(&[
            ("2024-01-10", r#"{"alice": {"Physics": "09:00:00"}, "bob": {"Physics": "09:01:00"}}"#),
            ("2024-01-11", r#"{"alice": {"Physics": "09:00:00"}}"#),
        ]);
        let mut retired = Retirements::new();
        assert!(retired.retire("alice", &h));
        assert!(!retired.retire("alice", &h));

        let replayed = Roster::replay(&h, &retired);
        assert!(!replayed.contains("alice"));
        assert_eq!(replayed.entry("bob", "Physics"), Some(RosterEntry { present: 1, total: 1 }));

        // A later mark on a fresh cell counts again.
        h.insert(day("2024-01-12"), serde_json::from_str(r#"{"alice": {"Physics": "10:00:00"}}"#).unwrap());
        let replayed = Roster::replay(&h, &retired);
        assert_eq!(replayed.entry("alice", "Physics"), Some(RosterEntry { present: 1, total: 1 }));

        // Retiring again adds only the new cell.
        assert!(retired.retire("alice", &h));
        assert!(!Roster::replay(&h, &retired).contains("alice"));
    }

    #[test]
    fn test_retirements_json_shape() {
        let h = history(&[("2024-01-10", r#"{"alice": {"Physics": "09:00:00", "English": "10:00:00"}}"#)]);
        let mut retired = Retirements::new();
        retired.retire("alice", &h);
        assert_eq!(
            serde_json::to_string(&retired).unwrap(),
            r#"{"alice":{"2024-01-10":["English","Physics"]}}"#
        );
        let back: Retirements = serde_json::from_str(r#"{"alice":{"2024-01-10":["English","Physics"]}}"#).unwrap();
        assert_eq!(back, retired);
        assert!(back.excludes("alice", day("2024-01-10"), &cat("English")));
        assert!(!back.excludes("alice", day("2024-01-11"), &cat("English")));
    }

    #[test]
    fn test_diff_identities() {
        let mut a = Roster::new();
        let mut b = Roster::new();
        a.on_mark("alice", &cat("Physics"), true);
        b.on_mark("alice", &cat("Physics"), true);
        b.on_mark("bob", &cat("Physics"), true);
        assert_eq!(a.diff_identities(&b), ["bob"]);
        assert!(a.diff_identities(&a.clone()).is_empty());
    }
}
