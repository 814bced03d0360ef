//! Absence derivation over ledger history.
//!
//! Every day with a ledger unit counts, even an empty one. A day is an
//! absence for (identity, category) when that cell is not marked, whether
//! the identity is missing from the day entirely or only the category is.

use crate::ledger::{DayKey, DayLedger};
use std::collections::BTreeMap;

/// Days, ascending, on which `identity` has no mark for `category`.
pub fn absent_dates(
    identity: &str,
    category: &str,
    history: &BTreeMap<DayKey, DayLedger>,
) -> Vec<DayKey> {
    history
        .iter()
        .filter(|(_, ledger)| !ledger.is_marked(identity, category))
        .map(|(day, _)| *day)
        .collect()
}

/// Days, ascending, on which `identity` was marked for `category`.
pub fn present_dates(
    identity: &str,
    category: &str,
    history: &BTreeMap<DayKey, DayLedger>,
) -> Vec<DayKey> {
    history
        .iter()
        .filter(|(_, ledger)| ledger.is_marked(identity, category))
        .map(|(day, _)| *day)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(days: &[(&str, &str)]) -> BTreeMap<DayKey, DayLedger> {
        days.iter()
            .map(|(day, json)| (day.parse().unwrap(), serde_json::from_str(json).unwrap()))
            .collect()
    }

    fn keys(days: &[DayKey]) -> Vec<String> {
        days.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_absent_dates_example() {
        let h = history(&[
            ("2024-01-10", r#"{"alice": {"Mathematics": "09:02:11"}}"#),
            ("2024-01-11", r#"{}"#),
        ]);
        assert_eq!(keys(&absent_dates("alice", "Mathematics", &h)), ["2024-01-11"]);
        assert_eq!(keys(&absent_dates("alice", "Physics", &h)), ["2024-01-10", "2024-01-11"]);
    }

    #[test]
    fn test_missing_identity_is_absent_for_every_category() {
        let h = history(&[("2024-02-01", r#"{"bob": {"English": "10:00:00"}}"#)]);
        assert_eq!(keys(&absent_dates("alice", "English", &h)), ["2024-02-01"]);
        assert_eq!(keys(&absent_dates("alice", "History", &h)), ["2024-02-01"]);
    }

    #[test]
    fn test_present_and_absent_partition_history() {
        let h = history(&[
            ("2024-03-03", r#"{"alice": {"Physics": "09:00:00"}}"#),
            ("2024-03-01", r#"{"alice": {"English": "09:00:00"}}"#),
            ("2024-03-02", r#"{"alice": {"Physics": "11:00:00", "English": "12:00:00"}}"#),
            ("2024-03-04", r#"{}"#),
        ]);
        let absent = absent_dates("alice", "Physics", &h);
        let present = present_dates("alice", "Physics", &h);

        assert_eq!(keys(&absent), ["2024-03-01", "2024-03-04"]);
        assert_eq!(keys(&present), ["2024-03-02", "2024-03-03"]);
        assert!(absent.iter().all(|d| !present.contains(d)));

        let mut union: Vec<DayKey> = absent.into_iter().chain(present).collect();
        union.sort();
        assert_eq!(union, h.keys().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_resolver_is_repeatable() {
        let h = history(&[("2024-01-10", r#"{}"#)]);
        let first = absent_dates("alice", "Mathematics", &h);
        let second = absent_dates("alice", "Mathematics", &h);
        assert_eq!(first, second);
    }
}
