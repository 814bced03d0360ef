//! Read-only attendance reports built from the roster and ledger history.

use crate::absence::{absent_dates, present_dates};
use crate::category::{Category, CategorySet};
use crate::ledger::{DayKey, DayLedger, MarkTime};
use crate::roster::Roster;
use crate::types::Identity;
use serde::Serialize;
use std::collections::BTreeMap;

/// One category line of an identity report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStanding {
    pub category: Category,
    pub present: u32,
    pub total: u32,
    pub percentage: f64,
    pub present_dates: Vec<DayKey>,
    pub absent_count: usize,
    pub absent_dates: Vec<DayKey>,
}

/// Everything known about one identity's attendance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityReport {
    pub identity: String,
    pub display_name: Option<String>,
    pub categories: Vec<CategoryStanding>,
    pub total_present: u32,
    pub total_classes: u32,
}

/// One identity's line in a category report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryMember {
    pub identity: String,
    pub display_name: String,
    pub external_id: Option<String>,
    pub present: u32,
    pub total: u32,
    pub percentage: f64,
    pub today_time: Option<MarkTime>,
    pub absent_count: usize,
    pub absent_dates: Vec<DayKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total_identities: usize,
    pub present_today: usize,
}

/// Attendance of every registered identity in one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub day: DayKey,
    pub members: Vec<CategoryMember>,
    pub stats: CategoryStats,
}

/// Build the per-category view for one identity, over every configured category.
pub fn identity_report(
    identity: &str,
    display_name: Option<String>,
    categories: &CategorySet,
    roster: &Roster,
    history: &BTreeMap<DayKey, DayLedger>,
) -> IdentityReport {
    let mut lines = Vec::with_capacity(categories.len());
    let mut total_present = 0;
    let mut total_classes = 0;

    for category in categories.iter() {
        let entry = roster.entry(identity, category.as_str()).unwrap_or_default();
        let absent = absent_dates(identity, category.as_str(), history);
        total_present += entry.present;
        total_classes += entry.total;
        lines.push(CategoryStanding {
            category: category.clone(),
            present: entry.present,
            total: entry.total,
            percentage: entry.percentage(),
            present_dates: present_dates(identity, category.as_str(), history),
            absent_count: absent.len(),
            absent_dates: absent,
        });
    }

    IdentityReport {
        identity: identity.to_string(),
        display_name,
        categories: lines,
        total_present,
        total_classes,
    }
}

/// Build the view of one category across `members`, with `day` as "today".
pub fn category_report(
    category: &Category,
    day: DayKey,
    members: &[Identity],
    roster: &Roster,
    history: &BTreeMap<DayKey, DayLedger>,
) -> CategoryReport {
    let today = history.get(&day);
    let members: Vec<CategoryMember> = members
        .iter()
        .map(|identity| {
            let entry = roster
                .entry(&identity.key, category.as_str())
                .unwrap_or_default();
            let absent = absent_dates(&identity.key, category.as_str(), history);
            CategoryMember {
                identity: identity.key.clone(),
                display_name: identity.display_name.clone(),
                external_id: identity.external_id.clone(),
                present: entry.present,
                total: entry.total,
                percentage: entry.percentage(),
                today_time: today.and_then(|l| l.get(&identity.key, category.as_str())),
                absent_count: absent.len(),
                absent_dates: absent,
            }
        })
        .collect();

    let stats = CategoryStats {
        total_identities: members.len(),
        present_today: members.iter().filter(|m| m.today_time.is_some()).count(),
    };

    CategoryReport {
        category: category.clone(),
        day,
        members,
        stats,
    }
}
