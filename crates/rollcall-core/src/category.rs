//! The fixed set of attendance categories (subjects).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Categories used when configuration does not name any.
pub const DEFAULT_CATEGORIES: [&str; 8] = [
    "Mathematics",
    "Physics",
    "Chemistry",
    "English",
    "Computer Science",
    "Biology",
    "History",
    "Geography",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CategorySetError {
    #[error("category set is empty")]
    Empty,
    #[error("category name is blank")]
    Blank,
    #[error("duplicate category: {0}")]
    Duplicate(String),
}

/// A category name as stored in ledgers and the roster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Category {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ordered, duplicate-free set of valid categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySet {
    names: Vec<Category>,
}

impl CategorySet {
    pub fn new<I, S>(names: I) -> Result<Self, CategorySetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<Category> = Vec::new();
        for name in names {
            let name = name.into().trim().to_string();
            if name.is_empty() {
                return Err(CategorySetError::Blank);
            }
            if set.iter().any(|c| c.0 == name) {
                return Err(CategorySetError::Duplicate(name));
            }
            set.push(Category(name));
        }
        if set.is_empty() {
            return Err(CategorySetError::Empty);
        }
        Ok(Self { names: set })
    }

    /// Look up a category by exact name.
    pub fn resolve(&self, name: &str) -> Option<&Category> {
        self.names.iter().find(|c| c.0 == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.names.iter()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self {
            names: DEFAULT_CATEGORIES
                .iter()
                .map(|name| Category(name.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set() {
        let set = CategorySet::default();
        assert_eq!(set.len(), 8);
        assert!(set.contains("Computer Science"));
        assert!(!set.contains("mathematics"));
    }

    #[test]
    fn test_new_trims_and_rejects_duplicates() {
        let set = CategorySet::new([" Art ", "Music"]).unwrap();
        assert!(set.contains("Art"));
        assert_eq!(
            CategorySet::new(["Art", "Art"]),
            Err(CategorySetError::Duplicate("Art".into()))
        );
        assert_eq!(CategorySet::new(["  "]), Err(CategorySetError::Blank));
        assert_eq!(CategorySet::new(Vec::<String>::new()), Err(CategorySetError::Empty));
    }
}
