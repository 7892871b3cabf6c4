//! Reference tables (columns, sites) mirrored from the source into the destination.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A row that can be reconciled by primary key.
pub trait ReferenceRow {
    fn id(&self) -> i64;

    /// True when the fields the destination cares about changed.
    fn differs_from(&self, other: &Self) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRow {
    pub id: i64,
    pub name: String,
    pub site_id: i64,
    pub parent_id: i64,
    pub link: String,
    pub path: String,
    pub sort: i64,
    pub navigation: i64,
    pub readonly: i64,
}

impl ReferenceRow for ColumnRow {
    fn id(&self) -> i64 {
        self.id
    }

    fn differs_from(&self, other: &Self) -> bool {
        self.name != other.name
            || self.site_id != other.site_id
            || self.parent_id != other.parent_id
            || self.path != other.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRow {
    pub id: i64,
    pub name: String,
    pub domain_name: String,
    pub file_path: String,
    pub logo: String,
    pub short_name: String,
}

impl ReferenceRow for SiteRow {
    fn id(&self) -> i64 {
        self.id
    }

    fn differs_from(&self, other: &Self) -> bool {
        self.name != other.name || self.domain_name != other.domain_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDiff<T> {
    pub added: Vec<T>,
    pub updated: Vec<T>,
    pub deleted: Vec<i64>,
}

impl<T> Default for TableDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> TableDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Reconciles `target` towards `source`: missing rows are added, changed rows updated and
/// rows only present in `target` deleted. Deleted ids come out ascending.
pub fn diff_by_id<T: ReferenceRow>(source: Vec<T>, target: Vec<T>) -> TableDiff<T> {
    let mut remaining: BTreeMap<i64, T> = target.into_iter().map(|row| (row.id(), row)).collect();
    let mut diff = TableDiff::default();

    for row in source {
        match remaining.remove(&row.id()) {
            None => diff.added.push(row),
            Some(existing) if existing.differs_from(&row) => diff.updated.push(row),
            Some(_) => {}
        }
    }

    diff.deleted = remaining.into_keys().collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(id: i64, name: &str) -> ColumnRow {
        ColumnRow {
            id,
            name: name.to_string(),
            parent_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn diff_classifies_added_updated_deleted() {
        let source = vec![column(1, "News"), column(2, "Home v2"), column(4, "Events")];
        let target = vec![column(2, "Home"), column(1, "News"), column(3, "Old")];

        let diff = diff_by_id(source, target);
        assert_eq!(diff.added, vec![column(4, "Events")]);
        assert_eq!(diff.updated, vec![column(2, "Home v2")]);
        assert_eq!(diff.deleted, vec![3]);
    }

    #[test]
    fn untracked_fields_do_not_trigger_updates() {
        let mut changed = column(1, "News");
        changed.sort = 99;
        let diff = diff_by_id(vec![changed], vec![column(1, "News")]);
        assert!(diff.is_empty());
    }

    #[test]
    fn site_diff_tracks_domain_changes() {
        let old = SiteRow {
            id: 7,
            name: "Main".into(),
            domain_name: "a.example.edu".into(),
            ..Default::default()
        };
        let new = SiteRow {
            domain_name: "b.example.edu".into(),
            ..old.clone()
        };
        let diff = diff_by_id(vec![new.clone()], vec![old]);
        assert_eq!(diff.updated, vec![new]);
    }
}
