//! Filter state handed to content fetches, and the client-side
//! filtering and sorting every backend shares.

use std::cmp::Ordering;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::model::{object::ObjectRef, statistics::Statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Backend order
    #[default]
    Never,
    Alphabetical,
    CreationDate,
    Rating,
    UseCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterState {
    #[serde(default)]
    pub search_string: CompactString,

    /// Minimum star rating; 0 lets everything through
    #[serde(default)]
    pub rating_threshold: u8,

    #[serde(default)]
    pub sort_key: SortKey,

    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl FilterState {
    #[must_use]
    pub fn with_search(search: impl Into<CompactString>) -> Self {
        Self {
            search_string: search.into(),
            ..Self::default()
        }
    }

    /// Same set of objects, possibly in a different order.
    #[must_use]
    pub fn selects_same_objects(&self, other: &Self) -> bool {
        self.search_string == other.search_string && self.rating_threshold == other.rating_threshold
    }

    /// Case-insensitive substring match on `name`.
    #[must_use]
    pub fn matches_search(&self, name: &str) -> bool {
        let needle = self.search_string.trim();
        needle.is_empty() || name.to_lowercase().contains(&needle.to_lowercase())
    }

    #[must_use]
    pub fn passes_rating(&self, identifier: &str, statistics: &Statistics) -> bool {
        self.rating_threshold == 0 || statistics.rating(identifier) >= self.rating_threshold
    }

    #[must_use]
    pub fn matches(&self, object: &ObjectRef, statistics: &Statistics) -> bool {
        self.matches_search(object.name()) && self.passes_rating(object.identifier(), statistics)
    }

    /// Stable sort by the configured key and direction.
    pub fn sort(&self, objects: &mut [ObjectRef], statistics: &Statistics) {
        let compare = |a: &ObjectRef, b: &ObjectRef| -> Ordering {
            match self.sort_key {
                SortKey::Never => Ordering::Equal,
                SortKey::Alphabetical => a.name().to_lowercase().cmp(&b.name().to_lowercase()),
                SortKey::CreationDate => a.created().cmp(&b.created()),
                SortKey::Rating => statistics
                    .rating(a.identifier())
                    .cmp(&statistics.rating(b.identifier())),
                SortKey::UseCount => statistics
                    .use_count(a.identifier())
                    .cmp(&statistics.use_count(b.identifier())),
            }
        };

        match self.sort_direction {
            SortDirection::Ascending => objects.sort_by(compare),
            SortDirection::Descending => objects.sort_by(|a, b| compare(b, a)),
        }
    }

    /// Filter then sort.
    #[must_use]
    pub fn apply(&self, objects: &[ObjectRef], statistics: &Statistics) -> Vec<ObjectRef> {
        let mut visible: Vec<ObjectRef> = objects
            .iter()
            .filter(|o| self.matches(o, statistics))
            .cloned()
            .collect();
        self.sort(&mut visible, statistics);
        visible
    }
}
