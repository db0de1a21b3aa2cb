//! Per-object user statistics: star rating and use count.
//!
//! Keyed by object identifier so they survive reloads of the tree.

use std::collections::BTreeMap;

use ahash::RandomState;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub const MAX_RATING: u8 = 5;

#[derive(Debug, Default)]
pub struct Statistics {
    ratings: DashMap<CompactString, u8, RandomState>,
    use_counts: DashMap<CompactString, u32, RandomState>,
}

/// Serializable form, stored alongside the tree state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ratings: BTreeMap<CompactString, u8>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub use_counts: BTreeMap<CompactString, u32>,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rating(&self, identifier: &str) -> u8 {
        self.ratings.get(identifier).map_or(0, |r| *r)
    }

    /// Ratings are clamped to 0..=5; 0 removes the entry.
    pub fn set_rating(&self, identifier: &str, rating: u8) {
        let rating = rating.min(MAX_RATING);
        if rating == 0 {
            self.ratings.remove(identifier);
        } else {
            self.ratings.insert(identifier.into(), rating);
        }
    }

    #[must_use]
    pub fn use_count(&self, identifier: &str) -> u32 {
        self.use_counts.get(identifier).map_or(0, |c| *c)
    }

    pub fn increment_use_count(&self, identifier: &str) -> u32 {
        let mut count = self.use_counts.entry(identifier.into()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            ratings: self
                .ratings
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            use_counts: self
                .use_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    /// Replace all values with the snapshot's.
    pub fn restore(&self, snapshot: &StatisticsSnapshot) {
        self.ratings.clear();
        self.use_counts.clear();

        for (id, rating) in &snapshot.ratings {
            self.set_rating(id, *rating);
        }
        for (id, count) in &snapshot.use_counts {
            self.use_counts.insert(id.clone(), *count);
        }
    }
}
