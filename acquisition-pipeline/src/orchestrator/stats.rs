use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{storage::types::image_record::SizeHistogram, utils::config::Bounds};
use serde::Serialize;

use crate::{types::KeywordTarget, worker::{KeywordCounters, KeywordOutcome}};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub planned: usize,
    pub persisted: usize,
    pub keywords: usize,
    pub keywords_on_target: usize,
    pub counters: KeywordCounters,
}

/// Run-wide aggregates. Only the orchestrator loop mutates them.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub global_target: Bounds<usize>,
    pub planned: usize,
    pub persisted: usize,
    pub keywords_total: usize,
    pub keywords_completed: usize,
    pub keywords_skipped: usize,
    /// The store reached `global_target.max` completed images and remaining
    /// keywords were skipped.
    pub ceiling_reached: bool,
    /// The run was stopped from outside.
    pub cancelled: bool,
    pub totals: KeywordCounters,
    pub size_buckets: SizeHistogram,
    pub categories: BTreeMap<String, CategoryStats>,
}

impl RunStats {
    pub fn new(run_id: String, global_target: Bounds<usize>, targets: &[KeywordTarget]) -> Self {
        let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
        for target in targets {
            let entry = categories.entry(target.category.clone()).or_default();
            entry.planned = entry.planned.saturating_add(target.target_count);
            entry.keywords = entry.keywords.saturating_add(1);
        }

        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            global_target,
            planned: targets.iter().map(|t| t.target_count).sum(),
            persisted: 0,
            keywords_total: targets.len(),
            keywords_completed: 0,
            keywords_skipped: 0,
            ceiling_reached: false,
            cancelled: false,
            totals: KeywordCounters::default(),
            size_buckets: SizeHistogram::default(),
            categories,
        }
    }

    pub fn record(&mut self, outcome: &KeywordOutcome) {
        let persisted = outcome.persisted();
        self.persisted = self.persisted.saturating_add(persisted);
        self.keywords_completed = self.keywords_completed.saturating_add(1);
        self.totals.absorb(&outcome.counters);
        for record in &outcome.records {
            self.size_buckets.add(record.byte_size);
        }

        let entry = self.categories.entry(outcome.category.clone()).or_default();
        entry.persisted = entry.persisted.saturating_add(persisted);
        entry.counters.absorb(&outcome.counters);
        if outcome.reached_target() {
            entry.keywords_on_target = entry.keywords_on_target.saturating_add(1);
        }
    }

    pub fn record_skipped(&mut self) {
        self.keywords_skipped = self.keywords_skipped.saturating_add(1);
    }

    pub fn below_floor(&self) -> bool {
        self.persisted < self.global_target.min
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::image_record::{ImageRecord, NewImageRecord};

    fn target(keyword: &str, category: &str, count: usize) -> KeywordTarget {
        KeywordTarget {
            keyword: keyword.into(),
            category: category.into(),
            subcategory: category.into(),
            target_count: count,
            relevance_threshold: 0.85,
        }
    }

    fn record(url: &str, byte_size: u64) -> ImageRecord {
        ImageRecord::new(NewImageRecord {
            source_url: url.into(),
            alt_text: String::new(),
            category: "anime".into(),
            subcategory: "anime".into(),
            search_term: "a".into(),
            local_path: "anime/anime/a_1.jpg".into(),
            byte_size,
            width: 64,
            height: 64,
            encoding_quality: 80,
            relevance_score: 0.9,
        })
    }

    #[test]
    fn aggregates_outcomes_per_category() {
        let targets = vec![target("a", "anime", 2), target("b", "anime", 2), target("c", "cartoon", 1)];
        let mut stats = RunStats::new("run".into(), Bounds { min: 5, max: 8 }, &targets);
        assert_eq!(stats.planned, 5);

        let mut first = KeywordOutcome::empty(targets.first().expect("target"));
        first.records = vec![record("https://e.com/1", 5_000), record("https://e.com/2", 30_000)];
        first.counters.persisted = 2;
        first.counters.duplicates = 1;
        stats.record(&first);

        let second = KeywordOutcome::empty(targets.get(1).expect("target"));
        stats.record(&second);
        stats.record_skipped();

        let anime = stats.categories.get("anime").expect("anime");
        assert_eq!(anime.planned, 4);
        assert_eq!(anime.persisted, 2);
        assert_eq!(anime.keywords_on_target, 1);
        assert_eq!(stats.totals.duplicates, 1);
        assert_eq!(stats.keywords_completed, 2);
        assert_eq!(stats.keywords_skipped, 1);
        assert_eq!(stats.size_buckets.under_10kb, 1);
        assert_eq!(stats.size_buckets.under_50kb, 1);
        assert!(stats.below_floor());
    }
}
