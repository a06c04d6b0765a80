use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context;
use common::{error::AppError, storage::types::image_record::StoreStats};
use serde::Serialize;
use tracing::info;

use crate::{orchestrator::RunStats, types::KeywordTarget, worker::KeywordOutcome};

/// End-of-run summary, written as `collection_report_<run_id>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stats: RunStats,
    pub targets: Vec<KeywordTarget>,
    pub keywords: Vec<KeywordOutcome>,
    pub store: StoreStats,
}

impl RunReport {
    pub fn file_name(&self) -> String {
        format!("collection_report_{}.json", self.stats.run_id)
    }

    pub async fn write_json(&self, report_dir: &Path) -> Result<PathBuf, AppError> {
        tokio::fs::create_dir_all(report_dir)
            .await
            .with_context(|| format!("creating report directory {}", report_dir.display()))?;

        let path = report_dir.join(self.file_name());
        let blob = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, blob)
            .await
            .with_context(|| format!("writing JSON report to {}", path.display()))?;

        info!(path = %path.display(), "collection report written");
        Ok(path)
    }

    /// Plain-text summary for terminals.
    pub fn render_summary(&self) -> String {
        let stats = &self.stats;
        let mut out = String::new();

        let _ = writeln!(out, "Run {}", stats.run_id);
        let _ = writeln!(
            out,
            "Persisted {} of {} planned (target {}..{})",
            stats.persisted, stats.planned, stats.global_target.min, stats.global_target.max
        );
        if stats.ceiling_reached {
            let _ = writeln!(out, "Stopped at the global ceiling");
        }
        if stats.cancelled {
            let _ = writeln!(out, "Cancelled before completion");
        }
        if stats.below_floor() {
            let _ = writeln!(out, "Below the global minimum");
        }
        let _ = writeln!(
            out,
            "Keywords: {} done, {} skipped, {} total",
            stats.keywords_completed, stats.keywords_skipped, stats.keywords_total
        );

        let totals = &stats.totals;
        let _ = writeln!(
            out,
            "Candidates {} | rejected {} | vetoed {} | duplicates {} | download failures {} | unreadable {} | over size floor {} | storage failures {} | search failures {}",
            totals.candidates,
            totals.rejected,
            totals.vetoed,
            totals.duplicates,
            totals.download_failures,
            totals.unreadable,
            totals.size_floor_exceeded,
            totals.storage_failures,
            totals.search_failures
        );

        for (name, category) in &stats.categories {
            let _ = writeln!(
                out,
                "  {name}: {}/{} ({} of {} keywords on target)",
                category.persisted, category.planned, category.keywords_on_target, category.keywords
            );
        }

        let buckets = &stats.size_buckets;
        let _ = writeln!(
            out,
            "Sizes: <10KB {} | <25KB {} | <50KB {} | >=50KB {}",
            buckets.under_10kb, buckets.under_25kb, buckets.under_50kb, buckets.over_50kb
        );
        let _ = writeln!(out, "Store total: {} images", self.store.total);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::Bounds;

    fn report() -> RunReport {
        let targets = vec![KeywordTarget {
            keyword: "anime girl".into(),
            category: "anime".into(),
            subcategory: "female".into(),
            target_count: 3,
            relevance_threshold: 0.85,
        }];
        let mut stats = RunStats::new("test-run".into(), Bounds { min: 3, max: 5 }, &targets);
        let outcome = KeywordOutcome::empty(targets.first().expect("target"));
        stats.record(&outcome);
        stats.finish();

        RunReport {
            stats,
            targets,
            keywords: vec![outcome],
            store: StoreStats::default(),
        }
    }

    #[tokio::test]
    async fn writes_named_json_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = report();

        let path = report
            .write_json(&dir.path().join("reports"))
            .await
            .expect("write report");

        assert!(path.ends_with("collection_report_test-run.json"));
        let raw = tokio::fs::read_to_string(&path).await.expect("read report");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["stats"]["run_id"], "test-run");
        assert_eq!(value["stats"]["size_buckets"]["under_10kb"], 0);
        assert_eq!(value["keywords"][0]["keyword"], "anime girl");
        assert!(value["keywords"][0].get("records").is_none());
    }

    #[test]
    fn summary_mentions_shortfall() {
        let summary = report().render_summary();
        assert!(summary.contains("Persisted 0 of 3 planned"));
        assert!(summary.contains("Below the global minimum"));
        assert!(summary.contains("anime: 0/3"));
    }
}
