mod state;
mod stats;

pub use stats::{CategoryStats, RunStats};

use std::{path::PathBuf, sync::Arc};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::image_record::{ImageRecord, ProcessingStatus},
    },
    utils::config::{CollectionConfig, MAX_WORKER_CONCURRENCY},
};
use futures::{stream, StreamExt};
use state_machines::core::GuardError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::state::initializing;
use crate::{
    distributor::targets_for,
    pacing::Pacer,
    report::RunReport,
    types::KeywordTarget,
    worker::{AcquisitionWorker, CollectorServices, KeywordOutcome},
};

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid collection run transition during {event}: {guard:?}"
    ))
}

/// Drives a whole collection run: validation, distribution, keyword workers and
/// the final report.
pub struct CollectionOrchestrator {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    services: CollectorServices,
    config: CollectionConfig,
    report_dir: Option<PathBuf>,
}

impl CollectionOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        services: CollectorServices,
        config: CollectionConfig,
    ) -> Self {
        Self {
            db,
            storage,
            services,
            config,
            report_dir: None,
        }
    }

    #[must_use]
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, AppError> {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let machine = initializing();
        if let Err(err) = self.config.validate() {
            let _failed = machine
                .reject()
                .map_err(|(_, guard)| map_guard_error("reject", &guard))?;
            error!(%run_id, error = %err, "collection run rejected");
            return Err(err);
        }
        let machine = machine
            .validate()
            .map_err(|(_, guard)| map_guard_error("validate", &guard))?;

        let targets = targets_for(&self.config)?;
        let machine = machine
            .distribute()
            .map_err(|(_, guard)| map_guard_error("distribute", &guard))?;

        let mut stats = RunStats::new(run_id.clone(), self.config.global_target, &targets);
        info!(
            %run_id,
            keywords = targets.len(),
            planned = stats.planned,
            min = self.config.global_target.min,
            max = self.config.global_target.max,
            "collection run started"
        );

        let keywords = self.collect(&targets, &cancel, &mut stats).await?;
        let machine = machine
            .collect()
            .map_err(|(_, guard)| map_guard_error("collect", &guard))?;

        let store = ImageRecord::stats(&self.db).await?;
        stats.finish();
        if stats.below_floor() {
            warn!(
                %run_id,
                persisted = stats.persisted,
                min = self.config.global_target.min,
                "collection run finished below the global minimum"
            );
        }

        let report = RunReport {
            stats,
            targets,
            keywords,
            store,
        };
        if let Some(dir) = &self.report_dir {
            report.write_json(dir).await?;
        }

        let _done = machine
            .report()
            .map_err(|(_, guard)| map_guard_error("report", &guard))?;
        info!(
            %run_id,
            persisted = report.stats.persisted,
            skipped = report.stats.keywords_skipped,
            "collection run finished"
        );

        Ok(report)
    }

    async fn collect(
        &self,
        targets: &[KeywordTarget],
        cancel: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<Vec<KeywordOutcome>, AppError> {
        let worker = AcquisitionWorker::new(
            Arc::clone(&self.db),
            self.storage.clone(),
            self.services.clone(),
            &self.config,
        );
        let keyword_pacer = Pacer::from_millis(self.config.keyword_delay_ms);
        let stop = cancel.child_token();
        let concurrency = self.config.worker_concurrency.clamp(1, MAX_WORKER_CONCURRENCY);

        let worker = &worker;
        let keyword_pacer = &keyword_pacer;
        let stop_ref = &stop;
        let mut results = stream::iter(targets)
            .map(move |target| async move {
                if stop_ref.is_cancelled() {
                    return None;
                }
                let slot = tokio::select! {
                    () = stop_ref.cancelled() => return None,
                    slot = keyword_pacer.wait() => slot,
                };
                let outcome = worker.run(target, stop_ref).await;
                drop(slot);
                Some(outcome)
            })
            .buffered(concurrency);

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut fatal = None;

        while let Some(result) = results.next().await {
            match result {
                None => stats.record_skipped(),
                Some(Ok(outcome)) => {
                    if outcome.cancelled && outcome.counters.candidates == 0 {
                        stats.record_skipped();
                    } else {
                        stats.record(&outcome);
                    }
                    outcomes.push(outcome);

                    if fatal.is_none() && !stats.ceiling_reached && self.ceiling_reached().await? {
                        stats.ceiling_reached = true;
                        info!(
                            max = self.config.global_target.max,
                            "global ceiling reached; skipping remaining keywords"
                        );
                        stop.cancel();
                    }
                }
                Some(Err(err)) => {
                    error!(error = %err, "keyword worker failed; stopping run");
                    stop.cancel();
                    fatal.get_or_insert(err);
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        stats.cancelled = cancel.is_cancelled();
        debug!(
            dedup_urls = worker.dedup().seen_count().await,
            "collection phase finished"
        );

        Ok(outcomes)
    }

    async fn ceiling_reached(&self) -> Result<bool, AppError> {
        let completed = ImageRecord::count_by_status(ProcessingStatus::Completed, &self.db).await?;
        let max = u64::try_from(self.config.global_target.max).unwrap_or(u64::MAX);
        Ok(completed >= max)
    }
}
