use std::sync::Arc;

use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::image_record::{ImageRecord, NewImageRecord},
    },
    utils::{config::CollectionConfig, text::sanitize_segment},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dedup::Deduplicator,
    fetcher::{FetchError, ImageFetcher},
    normalizer::{NormalizeError, NormalizeSpec, Normalizer, OUTPUT_EXTENSION},
    pacing::Pacer,
    scoring::RelevanceScorer,
    search::SearchProvider,
    types::{Candidate, KeywordTarget, ScoredCandidate},
};

/// External collaborators the worker talks to.
#[derive(Clone)]
pub struct CollectorServices {
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn ImageFetcher>,
}

/// Per-keyword tallies. Every candidate ends up in exactly one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeywordCounters {
    pub candidates: usize,
    pub persisted: usize,
    pub rejected: usize,
    pub vetoed: usize,
    pub duplicates: usize,
    pub download_failures: usize,
    pub unreadable: usize,
    pub size_floor_exceeded: usize,
    pub storage_failures: usize,
    pub search_failures: usize,
}

#[derive(Debug, Clone, Copy)]
enum CandidateEvent {
    Persisted,
    Rejected,
    Vetoed,
    Duplicate,
    DownloadFailed,
    Unreadable,
    SizeFloorExceeded,
    StorageFailed,
}

impl KeywordCounters {
    fn bump(&mut self, event: CandidateEvent) {
        let slot = match event {
            CandidateEvent::Persisted => &mut self.persisted,
            CandidateEvent::Rejected => &mut self.rejected,
            CandidateEvent::Vetoed => &mut self.vetoed,
            CandidateEvent::Duplicate => &mut self.duplicates,
            CandidateEvent::DownloadFailed => &mut self.download_failures,
            CandidateEvent::Unreadable => &mut self.unreadable,
            CandidateEvent::SizeFloorExceeded => &mut self.size_floor_exceeded,
            CandidateEvent::StorageFailed => &mut self.storage_failures,
        };
        *slot = slot.saturating_add(1);
    }

    /// Adds `other` into `self`.
    pub fn absorb(&mut self, other: &KeywordCounters) {
        self.candidates = self.candidates.saturating_add(other.candidates);
        self.persisted = self.persisted.saturating_add(other.persisted);
        self.rejected = self.rejected.saturating_add(other.rejected);
        self.vetoed = self.vetoed.saturating_add(other.vetoed);
        self.duplicates = self.duplicates.saturating_add(other.duplicates);
        self.download_failures = self.download_failures.saturating_add(other.download_failures);
        self.unreadable = self.unreadable.saturating_add(other.unreadable);
        self.size_floor_exceeded = self
            .size_floor_exceeded
            .saturating_add(other.size_floor_exceeded);
        self.storage_failures = self.storage_failures.saturating_add(other.storage_failures);
        self.search_failures = self.search_failures.saturating_add(other.search_failures);
    }
}

/// What one keyword produced.
#[derive(Debug, Clone, Serialize)]
pub struct KeywordOutcome {
    pub keyword: String,
    pub category: String,
    pub subcategory: String,
    pub target_count: usize,
    pub counters: KeywordCounters,
    pub search_error: Option<String>,
    /// The stop token fired before the keyword reached its target.
    pub cancelled: bool,
    #[serde(skip)]
    pub records: Vec<ImageRecord>,
}

impl KeywordOutcome {
    pub fn empty(target: &KeywordTarget) -> Self {
        Self {
            keyword: target.keyword.clone(),
            category: target.category.clone(),
            subcategory: target.subcategory.clone(),
            target_count: target.target_count,
            counters: KeywordCounters::default(),
            search_error: None,
            cancelled: false,
            records: Vec::new(),
        }
    }

    pub fn persisted(&self) -> usize {
        self.records.len()
    }

    pub fn reached_target(&self) -> bool {
        self.persisted() >= self.target_count
    }
}

enum CandidateError {
    Fetch(FetchError),
    Normalize(NormalizeError),
    Storage(String),
    Cancelled,
    Fatal(AppError),
}

/// Storage key prefix shared by every image of a keyword, up to the index.
pub fn image_stem(target: &KeywordTarget) -> String {
    format!(
        "{}/{}/{}_",
        sanitize_segment(&target.category),
        sanitize_segment(&target.subcategory),
        sanitize_segment(&target.keyword),
    )
}

/// Relative storage key for the `index`-th image of a keyword.
pub fn image_location(target: &KeywordTarget, index: u64) -> String {
    format!("{}{index}.{OUTPUT_EXTENSION}", image_stem(target))
}

/// Turns one keyword's search results into stored, normalized images.
pub struct AcquisitionWorker {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    services: CollectorServices,
    dedup: Deduplicator,
    scorer: RelevanceScorer,
    normalizer: Normalizer,
    download_pacer: Pacer,
}

impl AcquisitionWorker {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        services: CollectorServices,
        config: &CollectionConfig,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(Arc::clone(&db)),
            db,
            storage,
            services,
            scorer: RelevanceScorer::new(config.relevance_threshold),
            normalizer: Normalizer::new(NormalizeSpec::from_config(config)),
            download_pacer: Pacer::from_millis(config.download_delay_ms),
        }
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    #[tracing::instrument(
        skip_all,
        fields(keyword = %target.keyword, category = %target.category, quota = target.target_count)
    )]
    pub async fn run(
        &self,
        target: &KeywordTarget,
        stop: &CancellationToken,
    ) -> Result<KeywordOutcome, AppError> {
        let mut outcome = KeywordOutcome::empty(target);
        if stop.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        if target.target_count == 0 {
            debug!("keyword has no quota");
            return Ok(outcome);
        }

        let raw_candidates = match self.services.search.search(&target.keyword).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(keyword = %target.keyword, error = %err, "search failed; skipping keyword");
                outcome.counters.search_failures = 1;
                outcome.search_error = Some(err.to_string());
                return Ok(outcome);
            }
        };
        outcome.counters.candidates = raw_candidates.len();

        let mut last_index = ImageRecord::max_file_index(&image_stem(target), &self.db).await?;

        for raw in raw_candidates {
            if outcome.reached_target() {
                break;
            }
            if stop.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let candidate = Candidate::from_raw(raw, target);
            let scored = self.scorer.score(&candidate, target);
            if !scored.accepted {
                let event = if scored.vetoed_by.is_some() {
                    CandidateEvent::Vetoed
                } else {
                    CandidateEvent::Rejected
                };
                debug!(
                    url = %candidate.source_url,
                    score = scored.relevance_score,
                    veto = scored.vetoed_by,
                    "candidate rejected"
                );
                outcome.counters.bump(event);
                continue;
            }

            if !self.dedup.claim(&candidate.source_url).await? {
                debug!(url = %candidate.source_url, "duplicate candidate skipped");
                outcome.counters.bump(CandidateEvent::Duplicate);
                continue;
            }

            let index = last_index.saturating_add(1);
            match self.acquire(&scored, target, index, stop).await {
                Ok(Some(record)) => {
                    last_index = index;
                    outcome.counters.bump(CandidateEvent::Persisted);
                    outcome.records.push(record);
                }
                Ok(None) => outcome.counters.bump(CandidateEvent::Duplicate),
                Err(CandidateError::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(CandidateError::Fatal(err)) => return Err(err),
                Err(failure) => {
                    let (event, reason) = match failure {
                        CandidateError::Fetch(err) => (CandidateEvent::DownloadFailed, err.to_string()),
                        CandidateError::Normalize(err @ NormalizeError::SizeFloorExceeded { .. }) => {
                            (CandidateEvent::SizeFloorExceeded, err.to_string())
                        }
                        CandidateError::Normalize(err) => (CandidateEvent::Unreadable, err.to_string()),
                        CandidateError::Storage(reason) => {
                            // The failed record may hold this path; never hand it out again
                            last_index = index;
                            (CandidateEvent::StorageFailed, reason)
                        }
                        CandidateError::Cancelled | CandidateError::Fatal(_) => continue,
                    };
                    warn!(
                        keyword = %target.keyword,
                        url = %candidate.source_url,
                        error = %reason,
                        "candidate skipped"
                    );
                    outcome.counters.bump(event);
                }
            }
        }

        info!(
            keyword = %target.keyword,
            persisted = outcome.persisted(),
            quota = target.target_count,
            candidates = outcome.counters.candidates,
            cancelled = outcome.cancelled,
            "keyword finished"
        );

        Ok(outcome)
    }

    /// Downloads, normalizes and stores one accepted candidate. `Ok(None)` means
    /// the store already had a record for the URL.
    async fn acquire(
        &self,
        scored: &ScoredCandidate,
        target: &KeywordTarget,
        index: u64,
        stop: &CancellationToken,
    ) -> Result<Option<ImageRecord>, CandidateError> {
        let candidate = &scored.candidate;

        let slot = tokio::select! {
            () = stop.cancelled() => return Err(CandidateError::Cancelled),
            slot = self.download_pacer.wait() => slot,
        };
        let fetched = self.services.fetcher.fetch(&candidate.source_url).await;
        drop(slot);
        let raw = fetched.map_err(CandidateError::Fetch)?;

        let normalized = self
            .normalizer
            .normalize(raw)
            .await
            .map_err(CandidateError::Normalize)?;

        let local_path = image_location(target, index);
        let record = ImageRecord::new(NewImageRecord {
            source_url: candidate.source_url.clone(),
            alt_text: candidate.alt_text.clone(),
            category: target.category.clone(),
            subcategory: target.subcategory.clone(),
            search_term: target.keyword.clone(),
            local_path: local_path.clone(),
            byte_size: normalized.bytes.len() as u64,
            width: normalized.width,
            height: normalized.height,
            encoding_quality: normalized.quality,
            relevance_score: scored.relevance_score,
        });

        let inserted = match record.clone().insert(&self.db).await {
            Ok(_) => Ok(true),
            // A failed earlier attempt for the same URL is taken over
            Err(AppError::Duplicate(_)) => record.retry_failed(&self.db).await.map(|r| r.is_some()),
            Err(err) => Err(err),
        };
        match inserted {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(err) if err.is_fatal() => return Err(CandidateError::Fatal(err)),
            Err(err) => return Err(CandidateError::Storage(err.to_string())),
        }

        if let Err(err) = self
            .storage
            .put(&local_path, Bytes::from(normalized.bytes))
            .await
        {
            let reason = err.to_string();
            record
                .mark_failed(reason.clone(), &self.db)
                .await
                .map_err(CandidateError::Fatal)?;
            return Err(CandidateError::Storage(reason));
        }

        let completed = record
            .mark_completed(&self.db)
            .await
            .map_err(CandidateError::Fatal)?;

        debug!(
            url = %candidate.source_url,
            path = %local_path,
            bytes = completed.byte_size,
            quality = completed.encoding_quality,
            "image stored"
        );

        Ok(Some(completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::RawCandidate;
    use async_trait::async_trait;
    use common::{
        storage::types::image_record::ProcessingStatus,
        utils::config::testing::test_collection_config,
    };
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::{collections::HashMap, io::Cursor, sync::Mutex};
    use uuid::Uuid;

    fn png(width: u32, height: u32) -> Bytes {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .expect("png");
        Bytes::from(buffer)
    }

    struct StaticSearch {
        results: HashMap<String, Vec<RawCandidate>>,
    }

    #[async_trait]
    impl SearchProvider for StaticSearch {
        async fn search(&self, term: &str) -> Result<Vec<RawCandidate>, AppError> {
            self.results
                .get(term)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("no results for {term}")))
        }
    }

    struct MapFetcher {
        bodies: HashMap<String, Bytes>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.calls.lock().expect("calls lock").push(url.to_string());
            self.bodies.get(url).cloned().ok_or(FetchError::Status(404))
        }
    }

    fn raw(url: &str, alt: &str) -> RawCandidate {
        RawCandidate {
            url: url.into(),
            alt_text: alt.into(),
            search_term: "anime girl".into(),
            width: None,
            height: None,
        }
    }

    fn target(count: usize) -> KeywordTarget {
        KeywordTarget {
            keyword: "anime girl".into(),
            category: "anime".into(),
            subcategory: "female".into(),
            target_count: count,
            relevance_threshold: 0.85,
        }
    }

    async fn worker(
        candidates: Vec<RawCandidate>,
        bodies: Vec<(&str, Bytes)>,
    ) -> (AcquisitionWorker, Arc<MapFetcher>, Arc<SurrealDbClient>, StorageManager) {
        worker_with(test_collection_config(), candidates, bodies).await
    }

    async fn worker_with(
        config: CollectionConfig,
        candidates: Vec<RawCandidate>,
        bodies: Vec<(&str, Bytes)>,
    ) -> (AcquisitionWorker, Arc<MapFetcher>, Arc<SurrealDbClient>, StorageManager) {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        let db = Arc::new(db);
        let storage = StorageManager::in_memory();

        let fetcher = Arc::new(MapFetcher {
            bodies: bodies.into_iter().map(|(u, b)| (u.to_string(), b)).collect(),
            calls: Mutex::new(Vec::new()),
        });
        let services = CollectorServices {
            search: Arc::new(StaticSearch {
                results: HashMap::from([("anime girl".to_string(), candidates)]),
            }),
            fetcher: Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
        };

        let worker = AcquisitionWorker::new(
            Arc::clone(&db),
            storage.clone(),
            services,
            &config,
        );
        (worker, fetcher, db, storage)
    }

    fn stored_record(url: &str, search_term: &str, local_path: &str) -> ImageRecord {
        ImageRecord::new(NewImageRecord {
            source_url: url.into(),
            alt_text: String::new(),
            category: "anime".into(),
            subcategory: "female".into(),
            search_term: search_term.into(),
            local_path: local_path.into(),
            byte_size: 1_000,
            width: 64,
            height: 64,
            encoding_quality: 80,
            relevance_score: 0.9,
        })
    }

    #[test]
    fn image_location_is_sanitized() {
        let mut t = target(1);
        t.subcategory = "Female / Adult".into();
        assert_eq!(image_location(&t, 7), "anime/female_adult/anime_girl_7.jpg");
    }

    #[tokio::test]
    async fn stores_accepted_candidates_until_target() {
        let (worker, fetcher, db, storage) = worker(
            vec![
                raw("https://img.example.com/1.png", "anime girl smiling"),
                raw("https://img.example.com/2.png", "anime girl pose"),
                raw("https://img.example.com/3.png", "anime girl waving"),
            ],
            vec![
                ("https://img.example.com/1.png", png(120, 90)),
                ("https://img.example.com/2.png", png(90, 120)),
                ("https://img.example.com/3.png", png(100, 100)),
            ],
        )
        .await;

        let outcome = worker
            .run(&target(2), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.persisted(), 2);
        assert_eq!(outcome.counters.persisted, 2);
        assert_eq!(fetcher.calls.lock().expect("calls").len(), 2);

        for (i, record) in outcome.records.iter().enumerate() {
            assert_eq!(record.processing_status, ProcessingStatus::Completed);
            assert_eq!((record.width, record.height), (64, 64));
            assert!(record.byte_size <= 64 * 1024);
            assert_eq!(record.local_path, format!("anime/female/anime_girl_{}.jpg", i + 1));
            assert!(storage.exists(&record.local_path).await.expect("exists"));
        }
        assert_eq!(
            ImageRecord::max_file_index("anime/female/anime_girl_", &db)
                .await
                .expect("index"),
            2
        );
    }

    #[tokio::test]
    async fn failures_and_rejections_do_not_stop_the_keyword() {
        let (worker, _, _, _) = worker(
            vec![
                raw("https://img.example.com/mannequin.png", "mannequin display outfit only"),
                raw("https://img.example.com/missing.png", "anime girl"),
                raw("https://img.example.com/garbage.png", "anime girl"),
                raw("https://img.example.com/ok.png", "anime girl"),
                raw("https://img.example.com/ok.png", "anime girl again"),
            ],
            vec![
                ("https://img.example.com/garbage.png", Bytes::from_static(b"not an image")),
                ("https://img.example.com/ok.png", png(80, 80)),
            ],
        )
        .await;

        let outcome = worker
            .run(&target(5), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.persisted(), 1);
        assert_eq!(outcome.counters.vetoed, 1);
        assert_eq!(outcome.counters.download_failures, 1);
        assert_eq!(outcome.counters.unreadable, 1);
        assert_eq!(outcome.counters.duplicates, 1);
        assert_eq!(outcome.counters.candidates, 5);
    }

    #[tokio::test]
    async fn file_index_continues_from_earlier_runs() {
        let (worker, _, _, _) = worker(
            vec![raw("https://img.example.com/first.png", "anime girl")],
            vec![
                ("https://img.example.com/first.png", png(64, 64)),
                ("https://img.example.com/second.png", png(64, 64)),
            ],
        )
        .await;
        worker
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("first run");

        // Second keyword pass against the same store, new search results
        let second = AcquisitionWorker {
            services: CollectorServices {
                search: Arc::new(StaticSearch {
                    results: HashMap::from([(
                        "anime girl".to_string(),
                        vec![raw("https://img.example.com/second.png", "anime girl")],
                    )]),
                }),
                fetcher: Arc::clone(&worker.services.fetcher),
            },
            dedup: Deduplicator::new(Arc::clone(&worker.db)),
            db: Arc::clone(&worker.db),
            storage: worker.storage.clone(),
            scorer: worker.scorer,
            normalizer: worker.normalizer.clone(),
            download_pacer: Pacer::from_millis(0),
        };
        let outcome = second
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("second run");

        let record = outcome.records.first().expect("record");
        assert_eq!(record.local_path, "anime/female/anime_girl_2.jpg");
    }

    #[tokio::test]
    async fn differently_spelled_keyword_never_reuses_a_path() {
        let (worker, _, db, _) = worker(
            vec![raw("https://img.example.com/new.png", "anime girl")],
            vec![("https://img.example.com/new.png", png(64, 64))],
        )
        .await;
        let earlier = stored_record(
            "https://img.example.com/old.png",
            "Anime-Girl",
            "anime/female/anime_girl_1.jpg",
        );
        earlier.clone().insert(&db).await.expect("insert");
        earlier.mark_completed(&db).await.expect("complete");

        let outcome = worker
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("run");

        let record = outcome.records.first().expect("record");
        assert_eq!(record.local_path, "anime/female/anime_girl_2.jpg");
    }

    #[tokio::test]
    async fn occupied_path_is_a_storage_failure_and_the_next_index_is_used() {
        let (worker, _, _, storage) = worker(
            vec![
                raw("https://img.example.com/1.png", "anime girl"),
                raw("https://img.example.com/2.png", "anime girl"),
            ],
            vec![
                ("https://img.example.com/1.png", png(64, 64)),
                ("https://img.example.com/2.png", png(70, 70)),
            ],
        )
        .await;
        // Orphaned file without a record
        storage
            .put("anime/female/anime_girl_1.jpg", Bytes::from_static(b"orphan"))
            .await
            .expect("put");

        let outcome = worker
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.counters.storage_failures, 1);
        assert_eq!(outcome.persisted(), 1);
        let record = outcome.records.first().expect("record");
        assert_eq!(record.local_path, "anime/female/anime_girl_2.jpg");
        let orphan = storage
            .get("anime/female/anime_girl_1.jpg")
            .await
            .expect("orphan kept");
        assert_eq!(orphan.as_ref(), b"orphan");
    }

    #[tokio::test]
    async fn failed_url_from_an_earlier_run_is_retried() {
        let url = "https://img.example.com/retry.png";
        let (worker, _, db, _) = worker(vec![raw(url, "anime girl")], vec![(url, png(64, 64))]).await;
        let earlier = stored_record(url, "anime girl", "anime/female/anime_girl_1.jpg");
        earlier.clone().insert(&db).await.expect("insert");
        earlier
            .mark_failed("storage write failed".into(), &db)
            .await
            .expect("fail");

        let outcome = worker
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.persisted(), 1);
        assert_eq!(outcome.counters.duplicates, 0);
        let record = outcome.records.first().expect("record");
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert_eq!(record.local_path, "anime/female/anime_girl_2.jpg");
        assert!(record.failure_reason.is_none());
    }

    #[tokio::test]
    async fn size_floor_failures_have_their_own_counter() {
        let config = CollectionConfig {
            max_byte_size: 100,
            ..test_collection_config()
        };
        let (worker, _, _, storage) = worker_with(
            config,
            vec![raw("https://img.example.com/big.png", "anime girl")],
            vec![("https://img.example.com/big.png", png(80, 80))],
        )
        .await;

        let outcome = worker
            .run(&target(1), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.counters.size_floor_exceeded, 1);
        assert_eq!(outcome.counters.unreadable, 0);
        assert_eq!(outcome.persisted(), 0);
        assert!(!storage
            .exists("anime/female/anime_girl_1.jpg")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn search_failure_ends_only_this_keyword() {
        let (worker, fetcher, _, _) = worker(Vec::new(), Vec::new()).await;
        let mut other = target(3);
        other.keyword = "unknown term".into();

        let outcome = worker
            .run(&other, &CancellationToken::new())
            .await
            .expect("search failures are not fatal");

        assert_eq!(outcome.counters.search_failures, 1);
        assert!(outcome.search_error.is_some());
        assert!(fetcher.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_downloading() {
        let (worker, fetcher, _, _) = worker(
            vec![raw("https://img.example.com/1.png", "anime girl")],
            vec![("https://img.example.com/1.png", png(64, 64))],
        )
        .await;
        let token = CancellationToken::new();
        token.cancel();

        let outcome = worker.run(&target(1), &token).await.expect("run");

        assert!(outcome.cancelled);
        assert_eq!(outcome.persisted(), 0);
        assert!(fetcher.calls.lock().expect("calls").is_empty());
    }
}
