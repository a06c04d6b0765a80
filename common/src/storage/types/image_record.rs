use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StatusTransition {
    Start,
    Complete,
    Fail,
}

impl StatusTransition {
    fn as_str(&self) -> &'static str {
        match self {
            StatusTransition::Start => "start",
            StatusTransition::Complete => "complete",
            StatusTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: RecordLifecycleMachine,
        initial: Pending,
        states: [Pending, Processing, Completed, Failed],
        events {
            start {
                transition: { from: Pending, to: Processing }
                transition: { from: Failed, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Completed }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> RecordLifecycleMachine<(), Pending> {
        RecordLifecycleMachine::new(())
    }

    pub(super) fn processing() -> Option<RecordLifecycleMachine<(), Processing>> {
        pending().start().ok()
    }

    pub(super) fn failed() -> Option<RecordLifecycleMachine<(), Failed>> {
        processing()?.fail().ok()
    }
}

fn invalid_transition(status: ProcessingStatus, event: StatusTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid image record transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(
    status: ProcessingStatus,
    event: StatusTransition,
) -> Result<ProcessingStatus, AppError> {
    use lifecycle::{failed, pending, processing};
    let next = match (status, event) {
        (ProcessingStatus::Pending, StatusTransition::Start) => pending()
            .start()
            .ok()
            .map(|_| ProcessingStatus::Processing),
        (ProcessingStatus::Failed, StatusTransition::Start) => failed()
            .and_then(|machine| machine.start().ok())
            .map(|_| ProcessingStatus::Processing),
        (ProcessingStatus::Processing, StatusTransition::Complete) => processing()
            .and_then(|machine| machine.complete().ok())
            .map(|_| ProcessingStatus::Completed),
        (ProcessingStatus::Processing, StatusTransition::Fail) => processing()
            .and_then(|machine| machine.fail().ok())
            .map(|_| ProcessingStatus::Failed),
        _ => None,
    };

    next.ok_or_else(|| invalid_transition(status, event))
}

stored_object!(ImageRecord, "image_record", {
    source_url: String,
    alt_text: String,
    category: String,
    subcategory: String,
    search_term: String,
    local_path: String,
    byte_size: u64,
    width: u32,
    height: u32,
    encoding_quality: u8,
    relevance_score: f32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    collected_at: DateTime<Utc>,
    processing_status: ProcessingStatus,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    failure_reason: Option<String>
});

/// Everything about a normalized image that is known before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImageRecord {
    pub source_url: String,
    pub alt_text: String,
    pub category: String,
    pub subcategory: String,
    pub search_term: String,
    pub local_path: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub encoding_quality: u8,
    pub relevance_score: f32,
}

/// Upper bounds (exclusive) of the size histogram buckets, in bytes.
pub const SIZE_BUCKET_LIMITS: [(&str, u64); 3] = [
    ("under_10kb", 10 * 1024),
    ("under_25kb", 25 * 1024),
    ("under_50kb", 50 * 1024),
];
pub const OVERSIZE_BUCKET: &str = "over_50kb";

/// Counts of stored images per size bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SizeHistogram {
    pub under_10kb: u64,
    pub under_25kb: u64,
    pub under_50kb: u64,
    pub over_50kb: u64,
}

impl SizeHistogram {
    pub fn bucket_for(byte_size: u64) -> &'static str {
        SIZE_BUCKET_LIMITS
            .iter()
            .find(|(_, limit)| byte_size < *limit)
            .map_or(OVERSIZE_BUCKET, |(name, _)| name)
    }

    pub fn add(&mut self, byte_size: u64) {
        let slot = match Self::bucket_for(byte_size) {
            "under_10kb" => &mut self.under_10kb,
            "under_25kb" => &mut self.under_25kb,
            "under_50kb" => &mut self.under_50kb,
            _ => &mut self.over_50kb,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn from_sizes(sizes: impl IntoIterator<Item = u64>) -> Self {
        let mut histogram = Self::default();
        for size in sizes {
            histogram.add(size);
        }
        histogram
    }

    pub fn total(&self) -> u64 {
        self.under_10kb
            .saturating_add(self.under_25kb)
            .saturating_add(self.under_50kb)
            .saturating_add(self.over_50kb)
    }
}

/// Store-wide aggregates over every persisted image record.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub size_buckets: SizeHistogram,
}

#[derive(Debug, serde::Deserialize)]
struct CountResult {
    count: u64,
}

#[derive(Debug, serde::Deserialize)]
struct CategoryCount {
    category: String,
    count: u64,
}

#[derive(Debug, serde::Deserialize)]
struct StatusCount {
    processing_status: String,
    count: u64,
}

/// Record ids are the hex SHA-256 of the source URL, so a URL maps to exactly one id.
pub fn fingerprint(source_url: &str) -> String {
    format!("{:x}", Sha256::digest(source_url.trim().as_bytes()))
}

fn is_duplicate_error(error: &surrealdb::Error) -> bool {
    let message = error.to_string();
    message.contains("already exists") || message.contains("already contains")
}

impl ImageRecord {
    /// Builds a record for a freshly normalized image. It starts in `processing`:
    /// the bytes are not yet in object storage.
    pub fn new(fields: NewImageRecord) -> Self {
        let now = Utc::now();
        let source_url = fields.source_url.trim().to_string();

        Self {
            id: fingerprint(&source_url),
            created_at: now,
            updated_at: now,
            source_url,
            alt_text: fields.alt_text,
            category: fields.category,
            subcategory: fields.subcategory,
            search_term: fields.search_term,
            local_path: fields.local_path,
            byte_size: fields.byte_size,
            width: fields.width,
            height: fields.height,
            encoding_quality: fields.encoding_quality,
            relevance_score: fields.relevance_score,
            collected_at: now,
            processing_status: ProcessingStatus::Processing,
            processed_at: None,
            failure_reason: None,
        }
    }

    /// Whether the URL is already stored. Failed records do not count, so their
    /// URLs can be claimed again and retried through [`ImageRecord::retry_failed`].
    pub async fn exists_for_url(source_url: &str, db: &SurrealDbClient) -> Result<bool, AppError> {
        let result: Option<CountResult> = db
            .client
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE source_url = $url AND processing_status != 'failed' GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("url", source_url.trim().to_string()))
            .await?
            .take(0)?;

        Ok(result.is_some_and(|r| r.count > 0))
    }

    /// Inserts the record. A record for the same source URL already in the store
    /// yields [`AppError::Duplicate`].
    pub async fn insert(self, db: &SurrealDbClient) -> Result<String, AppError> {
        let id = self.id.clone();
        let source_url = self.source_url.clone();

        match db.store_item(self).await {
            Ok(_) => Ok(id),
            Err(err) if is_duplicate_error(&err) => {
                debug!(%source_url, "image record already stored");
                Err(AppError::Duplicate(source_url))
            }
            Err(err) => Err(AppError::from(err)),
        }
    }

    /// Inserts records one by one, skipping duplicates. Returns the ids that were stored.
    pub async fn batch_insert(
        records: Vec<ImageRecord>,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            match record.insert(db).await {
                Ok(id) => ids.push(id),
                Err(AppError::Duplicate(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(ids)
    }

    /// Highest file index among stored paths shaped `<stem><index>.<ext>`.
    /// Paths under a longer stem sharing the prefix are ignored.
    pub async fn max_file_index(stem: &str, db: &SurrealDbClient) -> Result<u64, AppError> {
        let paths: Vec<String> = db
            .client
            .query(
                "SELECT VALUE local_path FROM type::table($table)
                 WHERE string::starts_with(local_path, $stem)",
            )
            .bind(("table", Self::table_name()))
            .bind(("stem", stem.to_string()))
            .await?
            .take(0)?;

        Ok(paths
            .iter()
            .filter_map(|path| {
                let (index, _extension) = path.strip_prefix(stem)?.split_once('.')?;
                index.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0))
    }

    pub async fn count_by_status(
        status: ProcessingStatus,
        db: &SurrealDbClient,
    ) -> Result<u64, AppError> {
        let result: Option<CountResult> = db
            .client
            .query(
                "SELECT count() AS count FROM type::table($table) WHERE processing_status = $status GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("status", status.as_str()))
            .await?
            .take(0)?;

        Ok(result.map_or(0, |r| r.count))
    }

    pub async fn stats(db: &SurrealDbClient) -> Result<StoreStats, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT category, count() AS count FROM type::table($table) GROUP BY category;
                 SELECT processing_status, count() AS count FROM type::table($table) GROUP BY processing_status;
                 SELECT VALUE byte_size FROM type::table($table);",
            )
            .bind(("table", Self::table_name()))
            .await?;

        let categories: Vec<CategoryCount> = response.take(0)?;
        let statuses: Vec<StatusCount> = response.take(1)?;
        let sizes: Vec<u64> = response.take(2)?;

        let by_category: BTreeMap<String, u64> =
            categories.into_iter().map(|g| (g.category, g.count)).collect();
        let by_status: BTreeMap<String, u64> =
            statuses
            .into_iter()
            .map(|g| (g.processing_status, g.count))
            .collect();

        Ok(StoreStats {
            total: sizes.len() as u64,
            by_category,
            by_status,
            size_buckets: SizeHistogram::from_sizes(sizes),
        })
    }

    async fn apply_transition(
        &self,
        event: StatusTransition,
        failure_reason: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<ImageRecord, AppError> {
        let next = compute_next_status(self.processing_status, event)?;

        const TRANSITION_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET processing_status = $next,
                processed_at = $processed_at,
                failure_reason = $failure_reason,
                updated_at = $now
            WHERE processing_status = $current
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let processed_at = match next {
            ProcessingStatus::Completed | ProcessingStatus::Failed => {
                Some(SurrealDatetime::from(now))
            }
            ProcessingStatus::Pending | ProcessingStatus::Processing => None,
        };

        let mut result = db
            .client
            .query(TRANSITION_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("next", next.as_str()))
            .bind(("current", self.processing_status.as_str()))
            .bind(("processed_at", processed_at))
            .bind(("failure_reason", failure_reason))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<ImageRecord> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.processing_status, event))
    }

    pub async fn mark_completed(&self, db: &SurrealDbClient) -> Result<ImageRecord, AppError> {
        self.apply_transition(StatusTransition::Complete, None, db)
            .await
    }

    pub async fn mark_failed(
        &self,
        reason: String,
        db: &SurrealDbClient,
    ) -> Result<ImageRecord, AppError> {
        self.apply_transition(StatusTransition::Fail, Some(reason), db)
            .await
    }

    /// Moves a pending or failed record back into processing for another attempt.
    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<ImageRecord, AppError> {
        self.apply_transition(StatusTransition::Start, None, db)
            .await
    }

    /// Replaces a failed record's attempt details with this one's and moves it
    /// back into processing. `None` when the stored record is not failed.
    pub async fn retry_failed(&self, db: &SurrealDbClient) -> Result<Option<ImageRecord>, AppError> {
        let next = compute_next_status(ProcessingStatus::Failed, StatusTransition::Start)?;

        const RETRY_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET alt_text = $alt_text,
                category = $category,
                subcategory = $subcategory,
                search_term = $search_term,
                local_path = $local_path,
                byte_size = $byte_size,
                width = $width,
                height = $height,
                encoding_quality = $encoding_quality,
                relevance_score = $relevance_score,
                processing_status = $next,
                processed_at = NONE,
                failure_reason = NONE,
                updated_at = $now
            WHERE processing_status = $current
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(RETRY_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("alt_text", self.alt_text.clone()))
            .bind(("category", self.category.clone()))
            .bind(("subcategory", self.subcategory.clone()))
            .bind(("search_term", self.search_term.clone()))
            .bind(("local_path", self.local_path.clone()))
            .bind(("byte_size", self.byte_size))
            .bind(("width", self.width))
            .bind(("height", self.height))
            .bind(("encoding_quality", self.encoding_quality))
            .bind(("relevance_score", self.relevance_score))
            .bind(("next", next.as_str()))
            .bind(("current", ProcessingStatus::Failed.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let retried: Option<ImageRecord> = result.take(0)?;
        if retried.is_some() {
            debug!(source_url = %self.source_url, "retrying failed image record");
        }
        Ok(retried)
    }

    pub async fn get_by_status(
        status: ProcessingStatus,
        db: &SurrealDbClient,
    ) -> Result<Vec<ImageRecord>, AppError> {
        let records: Vec<ImageRecord> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE processing_status = $status
                 ORDER BY collected_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("status", status.as_str()))
            .await?
            .take(0)?;

        Ok(records)
    }
}
