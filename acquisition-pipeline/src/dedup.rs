use std::{collections::HashSet, sync::Arc};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::image_record::ImageRecord},
};
use tokio::sync::Mutex;
use tracing::trace;

/// Tracks which source URLs are already taken, either by a stored record or by
/// an earlier candidate of the current run.
pub struct Deduplicator {
    db: Arc<SurrealDbClient>,
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub async fn is_new(&self, url: &str) -> Result<bool, AppError> {
        let url = url.trim();
        if self.seen.lock().await.contains(url) {
            return Ok(false);
        }
        Ok(!ImageRecord::exists_for_url(url, &self.db).await?)
    }

    /// Marks the URL as taken for the rest of the run. Recording twice is a no-op.
    pub async fn record(&self, url: &str) {
        self.seen.lock().await.insert(url.trim().to_string());
    }

    /// Returns `true` and records the URL when nobody has taken it yet.
    ///
    /// The seen-set lock is held across the store lookup, so concurrent claims of
    /// the same URL resolve to exactly one winner.
    pub async fn claim(&self, url: &str) -> Result<bool, AppError> {
        let url = url.trim();
        let mut seen = self.seen.lock().await;
        if seen.contains(url) {
            trace!(%url, "url already claimed in this run");
            return Ok(false);
        }
        if ImageRecord::exists_for_url(url, &self.db).await? {
            trace!(%url, "url already stored");
            seen.insert(url.to_string());
            return Ok(false);
        }
        seen.insert(url.to_string());
        Ok(true)
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }
}
