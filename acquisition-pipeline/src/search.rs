use std::path::PathBuf;

use async_trait::async_trait;
use common::{error::AppError, utils::text::sanitize_segment};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One search result as produced by the browser layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub url: String,
    #[serde(default, alias = "altText")]
    pub alt_text: String,
    #[serde(default, alias = "searchTerm")]
    pub search_term: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Source of candidate images for a search term. Each call returns a finite list.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, term: &str) -> Result<Vec<RawCandidate>, AppError>;
}

/// Reads candidates from `<dir>/<sanitized term>.json` manifests written by the
/// browser layer. A term without a manifest has no candidates.
pub struct ManifestSearchProvider {
    dir: PathBuf,
}

impl ManifestSearchProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn manifest_path(&self, term: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_segment(term)))
    }
}

#[async_trait]
impl SearchProvider for ManifestSearchProvider {
    async fn search(&self, term: &str) -> Result<Vec<RawCandidate>, AppError> {
        let path = self.manifest_path(term);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(term, path = %path.display(), "no manifest for search term");
                return Ok(Vec::new());
            }
            Err(err) => return Err(AppError::Io(err)),
        };

        let mut candidates: Vec<RawCandidate> = serde_json::from_slice(&raw)?;
        for candidate in &mut candidates {
            if candidate.search_term.trim().is_empty() {
                candidate.search_term = term.to_string();
            }
        }
        candidates.retain(|c| !c.url.trim().is_empty());

        debug!(term, candidates = candidates.len(), "loaded search manifest");
        Ok(candidates)
    }
}
