use serde::{Deserialize, Serialize};

use crate::search::RawCandidate;

/// A search result under consideration for one keyword. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source_url: String,
    pub alt_text: String,
    pub search_term: String,
    pub category: String,
    pub subcategory: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Candidate {
    pub fn from_raw(raw: RawCandidate, target: &KeywordTarget) -> Self {
        let search_term = if raw.search_term.trim().is_empty() {
            target.keyword.clone()
        } else {
            raw.search_term
        };

        Self {
            source_url: raw.url.trim().to_string(),
            alt_text: raw.alt_text,
            search_term,
            category: target.category.clone(),
            subcategory: target.subcategory.clone(),
            width: raw.width,
            height: raw.height,
        }
    }

    /// Last path segment of the source URL, without query or fragment.
    pub fn file_name(&self) -> &str {
        let without_query = self
            .source_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        without_query
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// A candidate together with the scorer's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub relevance_score: f32,
    pub accepted: bool,
    /// Name of the veto rule that rejected the candidate, if any.
    pub vetoed_by: Option<&'static str>,
}

/// How many images one keyword should contribute, and under which labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordTarget {
    pub keyword: String,
    pub category: String,
    pub subcategory: String,
    pub target_count: usize,
    pub relevance_threshold: f32,
}
