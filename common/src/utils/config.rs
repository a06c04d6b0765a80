use std::collections::HashSet;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, utils::text::sanitize_segment};

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_report_dir")]
    pub report_dir: Option<String>,
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "collector".to_string(),
            surrealdb_database: "images".to_string(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            report_dir: default_report_dir(),
            manifest_dir: default_manifest_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_report_dir() -> Option<String> {
    Some("./reports".to_string())
}

fn default_manifest_dir() -> String {
    "./manifests".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

/// Inclusive `[min, max]` range used for the global target and the quality band.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

/// How the normalizer walks the quality band when re-encoding.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum QualitySearch {
    #[default]
    Binary,
    Linear { step: u8 },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KeywordConfig {
    pub term: String,
    /// Subcategory label the keyword's images are filed under.
    #[serde(default)]
    pub sub_target: Option<String>,
    /// Overrides the run threshold as this keyword's scoring base.
    #[serde(default)]
    pub relevance_base: Option<f32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CategoryConfig {
    pub name: String,
    pub weight: f64,
    pub keywords: Vec<KeywordConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DownloadConfig {
    #[serde(default = "default_download_attempts")]
    pub attempts: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_referer")]
    pub referer: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            attempts: default_download_attempts(),
            timeout_secs: default_download_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_input_bytes: default_max_input_bytes(),
            user_agent: default_user_agent(),
            referer: default_referer(),
        }
    }
}

const fn default_download_attempts() -> usize {
    3
}

const fn default_download_timeout_secs() -> u64 {
    30
}

const fn default_retry_base_delay_ms() -> u64 {
    500
}

const fn default_max_input_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}

fn default_referer() -> String {
    "https://www.google.com/".to_string()
}

/// Run configuration for one collection pass.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CollectionConfig {
    pub global_target: Bounds<usize>,
    #[serde(default = "default_target_dimension")]
    pub target_width: u32,
    #[serde(default = "default_target_dimension")]
    pub target_height: u32,
    #[serde(default = "default_quality_band")]
    pub quality_band: Bounds<u8>,
    #[serde(default = "default_max_byte_size")]
    pub max_byte_size: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    #[serde(default)]
    pub per_keyword_cap: Option<usize>,
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,
    #[serde(default = "default_keyword_delay_ms")]
    pub keyword_delay_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default)]
    pub quality_search: QualitySearch,
    #[serde(default)]
    pub download: DownloadConfig,
    pub categories: Vec<CategoryConfig>,
}

pub const MAX_WORKER_CONCURRENCY: usize = 4;

const fn default_target_dimension() -> u32 {
    512
}

const fn default_quality_band() -> Bounds<u8> {
    Bounds { min: 60, max: 90 }
}

const fn default_max_byte_size() -> usize {
    50 * 1024
}

const fn default_relevance_threshold() -> f32 {
    0.85
}

const fn default_download_delay_ms() -> u64 {
    1_000
}

const fn default_keyword_delay_ms() -> u64 {
    3_000
}

const fn default_worker_concurrency() -> usize {
    2
}

impl CollectionConfig {
    /// Loads a run configuration file (TOML, YAML or JSON by extension) with
    /// `COLLECT__*` environment overrides.
    pub fn load(path: &str) -> Result<Self, AppError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("COLLECT").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Checks every option that would make the run meaningless. Called before any
    /// network or store activity.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.global_target.min >= self.global_target.max {
            return Err(config_error(format!(
                "global_target.min ({}) must be lower than global_target.max ({})",
                self.global_target.min, self.global_target.max
            )));
        }

        if self.target_width == 0 || self.target_height == 0 {
            return Err(config_error("target dimensions must be non-zero"));
        }

        let band = self.quality_band;
        if band.min == 0 || band.max > 100 {
            return Err(config_error("quality_band must lie within 1..=100"));
        }
        if band.min >= band.max {
            return Err(config_error(format!(
                "quality_band.min ({}) must be lower than quality_band.max ({})",
                band.min, band.max
            )));
        }

        if let QualitySearch::Linear { step } = self.quality_search {
            if step == 0 {
                return Err(config_error("linear quality_search step must be non-zero"));
            }
        }

        if self.max_byte_size == 0 {
            return Err(config_error("max_byte_size must be non-zero"));
        }

        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(config_error("relevance_threshold must lie within [0, 1]"));
        }

        if self.worker_concurrency == 0 || self.worker_concurrency > MAX_WORKER_CONCURRENCY {
            return Err(config_error(format!(
                "worker_concurrency must lie within 1..={MAX_WORKER_CONCURRENCY}"
            )));
        }

        if self.download.attempts == 0 {
            return Err(config_error("download.attempts must be at least 1"));
        }

        if self.categories.is_empty() {
            return Err(config_error("at least one category is required"));
        }

        let mut file_stems = HashSet::new();
        for category in &self.categories {
            if !category.weight.is_finite() || category.weight <= 0.0 {
                return Err(config_error(format!(
                    "category '{}' has invalid weight {}",
                    category.name, category.weight
                )));
            }
            if category.keywords.is_empty() {
                return Err(config_error(format!(
                    "category '{}' has no keywords",
                    category.name
                )));
            }
            for keyword in &category.keywords {
                if keyword.term.trim().is_empty() {
                    return Err(config_error(format!(
                        "category '{}' contains an empty keyword",
                        category.name
                    )));
                }
                // Keywords sharing a sanitized file stem would write to the same paths
                let stem = (
                    sanitize_segment(&category.name),
                    sanitize_segment(keyword.sub_target.as_deref().unwrap_or(&category.name)),
                    sanitize_segment(&keyword.term),
                );
                if !file_stems.insert(stem) {
                    return Err(config_error(format!(
                        "keyword '{}' in category '{}' collides with another keyword's file names",
                        keyword.term, category.name
                    )));
                }
                if let Some(base) = keyword.relevance_base {
                    if !(0.0..=1.0).contains(&base) {
                        return Err(config_error(format!(
                            "keyword '{}' relevance_base must lie within [0, 1]",
                            keyword.term
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> AppError {
    AppError::Configuration(message.into())
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    /// Small two-category configuration with pacing disabled.
    pub fn test_collection_config() -> CollectionConfig {
        CollectionConfig {
            global_target: Bounds { min: 100, max: 150 },
            target_width: 64,
            target_height: 64,
            quality_band: Bounds { min: 40, max: 90 },
            max_byte_size: 64 * 1024,
            relevance_threshold: 0.85,
            per_keyword_cap: None,
            download_delay_ms: 0,
            keyword_delay_ms: 0,
            worker_concurrency: 1,
            quality_search: QualitySearch::Binary,
            download: DownloadConfig::default(),
            categories: vec![
                CategoryConfig {
                    name: "anime".into(),
                    weight: 2.0,
                    keywords: vec![
                        KeywordConfig {
                            term: "anime girl".into(),
                            sub_target: Some("female".into()),
                            relevance_base: None,
                        },
                        KeywordConfig {
                            term: "anime boy".into(),
                            sub_target: Some("male".into()),
                            relevance_base: None,
                        },
                    ],
                },
                CategoryConfig {
                    name: "cartoon".into(),
                    weight: 1.0,
                    keywords: vec![
                        KeywordConfig {
                            term: "cartoon hero".into(),
                            sub_target: None,
                            relevance_base: None,
                        },
                        KeywordConfig {
                            term: "cartoon villain".into(),
                            sub_target: None,
                            relevance_base: Some(0.8),
                        },
                    ],
                },
            ],
        }
    }
}
