#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod dedup;
pub mod distributor;
pub mod fetcher;
pub mod normalizer;
pub mod orchestrator;
pub mod pacing;
pub mod report;
pub mod scoring;
pub mod search;
pub mod types;
pub mod utils;
pub mod worker;

pub use orchestrator::{CollectionOrchestrator, RunStats};
pub use report::RunReport;
pub use worker::{AcquisitionWorker, CollectorServices, KeywordOutcome};
