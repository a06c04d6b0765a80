mod args;

use std::{path::PathBuf, sync::Arc};

use acquisition_pipeline::{
    distributor::plan,
    fetcher::HttpImageFetcher,
    search::ManifestSearchProvider,
    CollectionOrchestrator, CollectorServices,
};
use anyhow::Context;
use clap::Parser;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager, types::image_record::ImageRecord},
    utils::config::{get_config, AppConfig, CollectionConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config_path = cli.config.to_string_lossy().into_owned();

    match cli.command {
        Command::Plan { json } => {
            let collection = CollectionConfig::load(&config_path)?;
            let targets = plan(&collection)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else {
                for target in &targets {
                    println!(
                        "{:<12} {:<12} {:<32} {:>5}  (base {:.2})",
                        target.category,
                        target.subcategory,
                        target.keyword,
                        target.target_count,
                        target.relevance_threshold
                    );
                }
                let planned: usize = targets.iter().map(|t| t.target_count).sum();
                println!(
                    "planned {planned} of {}..{}",
                    collection.global_target.min, collection.global_target.max
                );
            }
        }
        Command::Stats => {
            let config = get_config()?;
            let db = connect(&config).await?;
            let stats = ImageRecord::stats(&db).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Collect {
            manifest_dir,
            report_dir,
            json,
        } => {
            let config = get_config()?;
            let collection = CollectionConfig::load(&config_path)?;

            let db = Arc::new(connect(&config).await?);
            let storage = StorageManager::new(&config)
                .await
                .context("initializing image storage")?;

            let manifest_dir =
                manifest_dir.unwrap_or_else(|| PathBuf::from(&config.manifest_dir));
            let services = CollectorServices {
                search: Arc::new(ManifestSearchProvider::new(manifest_dir)),
                fetcher: Arc::new(HttpImageFetcher::new(collection.download.clone())?),
            };

            let mut orchestrator = CollectionOrchestrator::new(db, storage, services, collection);
            if let Some(dir) = report_dir.or_else(|| config.report_dir.as_ref().map(PathBuf::from)) {
                orchestrator = orchestrator.with_report_dir(dir);
            }

            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight downloads");
                    signal_token.cancel();
                }
            });

            let report = orchestrator.run(cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_summary());
            }
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> anyhow::Result<SurrealDbClient> {
    let db = SurrealDbClient::new(
        &config.surrealdb_address,
        &config.surrealdb_username,
        &config.surrealdb_password,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
    )
    .await
    .with_context(|| format!("connecting to {}", config.surrealdb_address))?;

    db.ensure_initialized().await?;
    info!(
        address = %config.surrealdb_address,
        namespace = %config.surrealdb_namespace,
        database = %config.surrealdb_database,
        "database ready"
    );

    Ok(db)
}
