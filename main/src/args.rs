use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "collector",
    about = "Collects, filters and normalizes labeled character images"
)]
pub struct Cli {
    /// Collection run configuration (TOML, YAML or JSON)
    #[arg(long, short, env = "COLLECT_CONFIG", default_value = "collection.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a collection pass and write the report
    Collect {
        /// Directory holding `<term>.json` candidate manifests
        #[arg(long)]
        manifest_dir: Option<PathBuf>,

        /// Where to write `collection_report_<run_id>.json`
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Print the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print per-keyword targets
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// Print aggregates over every stored image
    Stats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_collect_with_overrides() {
        let cli = Cli::parse_from([
            "collector",
            "--config",
            "runs/anime.toml",
            "collect",
            "--manifest-dir",
            "manifests",
            "--json",
        ]);

        assert_eq!(cli.config, PathBuf::from("runs/anime.toml"));
        match cli.command {
            Command::Collect {
                manifest_dir,
                report_dir,
                json,
            } => {
                assert_eq!(manifest_dir, Some(PathBuf::from("manifests")));
                assert!(report_dir.is_none());
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
