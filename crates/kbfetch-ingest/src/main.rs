//! kbfetch-ingest: one-shot catalog download tool

use anyhow::Result;
use clap::Parser;
use kbfetch_common::logging::{init_logging, LogConfig, LogLevel};
use kbfetch_ingest::oneshot::{self, OneShotOptions};
use kbfetch_ingest::{ConcurrencyController, HttpConfig, HttpFetcher, UpdateCatalogClient};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kbfetch-ingest")]
#[command(author, version, about = "Download update packages by KB number")]
struct Cli {
    /// KB numbers, comma separated
    #[arg(short = 'n', long = "kb", value_delimiter = ',', required = true, num_args = 1..)]
    kbnos: Vec<i64>,

    /// Maximum concurrent discoveries and downloads
    #[arg(short = 'c', long, default_value_t = 10,
          value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: u16,

    /// Only export metadata, do not download
    #[arg(long)]
    metadata_only: bool,

    /// Directory downloaded packages are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Metadata CSV path
    #[arg(long, default_value = "metadata.csv")]
    metadata_file: PathBuf,

    /// Catalog site root
    #[arg(long, env = "KBFETCH_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = kbfetch_ingest::config::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("kbfetch-ingest")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        },
    };

    // Runtime failures are reported, not turned into an exit status.
    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "One-shot run aborted");
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut http = HttpConfig {
        timeout_secs: cli.timeout,
        ..HttpConfig::default()
    };
    if let Some(url) = cli.catalog_url {
        http.catalog_base_url = url;
    }

    let catalog = UpdateCatalogClient::new(&http)?;
    let fetcher = HttpFetcher::new(http)?;
    let gate = ConcurrencyController::new(usize::from(cli.concurrency));

    let options = OneShotOptions {
        kbnos: cli.kbnos,
        metadata_only: cli.metadata_only,
        output_dir: cli.output,
        metadata_file: cli.metadata_file,
        show_progress: !cli.no_progress,
    };

    let report = oneshot::run(&catalog, &fetcher, &gate, &options).await?;
    info!(
        packages = report.packages,
        downloaded = report.downloaded,
        skipped = report.skipped,
        failed = report.failed,
        failed_keys = ?report.failed_keys,
        "Done"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_comma_separated_keys() {
        let cli = Cli::try_parse_from(["kbfetch-ingest", "-n", "4132216,4000000", "-c", "3"]).unwrap();
        assert_eq!(cli.kbnos, vec![4132216, 4000000]);
        assert_eq!(cli.concurrency, 3);
        assert!(!cli.metadata_only);
        assert_eq!(cli.metadata_file, PathBuf::from("metadata.csv"));
    }

    #[test]
    fn test_cli_requires_keys() {
        assert!(Cli::try_parse_from(["kbfetch-ingest"]).is_err());
        assert!(Cli::try_parse_from(["kbfetch-ingest", "-n", "abc"]).is_err());
        assert!(Cli::try_parse_from(["kbfetch-ingest", "-n", "1", "-c", "0"]).is_err());
    }
}
