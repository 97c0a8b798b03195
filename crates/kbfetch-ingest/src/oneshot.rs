//! One-shot mode: discover a list of catalog keys, export their metadata,
//! and optionally download every package into one directory.

use crate::catalog::CatalogClient;
use crate::concurrency::ConcurrencyController;
use crate::download::{target_path, PackageFetcher};
use crate::error::{IngestError, Result};
use crate::export::{export_metadata_file, KbMetadata};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use kbfetch_common::types::PackageMetadata;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct OneShotOptions {
    pub kbnos: Vec<i64>,
    pub metadata_only: bool,
    pub output_dir: PathBuf,
    pub metadata_file: PathBuf,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OneShotReport {
    pub failed_keys: Vec<i64>,
    pub packages: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Discover every key, bounded by `gate`, preserving input order.
/// Keys whose discovery fails are reported and left out.
pub async fn discover_all(
    catalog: &dyn CatalogClient,
    gate: &ConcurrencyController,
    kbnos: &[i64],
) -> (Vec<KbMetadata>, Vec<i64>) {
    let outcomes: Vec<(i64, Result<Vec<PackageMetadata>>)> = stream::iter(kbnos.iter().copied())
        .map(|kbno| async move {
            let result = gate.gated(catalog.discover(kbno)).await.and_then(|r| r);
            (kbno, result)
        })
        .buffered(gate.capacity())
        .collect()
        .await;

    let mut discovered = Vec::new();
    let mut failed = Vec::new();
    for (kbno, result) in outcomes {
        match result {
            Ok(packages) => {
                info!(kbno, packages = packages.len(), "Discovered catalog key");
                discovered.push(KbMetadata::new(kbno, packages));
            },
            Err(e) => {
                error!(kbno, error = %e, "Catalog discovery failed");
                failed.push(kbno);
            },
        }
    }
    (discovered, failed)
}

pub async fn run(
    catalog: &dyn CatalogClient,
    fetcher: &dyn PackageFetcher,
    gate: &ConcurrencyController,
    options: &OneShotOptions,
) -> Result<OneShotReport> {
    info!(keys = ?options.kbnos, "Starting one-shot run");

    let (records, failed_keys) = discover_all(catalog, gate, &options.kbnos).await;
    export_metadata_file(&options.metadata_file, &records)?;
    info!(path = %options.metadata_file.display(), "Exported metadata");

    let mut report = OneShotReport {
        failed_keys,
        packages: records.iter().map(|r| r.packages.len()).sum(),
        ..OneShotReport::default()
    };
    if options.metadata_only {
        return Ok(report);
    }

    tokio::fs::create_dir_all(&options.output_dir).await?;

    // Several packages of one key can name the same file; the first claim wins.
    let mut claimed = HashSet::new();
    let mut jobs = Vec::new();
    for package in records.iter().flat_map(|r| r.packages.iter()) {
        let Some(path) = target_path(&options.output_dir, &package.filename) else {
            warn!(filename = %package.filename, "Unsafe file name, skipping");
            report.failed += 1;
            continue;
        };
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !claimed.insert(package.filename.clone()) || exists {
            info!(filename = %package.filename, "File exists, skipping");
            report.skipped += 1;
            continue;
        }
        jobs.push((package, path));
    }

    let progress = progress_bar(jobs.len() as u64, options.show_progress)?;
    let outcomes: Vec<Result<u64>> = stream::iter(jobs)
        .map(|(package, path)| {
            let progress = progress.clone();
            async move {
                progress.set_message(package.filename.clone());
                let result = gate
                    .gated(fetcher.fetch(&package.download_url, &path))
                    .await
                    .and_then(|r| r);
                if let Err(e) = &result {
                    error!(filename = %package.filename, error = %e, "Download failed");
                }
                progress.inc(1);
                result
            }
        })
        .buffer_unordered(gate.capacity())
        .collect()
        .await;
    progress.finish_and_clear();

    for outcome in outcomes {
        match outcome {
            Ok(_) => report.downloaded += 1,
            Err(_) => report.failed += 1,
        }
    }

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        failed = report.failed,
        "One-shot run complete"
    );
    Ok(report)
}

fn progress_bar(len: u64, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .map_err(|e| IngestError::Parse(e.to_string()))?
            .progress_chars("#>-"),
    );
    Ok(bar)
}
