//! Update catalog discovery
//!
//! Turns a catalog key into the list of files that make up the update.
//! The production client scrapes the catalog website in three steps:
//!
//! 1. `GET {base}/Search.aspx?q={kbno}`: every `tbody > tr > td > a` whose
//!    `onclick` calls `goToDetails("<update id>")` is one package, titled by
//!    the link text.
//! 2. `POST {base}/DownloadDialog.aspx` with the update id: the dialog script
//!    assigns `downloadInformation[0].files[0].<field> = '<value>';`.
//! 3. `HEAD` on the download URL for the file size.
//!
//! A failed search page fails the whole key. A package whose dialog or size
//! lookup fails is skipped with a warning, so the result may be partial.

use crate::config::HttpConfig;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use kbfetch_common::types::PackageMetadata;
use regex::Regex;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Resolves a catalog key to package metadata
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn discover(&self, kbno: i64) -> Result<Vec<PackageMetadata>>;
}

/// A package link found on the search page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub update_id: String,
    pub title: String,
}

/// HTML and script extraction for the catalog pages
#[derive(Debug, Clone)]
pub struct CatalogParser {
    row_link: Selector,
    details_id: Regex,
    download_field: Regex,
}

impl CatalogParser {
    pub fn new() -> Result<Self> {
        let row_link = Selector::parse("tbody > tr > td > a")
            .map_err(|e| IngestError::Parse(format!("Invalid selector: {}", e)))?;
        let details_id = Regex::new(r#"goToDetails\(\s*"([^"]+)"\s*\)"#)
            .map_err(|e| IngestError::Parse(e.to_string()))?;
        let download_field =
            Regex::new(r"downloadInformation\[0\]\.files\[0\]\.(\w+)\s*=\s*'([^']*)';")
                .map_err(|e| IngestError::Parse(e.to_string()))?;

        Ok(Self {
            row_link,
            details_id,
            download_field,
        })
    }

    /// Package links on a search results page, in page order
    pub fn search_results(&self, html: &str) -> Vec<CatalogEntry> {
        let document = Html::parse_document(html);
        let mut entries = Vec::new();

        for element in document.select(&self.row_link) {
            let Some(onclick) = element.value().attr("onclick") else {
                continue;
            };
            let Some(captures) = self.details_id.captures(onclick) else {
                continue;
            };
            let title = element
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");

            entries.push(CatalogEntry {
                update_id: captures[1].to_string(),
                title,
            });
        }

        entries
    }

    /// `field -> value` pairs assigned to the first file of a download dialog
    pub fn download_fields(&self, body: &str) -> HashMap<String, String> {
        self.download_field
            .captures_iter(body)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect()
    }
}

/// Build metadata from dialog fields; `url` and `fileName` are required
pub fn metadata_from_fields(
    title: &str,
    fields: &HashMap<String, String>,
    size_bytes: i64,
) -> Option<PackageMetadata> {
    let download_url = fields.get("url").filter(|v| !v.is_empty())?;
    let filename = fields.get("fileName").filter(|v| !v.is_empty())?;

    Some(PackageMetadata {
        title: title.to_string(),
        download_url: download_url.clone(),
        architecture: fields.get("architectures").cloned().unwrap_or_default(),
        filename: filename.clone(),
        language: fields.get("longLanguages").cloned().unwrap_or_default(),
        size_bytes,
    })
}

/// Scraper for the public update catalog
pub struct UpdateCatalogClient {
    client: Client,
    base_url: String,
    parser: CatalogParser,
}

impl UpdateCatalogClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: config.catalog_base().to_string(),
            parser: CatalogParser::new()?,
        })
    }

    async fn search(&self, kbno: i64) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/Search.aspx?q={}", self.base_url, kbno);
        debug!(kbno, url = %url, "Fetching catalog search page");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let html = response.text().await?;
        Ok(self.parser.search_results(&html))
    }

    async fn resolve(&self, entry: &CatalogEntry) -> Result<PackageMetadata> {
        let url = format!("{}/DownloadDialog.aspx", self.base_url);
        let update_ids = serde_json::json!([{
            "size": 0,
            "languages": "",
            "uidInfo": entry.update_id,
            "updateID": entry.update_id,
        }])
        .to_string();

        let response = self
            .client
            .post(&url)
            .form(&[("updateIDs", update_ids.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IngestError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let body = response.text().await?;
        let fields = self.parser.download_fields(&body);

        let partial = metadata_from_fields(&entry.title, &fields, 0).ok_or_else(|| {
            IngestError::Parse(format!(
                "Download dialog for update {} has no url/fileName",
                entry.update_id
            ))
        })?;
        let size_bytes = self.content_length(&partial.download_url).await?;

        Ok(PackageMetadata {
            size_bytes,
            ..partial
        })
    }

    async fn content_length(&self, url: &str) -> Result<i64> {
        let response = self.client.head(url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        // Read the header directly: for HEAD responses the body length is 0.
        let header = response
            .headers()
            .get(CONTENT_LENGTH)
            .ok_or_else(|| IngestError::Parse(format!("No Content-Length for {}", url)))?;
        header
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| IngestError::Parse(format!("Bad Content-Length for {}", url)))
    }
}

#[async_trait]
impl CatalogClient for UpdateCatalogClient {
    async fn discover(&self, kbno: i64) -> Result<Vec<PackageMetadata>> {
        let entries = self.search(kbno).await.map_err(|e| IngestError::Catalog {
            kbno,
            message: e.to_string(),
        })?;
        info!(kbno, packages = entries.len(), "Catalog search complete");

        let mut packages = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.resolve(entry).await {
                Ok(metadata) => {
                    debug!(
                        kbno,
                        title = %metadata.title,
                        filename = %metadata.filename,
                        size_bytes = metadata.size_bytes,
                        "Resolved package"
                    );
                    packages.push(metadata);
                },
                Err(e) => {
                    warn!(kbno, update_id = %entry.update_id, error = %e, "Skipping package");
                },
            }
        }

        Ok(packages)
    }
}
