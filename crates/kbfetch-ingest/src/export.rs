//! Metadata CSV export

use crate::error::Result;
use kbfetch_common::types::PackageMetadata;
use std::io::Write;
use std::path::Path;

pub const METADATA_HEADER: [&str; 8] = [
    "KB",
    "Title",
    "PackageTitle",
    "Architecture",
    "Filename",
    "Language",
    "Filesize(bytes)",
    "Packagelink",
];

/// Packages discovered for one catalog key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbMetadata {
    pub kbno: i64,
    /// Catalog title of the update itself; the scraper does not populate it
    pub title: String,
    pub packages: Vec<PackageMetadata>,
}

impl KbMetadata {
    pub fn new(kbno: i64, packages: Vec<PackageMetadata>) -> Self {
        Self {
            kbno,
            title: String::new(),
            packages,
        }
    }
}

/// Write one row per package
pub fn write_metadata_csv<W: Write>(writer: W, records: &[KbMetadata]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(METADATA_HEADER)?;

    for kb in records {
        let kbno = kb.kbno.to_string();
        for package in &kb.packages {
            let size = package.size_bytes.to_string();
            csv.write_record([
                kbno.as_str(),
                kb.title.as_str(),
                package.title.as_str(),
                package.architecture.as_str(),
                package.filename.as_str(),
                package.language.as_str(),
                size.as_str(),
                package.download_url.as_str(),
            ])?;
        }
    }

    csv.flush()?;
    Ok(())
}

pub fn export_metadata_file(path: &Path, records: &[KbMetadata]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_metadata_csv(std::io::BufWriter::new(file), records)
}
