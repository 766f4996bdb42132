//! Extracted records to CSV

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{CsvArtifact, ExtractedDocument};

/// Render a document as CSV: header row of schema columns, one row per
/// record group, CRLF line endings, quoting only where needed.
pub fn emit(document: &ExtractedDocument) -> Result<CsvArtifact> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());

    writer.write_record(&document.columns)?;
    for record in &document.records {
        writer.write_record(
            document
                .columns
                .iter()
                .map(|column| record.value(column).unwrap_or("")),
        )?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::internal(format!("Failed to flush CSV: {}", e)))?;

    Ok(CsvArtifact {
        checksum: checksum(&bytes),
        rows: document.records.len(),
        bytes,
    })
}

/// SHA-256 hex digest
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
