//! Artifacts produced along the pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::event::Recipient;

/// Attachment downloaded from the chat platform
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub bytes: Bytes,
    pub content_type: String,
    /// Platform file id the bytes came from
    pub source_id: String,
}

/// Clockwise rotation applied to make a page upright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Candidates in tie-break order
    pub const ALL: [Rotation; 4] = [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270];

    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// Upright, illumination-normalized page
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// PNG bytes
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub rotation: Rotation,
    pub shadow_removed: bool,
}

/// One extracted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Schema column name
    pub name: String,
    pub value: String,
    /// Provider confidence in [0, 1]
    pub confidence: f32,
}

/// One record group; becomes one CSV row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub fields: Vec<Field>,
}

impl Record {
    pub fn value(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == column)
            .map(|f| f.value.as_str())
    }
}

/// Normalized extraction result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    /// Column order, fixed by the extraction schema
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    /// Accepted form title, when the schema reads a header
    pub title: Option<String>,
    /// Header values, named by entity type
    pub header: Record,
    /// Some record lacked a value or paired ambiguously
    pub needs_review: bool,
    /// Reference to the provider response (processor and response digest)
    pub raw_payload_ref: String,
}

/// CSV bytes plus SHA-256 hex checksum
#[derive(Debug, Clone, PartialEq)]
pub struct CsvArtifact {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub rows: usize,
}

/// Outcome at one sink
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub sink: String,
    pub key: String,
    pub success: bool,
    /// Puts issued, including local retries
    pub attempts: u32,
    pub error: Option<String>,
}

/// Terminal outcome reported to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Failure,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Success => "success",
            TerminalStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(TerminalStatus::Success),
            "failure" => Some(TerminalStatus::Failure),
            _ => None,
        }
    }
}

/// Message delivered to the originating user
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub recipient: Recipient,
    pub status: TerminalStatus,
    /// Safe to display; never carries internal error text
    pub text: String,
}
