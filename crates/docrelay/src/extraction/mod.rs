//! Structured extraction
//!
//! [`DocumentExtractor`] sends a processed page to the extraction service,
//! retrying transient failures locally, and maps the provider response into
//! an [`ExtractedDocument`] through the strict adapter in [`normalize`].

pub mod normalize;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::processing::retry::RetryPolicy;
use crate::providers::ExtractionService;
use crate::types::{ExtractedDocument, ProcessedImage};

/// How a value is cleaned before it lands in the CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Line breaks folded into spaces, trimmed
    #[default]
    Text,
    /// Text with all whitespace removed
    Compact,
    /// Decimal digits only (full-width digits are converted)
    Digits,
}

/// How top-level entities are grouped into records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// All entities form one record (forms, single-value documents)
    Single,
    /// Entities on the same line form a record (itemized receipts)
    #[default]
    Rows,
}

/// One CSV column and the provider entity type that fills it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Header written to the CSV
    pub name: String,
    /// Provider entity `type`
    pub entity_type: String,
    #[serde(default)]
    pub kind: ValueKind,
}

impl ColumnSpec {
    pub fn new(name: &str, entity_type: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            kind,
        }
    }
}

/// Repair of a misread title.
///
/// Each entry of `require` and `exclude` is a set of characters. The rule
/// applies when every `require` set shares a character with the title and
/// no `exclude` set does; the title is then replaced by `keyword`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleRule {
    pub keyword: String,
    pub require: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TitleRule {
    fn matches(&self, title: &str) -> bool {
        let hit = |set: &String| set.chars().any(|c| title.contains(c));
        self.require.iter().all(hit) && !self.exclude.iter().any(hit)
    }
}

/// Document-level fields read once per page, outside the CSV rows.
///
/// The title names the kind of form. A page whose title is missing or not
/// one of `keywords` is rejected instead of converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderSpec {
    /// Entity type carrying the form title
    pub title_entity: String,
    /// Accepted titles
    pub keywords: Vec<String>,
    /// Applied in order before the keyword check; the first match wins
    #[serde(default)]
    pub title_rules: Vec<TitleRule>,
    /// Other entity types captured as-is, e.g. shop name and date
    #[serde(default)]
    pub fields: Vec<String>,
}

impl HeaderSpec {
    /// Fold line breaks and repair a misread title
    pub fn normalize_title(&self, raw: &str) -> String {
        let title: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        match self.title_rules.iter().find(|rule| rule.matches(&title)) {
            Some(rule) => {
                if rule.keyword != title {
                    tracing::info!(raw = %title, title = %rule.keyword, "Title repaired");
                }
                rule.keyword.clone()
            }
            None => title,
        }
    }

    pub fn is_keyword(&self, title: &str) -> bool {
        self.keywords.iter().any(|k| k == title)
    }
}

/// Column layout of the extracted data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub grouping: Grouping,
    /// Title gate and header capture; absent means every page is accepted
    #[serde(default)]
    pub header: Option<HeaderSpec>,
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self {
            columns: vec![
                ColumnSpec::new("item", "item", ValueKind::Compact),
                ColumnSpec::new("amount", "amount", ValueKind::Digits),
            ],
            grouping: Grouping::Rows,
            header: None,
        }
    }
}

impl ExtractionSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column_for(&self, entity_type: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.entity_type == entity_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::Config("extraction schema has no columns".to_string()));
        }
        let mut names = HashSet::new();
        let mut types = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name.as_str()) {
                return Err(Error::Config(format!("duplicate column name {}", column.name)));
            }
            if !types.insert(column.entity_type.as_str()) {
                return Err(Error::Config(format!(
                    "entity type {} mapped twice",
                    column.entity_type
                )));
            }
        }
        if let Some(header) = &self.header {
            if header.keywords.is_empty() {
                return Err(Error::Config("extraction header has no keywords".to_string()));
            }
            for entity_type in std::iter::once(&header.title_entity).chain(&header.fields) {
                if !types.insert(entity_type.as_str()) {
                    return Err(Error::Config(format!(
                        "entity type {} mapped twice",
                        entity_type
                    )));
                }
            }
            if let Some(rule) = header.title_rules.iter().find(|r| !header.is_keyword(&r.keyword)) {
                return Err(Error::Config(format!(
                    "title rule targets {}, which is not a keyword",
                    rule.keyword
                )));
            }
        }
        Ok(())
    }
}

/// Extraction service plus schema and local retry policy
pub struct DocumentExtractor {
    service: Arc<dyn ExtractionService>,
    schema: ExtractionSchema,
    retry: RetryPolicy,
}

impl DocumentExtractor {
    pub fn new(service: Arc<dyn ExtractionService>, schema: ExtractionSchema, retry: RetryPolicy) -> Self {
        Self {
            service,
            schema,
            retry,
        }
    }

    pub fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    /// Extract records from a processed page
    pub async fn extract(&self, image: &ProcessedImage) -> Result<ExtractedDocument> {
        let (response, attempts) = self
            .retry
            .run("document extraction", || {
                self.service.process(&image.bytes, image.content_type)
            })
            .await;
        let response = response?;

        let document = normalize::normalize(&response, &self.schema, &self.service.processor_ref())?;
        tracing::info!(
            records = document.records.len(),
            title = document.title.as_deref().unwrap_or(""),
            needs_review = document.needs_review,
            attempts,
            "Extraction complete"
        );
        Ok(document)
    }
}
