//! Strict mapping of Document AI responses into [`ExtractedDocument`]
//!
//! Anything that does not have the documented shape is rejected with
//! [`Error::PermanentValidation`] rather than coerced. Proto3 JSON omits
//! default values, so an absent `confidence`, coordinate or `mentionText`
//! reads as zero or empty.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{ColumnSpec, ExtractionSchema, Grouping, HeaderSpec, ValueKind};
use crate::error::{Error, Result};
use crate::types::{ExtractedDocument, Field, Record};

/// Tolerance used when no entity has a usable height
const DEFAULT_ROW_TOLERANCE: f64 = 0.01;
const MIN_ROW_TOLERANCE: f64 = 0.008;
const ROW_TOLERANCE_FACTOR: f64 = 0.95;
/// Heights below this are treated as degenerate boxes
const MIN_ENTITY_HEIGHT: f64 = 0.001;

/// Position of an entity on the page, in normalized coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct BoundingBox {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl BoundingBox {
    fn center_y(&self) -> f64 {
        (self.y_min + self.y_max) / 2.0
    }

    fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

#[derive(Debug, Clone)]
struct Entity {
    entity_type: String,
    text: String,
    confidence: f32,
    bbox: Option<BoundingBox>,
    properties: Vec<Entity>,
}

/// Map a `:process` response into records following `schema`
pub fn normalize(response: &Value, schema: &ExtractionSchema, processor_ref: &str) -> Result<ExtractedDocument> {
    let document = response
        .get("document")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::validation("extraction response has no document object"))?;

    let entities = match document.get("entities") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, e)| parse_entity(e, &format!("entities[{}]", i)))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::validation("document.entities is not an array")),
    };

    let (title, header) = match &schema.header {
        Some(spec) => read_header(&entities, spec)?,
        None => (None, Record::default()),
    };

    let mut records = Vec::new();
    let mut needs_review = false;

    let (nested, flat): (Vec<&Entity>, Vec<&Entity>) =
        entities.iter().partition(|e| !e.properties.is_empty());

    let known: Vec<&Entity> = flat
        .into_iter()
        .filter(|e| {
            let known = schema.column_for(&e.entity_type).is_some();
            if !known {
                tracing::debug!(entity_type = %e.entity_type, "Ignoring entity outside the schema");
            }
            known
        })
        .collect();

    if !known.is_empty() {
        let groups = match schema.grouping {
            Grouping::Single => vec![known],
            Grouping::Rows => group_rows(known, schema)?,
        };
        for group in groups {
            let (record, review) = build_record(&group, schema);
            needs_review |= review;
            records.push(record);
        }
    }

    for parent in nested {
        let members: Vec<&Entity> = parent
            .properties
            .iter()
            .filter(|p| schema.column_for(&p.entity_type).is_some())
            .collect();
        if members.is_empty() {
            tracing::debug!(entity_type = %parent.entity_type, "Ignoring group outside the schema");
            continue;
        }
        let (record, review) = build_record(&members, schema);
        needs_review |= review;
        records.push(record);
    }

    if records.is_empty() {
        return Err(Error::validation("no fields matching the extraction schema were found"));
    }

    Ok(ExtractedDocument {
        columns: schema.column_names(),
        records,
        title,
        header,
        needs_review,
        raw_payload_ref: payload_ref(response, processor_ref),
    })
}

/// Apply the title gate and capture header fields.
///
/// The first top-level entity of each type is used.
fn read_header(entities: &[Entity], spec: &HeaderSpec) -> Result<(Option<String>, Record)> {
    let first = |entity_type: &str| {
        entities
            .iter()
            .find(|e| e.entity_type == entity_type && e.properties.is_empty())
    };

    let raw = first(spec.title_entity.as_str())
        .map(|e| e.text.as_str())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::UnrecognizedDocument("no title on the page".to_string()))?;
    let title = spec.normalize_title(raw);
    if !spec.is_keyword(&title) {
        return Err(Error::UnrecognizedDocument(format!(
            "title {:?} is not an accepted form",
            title
        )));
    }

    let fields = spec
        .fields
        .iter()
        .filter_map(|entity_type| {
            first(entity_type.as_str()).map(|e| Field {
                name: entity_type.clone(),
                value: clean(&e.text, ValueKind::Text),
                confidence: e.confidence,
            })
        })
        .collect();
    Ok((Some(title), Record { fields }))
}

fn payload_ref(response: &Value, processor_ref: &str) -> String {
    let digest = hex::encode(Sha256::digest(response.to_string().as_bytes()));
    format!("{}#sha256:{}", processor_ref, &digest[..16])
}

fn parse_entity(value: &Value, path: &str) -> Result<Entity> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::validation(format!("{} is not an object", path)))?;

    let entity_type = match obj.get("type") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        _ => return Err(Error::validation(format!("{}.type is missing", path))),
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(c) if (0.0..=1.0).contains(&c) => c as f32,
            _ => {
                return Err(Error::validation(format!(
                    "{}.confidence {} is outside [0, 1]",
                    path, n
                )))
            }
        },
        Some(_) => return Err(Error::validation(format!("{}.confidence is not a number", path))),
    };

    let text = match obj.get("mentionText") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => normalized_text(obj, path)?.unwrap_or_default(),
        Some(_) => return Err(Error::validation(format!("{}.mentionText is not a string", path))),
    };

    let bbox = parse_bounding_box(obj, path)?;

    let properties = match obj.get("properties") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, p)| parse_entity(p, &format!("{}.properties[{}]", path, i)))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::validation(format!("{}.properties is not an array", path))),
    };

    Ok(Entity {
        entity_type,
        text,
        confidence,
        bbox,
        properties,
    })
}

fn normalized_text(obj: &Map<String, Value>, path: &str) -> Result<Option<String>> {
    match obj.get("normalizedValue") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(nv)) => match nv.get("text") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Error::validation(format!("{}.normalizedValue.text is not a string", path))),
        },
        Some(_) => Err(Error::validation(format!("{}.normalizedValue is not an object", path))),
    }
}

/// `pageAnchor.pageRefs[0].boundingPoly.normalizedVertices`
fn parse_bounding_box(obj: &Map<String, Value>, path: &str) -> Result<Option<BoundingBox>> {
    let Some(vertices) = obj
        .get("pageAnchor")
        .and_then(|a| a.get("pageRefs"))
        .and_then(|refs| refs.get(0))
        .and_then(|r| r.get("boundingPoly"))
        .and_then(|p| p.get("normalizedVertices"))
    else {
        return Ok(None);
    };

    let vertices = vertices
        .as_array()
        .ok_or_else(|| Error::validation(format!("{} normalizedVertices is not an array", path)))?;
    if vertices.len() < 4 {
        return Err(Error::validation(format!(
            "{} bounding polygon has {} vertices",
            path,
            vertices.len()
        )));
    }

    let coordinate = |v: &Value, axis: &str| -> Result<f64> {
        match v.get(axis) {
            None | Some(Value::Null) => Ok(0.0),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| Error::validation(format!("{} vertex {} is not finite", path, axis))),
            Some(_) => Err(Error::validation(format!("{} vertex {} is not a number", path, axis))),
        }
    };

    let mut bbox = BoundingBox {
        x_min: f64::INFINITY,
        x_max: f64::NEG_INFINITY,
        y_min: f64::INFINITY,
        y_max: f64::NEG_INFINITY,
    };
    for vertex in vertices {
        let (x, y) = (coordinate(vertex, "x")?, coordinate(vertex, "y")?);
        bbox.x_min = bbox.x_min.min(x);
        bbox.x_max = bbox.x_max.max(x);
        bbox.y_min = bbox.y_min.min(y);
        bbox.y_max = bbox.y_max.max(y);
    }
    Ok(Some(bbox))
}

/// Split entities into visual lines.
///
/// When every column has the same number of entities they are paired
/// top-to-bottom. Otherwise entities are swept by vertical center and a new
/// row starts once the distance to the row's first entity reaches a
/// tolerance derived from typical entity height.
fn group_rows<'a>(entities: Vec<&'a Entity>, schema: &ExtractionSchema) -> Result<Vec<Vec<&'a Entity>>> {
    let mut positioned = Vec::with_capacity(entities.len());
    for entity in entities {
        let bbox = entity.bbox.ok_or_else(|| {
            Error::validation(format!(
                "entity {} has no bounding box; row grouping needs positions",
                entity.entity_type
            ))
        })?;
        positioned.push((entity, bbox));
    }

    let per_column: Vec<Vec<(&Entity, BoundingBox)>> = schema
        .columns
        .iter()
        .map(|c| {
            let mut column: Vec<_> = positioned
                .iter()
                .copied()
                .filter(|(e, _)| e.entity_type == c.entity_type)
                .collect();
            column.sort_by(|a, b| a.1.center_y().total_cmp(&b.1.center_y()));
            column
        })
        .collect();

    let count = per_column.first().map_or(0, Vec::len);
    if count > 0 && per_column.iter().all(|c| c.len() == count) {
        return Ok((0..count)
            .map(|i| per_column.iter().map(|c| c[i].0).collect())
            .collect());
    }

    let tolerance = row_tolerance(&positioned);
    positioned.sort_by(|a, b| a.1.center_y().total_cmp(&b.1.center_y()));

    let mut rows: Vec<Vec<(&Entity, BoundingBox)>> = Vec::new();
    for item in positioned {
        match rows.last_mut() {
            Some(row) if (item.1.center_y() - row[0].1.center_y()).abs() < tolerance => row.push(item),
            _ => rows.push(vec![item]),
        }
    }

    Ok(rows
        .into_iter()
        .map(|mut row| {
            row.sort_by(|a, b| a.1.x_min.total_cmp(&b.1.x_min));
            row.into_iter().map(|(e, _)| e).collect()
        })
        .collect())
}

/// Mean of the middle 60% of entity heights, scaled, with a floor
fn row_tolerance(entities: &[(&Entity, BoundingBox)]) -> f64 {
    let mut heights: Vec<f64> = entities
        .iter()
        .map(|(_, b)| b.height())
        .filter(|h| *h > MIN_ENTITY_HEIGHT)
        .collect();
    if heights.is_empty() {
        return DEFAULT_ROW_TOLERANCE;
    }
    heights.sort_by(|a, b| a.total_cmp(b));

    let (start, end) = (heights.len() / 5, heights.len() * 4 / 5);
    let stable = if start < end { &heights[start..end] } else { &heights[..] };
    let avg = stable.iter().sum::<f64>() / stable.len() as f64;
    (avg * ROW_TOLERANCE_FACTOR).max(MIN_ROW_TOLERANCE)
}

/// Build one record in schema order.
///
/// Returns `true` alongside the record when it needs human review: a
/// column is missing, a value cleaned down to nothing, or a column's box
/// overlaps the one to its left.
fn build_record(members: &[&Entity], schema: &ExtractionSchema) -> (Record, bool) {
    let mut review = false;
    let mut fields = Vec::with_capacity(schema.columns.len());
    let mut previous_right: Option<f64> = None;

    for column in &schema.columns {
        let matching: Vec<&Entity> = members
            .iter()
            .copied()
            .filter(|e| e.entity_type == column.entity_type)
            .collect();

        let Some((raw, confidence, span)) = merge_column(&matching, schema.grouping) else {
            review = true;
            fields.push(empty_field(column));
            continue;
        };

        if let (Some(right), Some((left, _))) = (previous_right, span) {
            if right >= left {
                tracing::warn!(
                    column = %column.name,
                    value = %raw,
                    "Value overlaps the previous column, dropping it"
                );
                review = true;
                fields.push(empty_field(column));
                continue;
            }
        }
        if let Some((_, right)) = span {
            previous_right = Some(right);
        }

        let value = clean(&raw, column.kind);
        if value.is_empty() && !raw.trim().is_empty() {
            review = true;
        }
        fields.push(Field {
            name: column.name.clone(),
            value,
            confidence,
        });
    }

    if fields.iter().all(|f| f.value.is_empty()) {
        review = true;
    }
    (Record { fields }, review)
}

/// Combine the entities of one column.
///
/// Rows: fragments joined left to right, lowest confidence kept. Single: the
/// most confident entity (first on ties). Also returns the horizontal span
/// when every fragment has a position.
fn merge_column(matching: &[&Entity], grouping: Grouping) -> Option<(String, f32, Option<(f64, f64)>)> {
    if matching.is_empty() {
        return None;
    }

    let chosen: Vec<&Entity> = match grouping {
        Grouping::Rows => matching.to_vec(),
        Grouping::Single => {
            let mut best = matching[0];
            for e in &matching[1..] {
                if e.confidence > best.confidence {
                    best = e;
                }
            }
            vec![best]
        }
    };

    let text = chosen.iter().map(|e| e.text.as_str()).collect::<Vec<_>>().join(" ");
    let confidence = chosen.iter().map(|e| e.confidence).fold(f32::INFINITY, f32::min);
    let span = chosen
        .iter()
        .map(|e| e.bbox.map(|b| (b.x_min, b.x_max)))
        .collect::<Option<Vec<_>>>()
        .and_then(|spans| {
            let left = spans.iter().map(|s| s.0).fold(f64::INFINITY, f64::min);
            let right = spans.iter().map(|s| s.1).fold(f64::NEG_INFINITY, f64::max);
            (left.is_finite() && right.is_finite()).then_some((left, right))
        });

    Some((text, confidence, span))
}

fn empty_field(column: &ColumnSpec) -> Field {
    Field {
        name: column.name.clone(),
        value: String::new(),
        confidence: 0.0,
    }
}

fn clean(raw: &str, kind: ValueKind) -> String {
    match kind {
        ValueKind::Text => raw
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        ValueKind::Compact => raw.chars().filter(|c| !c.is_whitespace()).collect(),
        ValueKind::Digits => raw
            .chars()
            .filter_map(|c| match c {
                '0'..='9' => Some(c),
                // Full-width digits
                '\u{FF10}'..='\u{FF19}' => char::from_digit(c as u32 - 0xFF10, 10),
                _ => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boxed(entity_type: &str, text: &str, x: (f64, f64), y: (f64, f64)) -> Value {
        json!({
            "type": entity_type,
            "mentionText": text,
            "confidence": 0.9,
            "pageAnchor": { "pageRefs": [{ "boundingPoly": { "normalizedVertices": [
                { "x": x.0, "y": y.0 }, { "x": x.1, "y": y.0 },
                { "x": x.1, "y": y.1 }, { "x": x.0, "y": y.1 }
            ]}}]}
        })
    }

    fn response(entities: Vec<Value>) -> Value {
        json!({ "document": { "text": "...", "entities": entities } })
    }

    fn values(doc: &ExtractedDocument) -> Vec<Vec<String>> {
        doc.records
            .iter()
            .map(|r| r.fields.iter().map(|f| f.value.clone()).collect())
            .collect()
    }

    #[test]
    fn test_equal_counts_pair_top_down() {
        let doc = normalize(
            &response(vec![
                boxed("amount", "¥1,200", (0.7, 0.9), (0.30, 0.33)),
                boxed("item", "Sand wich", (0.1, 0.4), (0.30, 0.33)),
                boxed("item", "Coffee", (0.1, 0.4), (0.20, 0.23)),
                boxed("amount", "４８０円", (0.7, 0.9), (0.21, 0.24)),
            ]),
            &ExtractionSchema::default(),
            "proc",
        )
        .unwrap();

        assert_eq!(doc.columns, vec!["item", "amount"]);
        assert_eq!(values(&doc), vec![vec!["Coffee", "480"], vec!["Sandwich", "1200"]]);
        assert!(!doc.needs_review);
        assert!(doc.raw_payload_ref.starts_with("proc#sha256:"));
    }

    #[test]
    fn test_row_grouping_with_missing_amount() {
        let doc = normalize(
            &response(vec![
                boxed("item", "Tea", (0.1, 0.3), (0.10, 0.13)),
                boxed("amount", "300", (0.7, 0.9), (0.105, 0.135)),
                boxed("item", "Cake", (0.1, 0.3), (0.20, 0.23)),
                boxed("item", "Jam", (0.1, 0.3), (0.30, 0.33)),
                boxed("amount", "150", (0.7, 0.9), (0.30, 0.33)),
            ]),
            &ExtractionSchema::default(),
            "proc",
        )
        .unwrap();

        assert_eq!(
            values(&doc),
            vec![vec!["Tea", "300"], vec!["Cake", ""], vec!["Jam", "150"]]
        );
        assert!(doc.needs_review);
    }

    #[test]
    fn test_row_fragments_merge_left_to_right() {
        let doc = normalize(
            &response(vec![
                boxed("item", "Milk", (0.30, 0.45), (0.10, 0.13)),
                boxed("item", "Fresh", (0.10, 0.25), (0.10, 0.13)),
                boxed("amount", "98", (0.7, 0.9), (0.10, 0.13)),
                boxed("amount", "10", (0.7, 0.9), (0.50, 0.53)),
                boxed("item", "Salt", (0.1, 0.3), (0.70, 0.73)),
            ]),
            &ExtractionSchema::default(),
            "proc",
        )
        .unwrap();
        assert_eq!(
            values(&doc),
            vec![vec!["FreshMilk", "98"], vec!["", "10"], vec!["Salt", ""]]
        );
        assert!(doc.needs_review);
    }

    #[test]
    fn test_overlapping_columns_flagged() {
        let doc = normalize(
            &response(vec![
                boxed("item", "Bread", (0.1, 0.6), (0.10, 0.13)),
                boxed("amount", "200", (0.5, 0.7), (0.10, 0.13)),
                boxed("item", "Eggs", (0.1, 0.3), (0.20, 0.23)),
            ]),
            &ExtractionSchema::default(),
            "proc",
        )
        .unwrap();
        assert_eq!(values(&doc)[0], vec!["Bread", ""]);
        assert!(doc.needs_review);
    }

    #[test]
    fn test_row_tolerance_floor_and_trim() {
        let e = Entity {
            entity_type: "item".into(),
            text: String::new(),
            confidence: 1.0,
            bbox: None,
            properties: vec![],
        };
        let tiny = BoundingBox { x_min: 0.0, x_max: 0.1, y_min: 0.1, y_max: 0.102 };
        assert_eq!(row_tolerance(&[(&e, tiny)]), MIN_ROW_TOLERANCE);
        assert_eq!(row_tolerance(&[]), DEFAULT_ROW_TOLERANCE);

        // Outliers at either end are trimmed
        let heights = [0.002, 0.02, 0.02, 0.02, 0.5];
        let boxes: Vec<_> = heights
            .iter()
            .map(|h| (&e, BoundingBox { x_min: 0.0, x_max: 0.1, y_min: 0.0, y_max: *h }))
            .collect();
        assert!((row_tolerance(&boxes) - 0.02 * ROW_TOLERANCE_FACTOR).abs() < 1e-12);
    }

    #[test]
    fn test_nested_properties_form_records() {
        let doc = normalize(
            &json!({ "document": { "entities": [
                { "type": "line_item", "confidence": 1.0, "properties": [
                    { "type": "item", "mentionText": "Pen", "confidence": 0.8 },
                    { "type": "amount", "mentionText": "120", "confidence": 0.7 }
                ]},
                { "type": "line_item", "properties": [
                    { "type": "item", "mentionText": "Ink", "confidence": 0.6 },
                    { "type": "amount", "normalizedValue": { "text": "300" } }
                ]},
                { "type": "signature", "properties": [
                    { "type": "unrelated", "mentionText": "x" }
                ]}
            ]}}),
            &ExtractionSchema::default(),
            "proc",
        )
        .unwrap();

        assert_eq!(values(&doc), vec![vec!["Pen", "120"], vec!["Ink", "300"]]);
        assert_eq!(doc.records[0].fields[1].confidence, 0.7);
        // Absent confidence reads as zero
        assert_eq!(doc.records[1].fields[1].confidence, 0.0);
    }

    #[test]
    fn test_single_grouping_prefers_confident_entity() {
        let schema = ExtractionSchema {
            columns: vec![
                ColumnSpec::new("vendor", "supplier_name", ValueKind::Text),
                ColumnSpec::new("total", "total_amount", ValueKind::Digits),
            ],
            grouping: Grouping::Single,
            header: None,
        };
        let doc = normalize(
            &response(vec![
                json!({ "type": "supplier_name", "mentionText": "ACME\nStore ", "confidence": 0.4 }),
                json!({ "type": "supplier_name", "mentionText": "ACME Shop", "confidence": 0.9 }),
                json!({ "type": "total_amount", "mentionText": "1,000", "confidence": 0.8 }),
                json!({ "type": "currency", "mentionText": "JPY", "confidence": 0.99 }),
            ]),
            &schema,
            "proc",
        )
        .unwrap();

        assert_eq!(values(&doc), vec![vec!["ACME Shop", "1000"]]);
        assert_eq!(doc.records[0].fields[0].confidence, 0.9);
        assert!(!doc.needs_review);
    }

    #[test]
    fn test_unexpected_shapes_rejected() {
        let schema = ExtractionSchema::default();
        let bad = [
            json!({ "entities": [] }),
            json!({ "document": "text" }),
            json!({ "document": { "entities": {} } }),
            json!({ "document": { "entities": ["item"] } }),
            json!({ "document": { "entities": [{ "mentionText": "no type" }] } }),
            json!({ "document": { "entities": [{ "type": "item", "confidence": 1.5 }] } }),
            json!({ "document": { "entities": [{ "type": "item", "confidence": "high" }] } }),
            json!({ "document": { "entities": [{ "type": "item", "mentionText": 12 }] } }),
            json!({ "document": { "entities": [{ "type": "item", "properties": "x" }] } }),
            json!({ "document": { "entities": [{ "type": "item", "pageAnchor": { "pageRefs": [
                { "boundingPoly": { "normalizedVertices": [{ "x": 0.1 }] } }
            ]}}]}}),
        ];
        for response in bad {
            let result = normalize(&response, &schema, "proc");
            assert!(
                matches!(result, Err(Error::PermanentValidation(_))),
                "accepted {}",
                response
            );
        }
    }

    #[test]
    fn test_rows_need_positions() {
        let result = normalize(
            &response(vec![json!({ "type": "item", "mentionText": "Tea", "confidence": 0.9 })]),
            &ExtractionSchema::default(),
            "proc",
        );
        assert!(matches!(result, Err(Error::PermanentValidation(_))));
    }

    #[test]
    fn test_nothing_extracted_is_permanent() {
        let result = normalize(
            &response(vec![json!({ "type": "currency", "mentionText": "JPY" })]),
            &ExtractionSchema::default(),
            "proc",
        );
        assert!(matches!(result, Err(Error::PermanentValidation(_))));

        let result = normalize(&json!({ "document": {} }), &ExtractionSchema::default(), "proc");
        assert!(matches!(result, Err(Error::PermanentValidation(_))));
    }

    #[test]
    fn test_empty_schema_does_not_panic() {
        let schema = ExtractionSchema {
            columns: Vec::new(),
            grouping: Grouping::Rows,
            header: None,
        };
        let entities = [
            parse_entity(&boxed("item", "Tea", (0.1, 0.3), (0.10, 0.13)), "e0").unwrap(),
            parse_entity(&boxed("amount", "300", (0.7, 0.9), (0.10, 0.13)), "e1").unwrap(),
        ];

        let rows = group_rows(entities.iter().collect(), &schema).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].text, "Tea");

        let err = normalize(&response(vec![boxed("item", "Tea", (0.1, 0.3), (0.1, 0.13))]), &schema, "proc")
            .unwrap_err();
        assert!(matches!(err, Error::PermanentValidation(_)));
    }

    fn cash_book_schema() -> ExtractionSchema {
        ExtractionSchema {
            header: Some(super::super::tests::cash_book_header()),
            ..ExtractionSchema::default()
        }
    }

    #[test]
    fn test_header_title_repaired_and_captured() {
        let doc = normalize(
            &response(vec![
                json!({ "type": "title", "mentionText": "出納表(ッ払)", "confidence": 0.7 }),
                json!({ "type": "shop_name", "mentionText": "Kita\nStore", "confidence": 0.9 }),
                json!({ "type": "date", "mentionText": "2024/05/01", "confidence": 0.8 }),
                json!({ "type": "title", "mentionText": "現金受入", "confidence": 0.9 }),
                boxed("item", "Tea", (0.1, 0.3), (0.10, 0.13)),
                boxed("amount", "300", (0.7, 0.9), (0.10, 0.13)),
            ]),
            &cash_book_schema(),
            "proc",
        )
        .unwrap();

        assert_eq!(doc.title.as_deref(), Some("クレジット支払"));
        assert_eq!(doc.header.value("shop_name"), Some("Kita Store"));
        assert_eq!(doc.header.value("date"), Some("2024/05/01"));
        assert_eq!(values(&doc), vec![vec!["Tea", "300"]]);
        // Header entities never become columns
        assert_eq!(doc.columns, vec!["item", "amount"]);
    }

    #[test]
    fn test_missing_or_unknown_title_rejected() {
        let rows = || {
            vec![
                boxed("item", "Tea", (0.1, 0.3), (0.10, 0.13)),
                boxed("amount", "300", (0.7, 0.9), (0.10, 0.13)),
            ]
        };

        let err = normalize(&response(rows()), &cash_book_schema(), "proc").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedDocument(_)));

        let mut entities = rows();
        entities.push(json!({ "type": "title", "mentionText": "請求書", "confidence": 0.99 }));
        let err = normalize(&response(entities), &cash_book_schema(), "proc").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedDocument(_)));

        // Without a header every page is accepted
        assert!(normalize(&response(rows()), &ExtractionSchema::default(), "proc").is_ok());
    }

    #[test]
    fn test_clean_kinds() {
        assert_eq!(clean(" Coffee\r\nlarge ", ValueKind::Text), "Coffee large");
        assert_eq!(clean("Sand wich\u{3000}", ValueKind::Compact), "Sandwich");
        assert_eq!(clean("¥1,２００-", ValueKind::Digits), "1200");
    }
}
