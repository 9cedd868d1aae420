//! Versioned extraction schema and validation of provider responses.
//!
//! The provider is told exactly which fields to return. Nothing it sends back is
//! trusted until it has been checked against the same schema: wrong types are
//! dropped and recorded as issues, absent required fields are listed separately.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Field value type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Text,
    Decimal,
    Number,
    Timestamp,
    List(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

/// Fixed field specification sent to the provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionSchema {
    pub name: &'static str,
    pub version: u32,
    pub fields: &'static [FieldSpec],
}

const RECEIPT_ITEM_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "label", kind: FieldKind::Text, required: true, description: "item text as printed" },
    FieldSpec { name: "quantity", kind: FieldKind::Decimal, required: false, description: "quantity or weight" },
    FieldSpec { name: "unit_price", kind: FieldKind::Decimal, required: false, description: "price per unit" },
    FieldSpec { name: "line_total", kind: FieldKind::Decimal, required: true, description: "amount charged for the line" },
];

const RECEIPT_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "supplier_name", kind: FieldKind::Text, required: true, description: "store or merchant name" },
    FieldSpec { name: "total_amount", kind: FieldKind::Decimal, required: true, description: "grand total paid" },
    FieldSpec { name: "currency", kind: FieldKind::Text, required: false, description: "ISO 4217 code" },
    FieldSpec { name: "purchased_at", kind: FieldKind::Timestamp, required: false, description: "purchase date and time" },
    FieldSpec { name: "payment_method", kind: FieldKind::Text, required: false, description: "cash, card, ..." },
    FieldSpec { name: "card_last4", kind: FieldKind::Text, required: false, description: "masked card number" },
    FieldSpec { name: "confidence", kind: FieldKind::Number, required: false, description: "overall confidence 0..1" },
    FieldSpec { name: "items", kind: FieldKind::List(RECEIPT_ITEM_FIELDS), required: false, description: "purchased lines" },
];

pub const RECEIPT_SCHEMA_V1: ExtractionSchema = ExtractionSchema {
    name: "receipt",
    version: 1,
    fields: RECEIPT_FIELDS,
};

/// The provider response is not usable at all
#[derive(Debug, Clone, Error, PartialEq)]
#[error("extraction payload rejected: {0}")]
pub struct SchemaRejection(pub String);

/// Coerced field value
#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Text(String),
    Decimal(BigDecimal),
    Number(f64),
    Timestamp(DateTime<Utc>),
    List(Vec<BTreeMap<&'static str, Coerced>>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedItem {
    pub label: Option<String>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: Option<BigDecimal>,
}

/// Typed view over a validated extraction payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedReceipt {
    pub supplier_name: Option<String>,
    pub total_amount: Option<BigDecimal>,
    pub currency: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub card_last4: Option<String>,
    pub confidence: Option<f64>,
    pub items: Vec<ExtractedItem>,
    /// required fields the provider did not return
    pub missing_required: Vec<String>,
    /// fields dropped because of a type mismatch
    pub issues: Vec<String>,
}

impl ExtractionSchema {
    /// Schema id, e.g. `receipt/v1`
    pub fn id(&self) -> String {
        format!("{}/v{}", self.name, self.version)
    }

    /// JSON-schema-like description sent with every extract call
    pub fn to_json(&self) -> Value {
        let mut doc = describe_object(self.fields);
        if let Value::Object(map) = &mut doc {
            map.insert("$id".to_string(), json!(self.id()));
        }
        doc
    }

    /// Validate a provider response
    pub fn validate(&self, payload: &Value) -> Result<ExtractedReceipt, SchemaRejection> {
        let object = payload
            .as_object()
            .ok_or_else(|| SchemaRejection(format!("expected a JSON object, got {}", type_name(payload))))?;

        let mut missing = Vec::new();
        let mut issues = Vec::new();
        let fields = coerce_object(self.fields, object, "", &mut missing, &mut issues);

        let items = match fields.get("items") {
            Some(Coerced::List(rows)) => rows
                .iter()
                .map(|row| ExtractedItem {
                    label: text(row, "label"),
                    quantity: decimal(row, "quantity"),
                    unit_price: decimal(row, "unit_price"),
                    line_total: decimal(row, "line_total"),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(ExtractedReceipt {
            supplier_name: text(&fields, "supplier_name"),
            total_amount: decimal(&fields, "total_amount"),
            currency: text(&fields, "currency").map(|c| c.to_uppercase()),
            purchased_at: timestamp(&fields, "purchased_at"),
            payment_method: text(&fields, "payment_method").map(|m| m.to_lowercase()),
            card_last4: text(&fields, "card_last4"),
            confidence: number(&fields, "confidence"),
            items,
            missing_required: missing,
            issues,
        })
    }
}

fn describe_object(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        let mut spec = match field.kind {
            FieldKind::Text => json!({ "type": "string" }),
            FieldKind::Decimal => json!({ "type": ["number", "string"], "format": "decimal" }),
            FieldKind::Number => json!({ "type": "number" }),
            FieldKind::Timestamp => json!({ "type": "string", "format": "date-time" }),
            FieldKind::List(inner) => json!({ "type": "array", "items": describe_object(inner) }),
        };
        if let Value::Object(map) = &mut spec {
            map.insert("description".to_string(), json!(field.description));
        }
        properties.insert(field.name.to_string(), spec);
        if field.required {
            required.push(json!(field.name));
        }
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

fn coerce_object(
    fields: &'static [FieldSpec],
    object: &Map<String, Value>,
    prefix: &str,
    missing: &mut Vec<String>,
    issues: &mut Vec<String>,
) -> BTreeMap<&'static str, Coerced> {
    let mut out = BTreeMap::new();
    for field in fields {
        let path = format!("{}{}", prefix, field.name);
        let value = match object.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    missing.push(path);
                }
                continue;
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                if field.required {
                    missing.push(path);
                }
                continue;
            }
            Some(v) => v,
        };

        let coerced = match field.kind {
            FieldKind::Text => match value {
                Value::String(s) => Some(Coerced::Text(s.trim().to_string())),
                Value::Number(n) => Some(Coerced::Text(n.to_string())),
                _ => None,
            },
            FieldKind::Decimal => parse_decimal(value).map(Coerced::Decimal),
            FieldKind::Number => match value {
                Value::Number(n) => n.as_f64().map(Coerced::Number),
                Value::String(s) => s.trim().parse::<f64>().ok().map(Coerced::Number),
                _ => None,
            },
            FieldKind::Timestamp => value.as_str().and_then(parse_timestamp).map(Coerced::Timestamp),
            FieldKind::List(inner) => match value {
                Value::Array(rows) => {
                    let mut parsed = Vec::with_capacity(rows.len());
                    for (idx, row) in rows.iter().enumerate() {
                        let row_prefix = format!("{}[{}].", path, idx);
                        match row.as_object() {
                            Some(obj) => parsed.push(coerce_object(inner, obj, &row_prefix, missing, issues)),
                            None => issues.push(format!("{}[{}]: expected object", path, idx)),
                        }
                    }
                    Some(Coerced::List(parsed))
                }
                _ => None,
            },
        };

        match coerced {
            Some(c) => {
                out.insert(field.name, c);
            }
            None => {
                issues.push(format!("{}: unexpected {}", path, type_name(value)));
                if field.required {
                    missing.push(path);
                }
            }
        }
    }
    out
}

fn text(fields: &BTreeMap<&'static str, Coerced>, name: &str) -> Option<String> {
    match fields.get(name) {
        Some(Coerced::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn decimal(fields: &BTreeMap<&'static str, Coerced>, name: &str) -> Option<BigDecimal> {
    match fields.get(name) {
        Some(Coerced::Decimal(d)) => Some(d.clone()),
        _ => None,
    }
}

fn number(fields: &BTreeMap<&'static str, Coerced>, name: &str) -> Option<f64> {
    match fields.get(name) {
        Some(Coerced::Number(n)) => Some(*n),
        _ => None,
    }
}

fn timestamp(fields: &BTreeMap<&'static str, Coerced>, name: &str) -> Option<DateTime<Utc>> {
    match fields.get(name) {
        Some(Coerced::Timestamp(t)) => Some(*t),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Accepts JSON numbers and strings like "2.50", "2,50", "1 234.00"
pub fn parse_decimal(value: &Value) -> Option<BigDecimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let mut cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.contains(',') && !cleaned.contains('.') {
        cleaned = cleaned.replace(',', ".");
    } else {
        cleaned = cleaned.replace(',', "");
    }
    BigDecimal::from_str(&cleaned).ok()
}

/// RFC 3339 or common receipt date layouts. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(ts.and_utc());
        }
    }
    for layout in ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, layout) {
            return date.and_hms_opt(0, 0, 0).map(|ts| ts.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_schema_description_lists_required_fields() {
        let doc = RECEIPT_SCHEMA_V1.to_json();
        assert_eq!(doc["$id"], "receipt/v1");
        assert_eq!(doc["required"], json!(["supplier_name", "total_amount"]));
        assert_eq!(doc["properties"]["items"]["type"], "array");
        assert_eq!(
            doc["properties"]["items"]["items"]["required"],
            json!(["label", "line_total"])
        );
    }

    #[test]
    fn test_validate_full_payload() {
        let payload = json!({
            "supplier_name": " Bingo ",
            "total_amount": "42,50",
            "currency": "bam",
            "purchased_at": "2024-05-01 10:15",
            "payment_method": "CARD",
            "card_last4": "1234",
            "confidence": 0.93,
            "items": [
                { "label": "Milk 1L", "quantity": 1, "line_total": 2.5 },
                { "label": "Bread", "unit_price": "1.20", "line_total": "2.40", "quantity": "2" }
            ]
        });
        let extracted = RECEIPT_SCHEMA_V1.validate(&payload).unwrap();
        assert_eq!(extracted.supplier_name.as_deref(), Some("Bingo"));
        assert_eq!(extracted.total_amount, Some(dec("42.50")));
        assert_eq!(extracted.currency.as_deref(), Some("BAM"));
        assert_eq!(extracted.payment_method.as_deref(), Some("card"));
        assert_eq!(extracted.confidence, Some(0.93));
        assert_eq!(extracted.items.len(), 2);
        assert_eq!(extracted.items[1].unit_price, Some(dec("1.20")));
        assert!(extracted.missing_required.is_empty());
        assert!(extracted.issues.is_empty());
        assert_eq!(
            extracted.purchased_at.unwrap().to_rfc3339(),
            "2024-05-01T10:15:00+00:00"
        );
    }

    #[test]
    fn test_missing_total_is_reported() {
        let extracted = RECEIPT_SCHEMA_V1
            .validate(&json!({ "supplier_name": "Bingo", "total_amount": null }))
            .unwrap();
        assert_eq!(extracted.missing_required, vec!["total_amount".to_string()]);
        assert!(extracted.total_amount.is_none());
    }

    #[test]
    fn test_mistyped_fields_are_dropped_as_issues() {
        let extracted = RECEIPT_SCHEMA_V1
            .validate(&json!({
                "supplier_name": "Bingo",
                "total_amount": { "value": 3 },
                "items": [ "oops", { "label": "Eggs", "line_total": true } ]
            }))
            .unwrap();
        assert!(extracted.total_amount.is_none());
        assert_eq!(
            extracted.issues,
            vec![
                "total_amount: unexpected object".to_string(),
                "items[0]: expected object".to_string(),
                "items[1].line_total: unexpected boolean".to_string(),
            ]
        );
        assert_eq!(
            extracted.missing_required,
            vec!["total_amount".to_string(), "items[1].line_total".to_string()]
        );
        assert_eq!(extracted.items.len(), 1);
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(RECEIPT_SCHEMA_V1.validate(&json!(["nope"])).is_err());
    }

    #[test]
    fn test_parse_timestamp_layouts() {
        assert!(parse_timestamp("2024-05-01T10:15:00+02:00").is_some());
        assert!(parse_timestamp("01.05.2024 10:15").is_some());
        assert_eq!(
            parse_timestamp("01/05/2024").unwrap().to_rfc3339(),
            "2024-05-01T00:00:00+00:00"
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_parse_decimal_variants() {
        assert_eq!(parse_decimal(&json!("1 234.00")), Some(dec("1234.00")));
        assert_eq!(parse_decimal(&json!("1,234.00")), Some(dec("1234.00")));
        assert_eq!(parse_decimal(&json!(3)), Some(dec("3")));
        assert_eq!(parse_decimal(&json!(true)), None);
    }
}
