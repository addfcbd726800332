//! Destination-bound documents and their wire form.
//!
//! A [`SyncDocument`] is what the Onyx ingestion API receives for exactly
//! one source record. Metadata is normalised at insertion time through
//! [`Metadata::put`], so a built document only ever holds string values:
//!
//! | Input | Stored as |
//! |-------|-----------|
//! | `null` / `None` | omitted |
//! | `bool` | `"true"` / `"false"` |
//! | integer / float | decimal string |
//! | string | unchanged |
//!
//! The source tag is only sent when it belongs to the destination's known
//! `DocumentSource` vocabulary; anything else is dropped before the request.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Source tags the destination accepts without schema rejection.
pub const KNOWN_SOURCE_TAGS: &[&str] = &["ingestion_api", "not_applicable", "file", "web"];

/// One text body with the link it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub link: String,
    pub text: String,
}

/// Ownership attribution (`BasicExpertInfo` on the destination side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub display_name: String,
    pub email: Option<String>,
}

impl Owner {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            email: None,
        }
    }

    pub fn with_email(display_name: impl Into<String>, email: Option<&str>) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.map(str::to_string),
        }
    }
}

/// A scalar before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    /// The destination's accepted representation, `None` when the value
    /// must not be sent.
    pub fn normalize(self) -> Option<String> {
        match self {
            MetaValue::Null => None,
            MetaValue::Bool(b) => Some(if b { "true" } else { "false" }.to_string()),
            MetaValue::Int(i) => Some(i.to_string()),
            MetaValue::Float(f) if f.is_finite() => Some(f.to_string()),
            MetaValue::Float(_) => None,
            MetaValue::Text(s) => Some(s),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(MetaValue::Int)
            .unwrap_or_else(|_| MetaValue::Text(v.to_string()))
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::from(v as u64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<&String> for MetaValue {
    fn from(v: &String) -> Self {
        MetaValue::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for MetaValue {
    fn from(v: DateTime<Utc>) -> Self {
        MetaValue::Text(v.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl<T: Into<MetaValue>> From<Option<T>> for MetaValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(MetaValue::Null)
    }
}

/// Flat, ordered metadata with values already normalised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, dropping it when it normalises to nothing.
    pub fn put(&mut self, key: &str, value: impl Into<MetaValue>) -> &mut Self {
        match value.into().normalize() {
            Some(v) => {
                self.0.insert(key.to_string(), v);
            }
            None => {
                self.0.remove(key);
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The destination-bound representation of exactly one source record.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncDocument {
    /// `{type-prefix}{source-id}`, stable across runs.
    pub id: String,
    pub sections: Vec<Section>,
    pub semantic_identifier: String,
    pub title: String,
    pub metadata: Metadata,
    pub doc_updated_at: DateTime<Utc>,
    pub primary_owners: Vec<Owner>,
    pub secondary_owners: Vec<Owner>,
}

#[derive(Serialize)]
struct WireDocument<'a> {
    id: &'a str,
    sections: &'a [Section],
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    semantic_identifier: &'a str,
    title: &'a str,
    metadata: &'a Metadata,
    doc_updated_at: String,
    primary_owners: &'a [Owner],
    secondary_owners: &'a [Owner],
    from_ingestion_api: bool,
}

#[derive(Serialize)]
struct IngestionRequest<'a> {
    document: WireDocument<'a>,
}

impl SyncDocument {
    /// Request body for `POST /onyx-api/ingestion`.
    pub fn to_ingestion_body(&self, source_tag: Option<&str>) -> serde_json::Value {
        let source = source_tag.filter(|t| KNOWN_SOURCE_TAGS.contains(t));
        let body = IngestionRequest {
            document: WireDocument {
                id: &self.id,
                sections: &self.sections,
                source,
                semantic_identifier: &self.semantic_identifier,
                title: &self.title,
                metadata: &self.metadata,
                doc_updated_at: self
                    .doc_updated_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                primary_owners: &self.primary_owners,
                secondary_owners: &self.secondary_owners,
                from_ingestion_api: true,
            },
        };
        // Plain structs of strings and bools always serialise.
        serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
    }

    /// Total characters across sections.
    pub fn content_len(&self) -> usize {
        self.sections.iter().map(|s| s.text.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc() -> SyncDocument {
        let mut metadata = Metadata::new();
        metadata
            .put("ticket_number", 1042u64)
            .put("is_resolved", false)
            .put("parts_total", 12.5)
            .put("technician", None::<String>)
            .put("status", "Open");
        SyncDocument {
            id: "rs_ticket_7".into(),
            sections: vec![Section {
                link: "https://acme.repairshopr.com/tickets/7".into(),
                text: "body".into(),
            }],
            semantic_identifier: "Ticket #1042: Screen".into(),
            title: "Ticket #1042: Screen".into(),
            metadata,
            doc_updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
            primary_owners: vec![],
            secondary_owners: vec![Owner::named("Acme")],
        }
    }

    #[test]
    fn metadata_is_normalized() {
        let d = doc();
        assert_eq!(d.metadata.get("ticket_number"), Some("1042"));
        assert_eq!(d.metadata.get("is_resolved"), Some("false"));
        assert_eq!(d.metadata.get("parts_total"), Some("12.5"));
        assert!(!d.metadata.contains_key("technician"));
    }

    #[test]
    fn unknown_source_tag_is_omitted() {
        let d = doc();
        let body = d.to_ingestion_body(Some("REPAIRSHOPR"));
        assert!(body["document"].get("source").is_none());
        let body = d.to_ingestion_body(Some("ingestion_api"));
        assert_eq!(body["document"]["source"], "ingestion_api");
        assert_eq!(body["document"]["doc_updated_at"], "2024-03-01T15:00:00Z");
        assert_eq!(body["document"]["from_ingestion_api"], true);
        assert_eq!(body["document"]["metadata"]["status"], "Open");
    }
}
