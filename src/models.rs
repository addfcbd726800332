//! Source records as they arrive from RepairShopr.
//!
//! A [`RawEntity`] is a tagged variant over the four synchronised entity
//! types. Each variant carries the type-specific payload parsed from the
//! list endpoints; the [`EntityType`] tag drives everything downstream
//! (document id prefix, endpoint path, response key, builder lookup).
//!
//! Records are immutable once parsed. A changed record is simply fetched
//! again with a newer `updated_at`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SyncError;

/// One of the fixed record categories, in phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    Asset,
    Ticket,
    Invoice,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Customer,
        EntityType::Asset,
        EntityType::Ticket,
        EntityType::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::Asset => "asset",
            EntityType::Ticket => "ticket",
            EntityType::Invoice => "invoice",
        }
    }

    /// Document id prefix. Distinct per type so ids never collide.
    pub fn doc_prefix(&self) -> &'static str {
        match self {
            EntityType::Customer => "rs_customer_",
            EntityType::Asset => "rs_asset_",
            EntityType::Ticket => "rs_ticket_",
            EntityType::Invoice => "rs_invoice_",
        }
    }

    /// List endpoint relative to the API base.
    pub fn list_path(&self) -> &'static str {
        match self {
            EntityType::Customer => "/customers.json",
            EntityType::Asset => "/customer_assets.json",
            EntityType::Ticket => "/tickets.json",
            EntityType::Invoice => "/invoices.json",
        }
    }

    /// Key under which list responses carry their items.
    pub fn response_key(&self) -> &'static str {
        match self {
            EntityType::Customer => "customers",
            EntityType::Asset => "assets",
            EntityType::Ticket => "tickets",
            EntityType::Invoice => "invoices",
        }
    }

    /// Path segment of the record's page in the web UI.
    pub fn web_path(&self) -> &'static str {
        match self {
            EntityType::Customer => "customers",
            EntityType::Asset => "customer_assets",
            EntityType::Ticket => "tickets",
            EntityType::Invoice => "invoices",
        }
    }

    pub fn doc_id(&self, id: u64) -> String {
        format!("{}{}", self.doc_prefix(), id)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Payloads ============

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Customer {
    pub id: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub get_sms: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub opt_out: bool,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl Customer {
    /// Business name, else first + last name, else `Customer #{id}`.
    pub fn full_name(&self) -> String {
        if let Some(b) = non_blank(&self.business_name) {
            return b.to_string();
        }
        let parts: Vec<&str> = [&self.firstname, &self.lastname]
            .into_iter()
            .filter_map(non_blank)
            .collect();
        if parts.is_empty() {
            format!("Customer #{}", self.id)
        } else {
            parts.join(" ")
        }
    }

    /// Street lines followed by `city, state, zip`; empty when nothing is on file.
    pub fn full_address(&self) -> String {
        let locality: Vec<&str> = [&self.city, &self.state, &self.zip]
            .into_iter()
            .filter_map(non_blank)
            .collect();
        let locality = locality.join(", ");
        [non_blank(&self.address), non_blank(&self.address_2)]
            .into_iter()
            .flatten()
            .chain((!locality.is_empty()).then_some(locality.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn best_phone(&self) -> Option<&str> {
        non_blank(&self.phone).or_else(|| non_blank(&self.mobile))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub name: String,
    #[serde(default)]
    pub customer_id: Option<u64>,
    #[serde(default)]
    pub asset_serial: Option<String>,
    #[serde(default)]
    pub asset_type_name: Option<String>,
    /// Free-form properties; kept ordered so rendering is deterministic.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Asset {
    pub fn manufacturer(&self) -> Option<String> {
        self.property(&["manufacturer", "Manufacturer"])
    }

    pub fn model(&self) -> Option<String> {
        self.property(&["model", "Model"])
    }

    pub fn operating_system(&self) -> Option<String> {
        self.property(&["os", "Operating System"])
    }

    fn property(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.properties.get(*k))
            .find_map(scalar_text)
    }
}

/// Assets embedded in a ticket payload carry only a subset of fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkedAsset {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub asset_serial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tech: Option<String>,
    /// Internal, not visible to the customer.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub hidden: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LineItem {
    pub name: String,
    #[serde(default = "one", deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default)]
    pub item: Option<String>,
}

fn one() -> f64 {
    1.0
}

impl LineItem {
    pub fn total(&self) -> f64 {
        self.quantity * self.price
    }

    pub fn is_labor(&self) -> bool {
        let mentions = |s: &str| s.to_ascii_lowercase().contains("labor");
        mentions(&self.name) || self.item.as_deref().is_some_and(mentions)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TechRef {
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ticket {
    pub id: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    pub subject: String,
    #[serde(default, deserialize_with = "ticket_status")]
    pub status: String,
    #[serde(default)]
    pub problem_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub customer_id: Option<u64>,
    #[serde(default)]
    pub customer_business_then_name: Option<String>,
    #[serde(default)]
    pub user: Option<TechRef>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default, alias = "problem_type_description")]
    pub problem_description: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub assets: Vec<LinkedAsset>,
}

impl Ticket {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "resolved" | "closed" | "completed" | "invoiced"
        )
    }

    pub fn assigned_tech(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|u| u.full_name.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn parts_total(&self) -> f64 {
        self.line_items.iter().map(LineItem::total).sum()
    }

    pub fn labor_hours(&self) -> f64 {
        self.line_items
            .iter()
            .filter(|li| li.is_labor())
            .map(|li| li.quantity)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Invoice {
    pub id: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(default)]
    pub customer_id: Option<u64>,
    #[serde(default)]
    pub ticket_id: Option<u64>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub paid: bool,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub balance_due: f64,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

// ============ RawEntity ============

/// A source record tagged with its entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEntity {
    Customer(Customer),
    Asset(Asset),
    Ticket(Ticket),
    Invoice(Invoice),
}

impl RawEntity {
    /// Parse one list item. Failures are reported as `Malformed` with the
    /// best id that could be recovered from the raw value.
    pub fn parse(entity: EntityType, value: serde_json::Value) -> Result<Self, SyncError> {
        let id = raw_id(&value);
        let malformed = |e: serde_json::Error| SyncError::Malformed {
            entity,
            id: id.clone().unwrap_or_else(|| "?".to_string()),
            reason: e.to_string(),
        };
        let parsed = match entity {
            EntityType::Customer => {
                RawEntity::Customer(serde_json::from_value(value).map_err(malformed)?)
            }
            EntityType::Asset => RawEntity::Asset(serde_json::from_value(value).map_err(malformed)?),
            EntityType::Ticket => {
                RawEntity::Ticket(serde_json::from_value(value).map_err(malformed)?)
            }
            EntityType::Invoice => {
                RawEntity::Invoice(serde_json::from_value(value).map_err(malformed)?)
            }
        };
        Ok(parsed)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            RawEntity::Customer(_) => EntityType::Customer,
            RawEntity::Asset(_) => EntityType::Asset,
            RawEntity::Ticket(_) => EntityType::Ticket,
            RawEntity::Invoice(_) => EntityType::Invoice,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            RawEntity::Customer(c) => c.id,
            RawEntity::Asset(a) => a.id,
            RawEntity::Ticket(t) => t.id,
            RawEntity::Invoice(i) => i.id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            RawEntity::Customer(c) => c.updated_at,
            RawEntity::Asset(a) => a.updated_at,
            RawEntity::Ticket(t) => t.updated_at,
            RawEntity::Invoice(i) => i.updated_at,
        }
    }

    pub fn doc_id(&self) -> String {
        self.entity_type().doc_id(self.id())
    }
}

/// Best-effort id of an unparsed list item.
pub fn raw_id(value: &serde_json::Value) -> Option<String> {
    match value.get("id")? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

// ============ Lenient field decoding ============

fn non_blank(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn scalar_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(0.0),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("number out of range")),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(0.0),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("not a number: {:?}", s))),
        other => Err(D::Error::custom(format!("expected number, got {}", other))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    })
}

fn ticket_status<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let status = Option::<String>::deserialize(d)?;
    Ok(status
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "New".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ticket_with_defaults() {
        let raw = json!({
            "id": 7,
            "number": 1042,
            "subject": "Screen cracked",
            "status": null,
            "updated_at": "2024-03-01T10:00:00-05:00",
            "comments": [{"id": 1, "body": "hi", "hidden": true}],
            "line_items": [{"name": "Labor", "quantity": "1.5", "price": "60"}]
        });
        let RawEntity::Ticket(t) = RawEntity::parse(EntityType::Ticket, raw).unwrap() else {
            panic!("expected ticket");
        };
        assert_eq!(t.number, "1042");
        assert_eq!(t.status, "New");
        assert_eq!(t.updated_at.to_rfc3339(), "2024-03-01T15:00:00+00:00");
        assert!(t.comments[0].hidden);
        assert_eq!(t.labor_hours(), 1.5);
        assert_eq!(t.parts_total(), 90.0);
    }

    #[test]
    fn bad_timestamp_is_malformed_with_id() {
        let raw = json!({"id": 9, "number": 1, "subject": "x", "updated_at": "yesterday"});
        match RawEntity::parse(EntityType::Ticket, raw) {
            Err(SyncError::Malformed { entity, id, .. }) => {
                assert_eq!(entity, EntityType::Ticket);
                assert_eq!(id, "9");
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn customer_name_fallbacks() {
        let mut c: Customer = serde_json::from_value(json!({
            "id": 100, "updated_at": "2024-01-01T00:00:00Z",
            "firstname": "Ada", "lastname": "Lovelace"
        }))
        .unwrap();
        assert_eq!(c.full_name(), "Ada Lovelace");
        c.business_name = Some("Analytical Engines".into());
        assert_eq!(c.full_name(), "Analytical Engines");
        c.business_name = None;
        c.firstname = None;
        c.lastname = Some("  ".into());
        assert_eq!(c.full_name(), "Customer #100");
    }

    #[test]
    fn asset_property_lookup() {
        let a: Asset = serde_json::from_value(json!({
            "id": 5, "name": "Laptop", "updated_at": "2024-01-01T00:00:00Z",
            "properties": {"Manufacturer": "Lenovo", "model": "T480", "Operating System": "Linux"}
        }))
        .unwrap();
        assert_eq!(a.manufacturer().as_deref(), Some("Lenovo"));
        assert_eq!(a.model().as_deref(), Some("T480"));
        assert_eq!(a.operating_system().as_deref(), Some("Linux"));
    }

    #[test]
    fn doc_ids_are_prefixed_per_type() {
        assert_eq!(EntityType::Ticket.doc_id(1), "rs_ticket_1");
        assert_ne!(EntityType::Customer.doc_id(1), EntityType::Asset.doc_id(1));
    }
}
