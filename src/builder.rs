//! RawEntity → SyncDocument transform.
//!
//! [`DocumentBuilder::build`] is pure: it reads the enrichment cache, never
//! writes it, performs no I/O and never consults the clock, so the same
//! entity and cache contents always produce the same document. That is
//! what makes re-delivery after a retry or a crash an idempotent upsert.
//!
//! The builder for each entity type is picked by the record's tag. Missing
//! enrichment never fails a build; the text falls back to a placeholder
//! label instead. A record the builder cannot represent (for instance a
//! ticket without a subject) fails with `SyncError::Malformed`.

use std::cmp::Ordering;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::cache::{AssetProfile, EnrichmentCache};
use crate::document::{Metadata, Owner, Section, SyncDocument};
use crate::error::SyncError;
use crate::models::{Asset, Comment, Customer, EntityType, Invoice, LineItem, RawEntity, Ticket};

const HEAVY_RULE: &str = "==================================================";
const LIGHT_RULE: &str = "------------------------------";

pub const UNKNOWN_CUSTOMER: &str = "Unknown Customer";
pub const UNKNOWN_OWNER: &str = "Unknown Owner";
pub const NO_ASSET: &str = "No asset linked";

#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    web_base: String,
    include_internal_comments: bool,
}

impl DocumentBuilder {
    /// `subdomain` is used for record links (`https://{subdomain}.repairshopr.com/...`).
    pub fn new(subdomain: &str, include_internal_comments: bool) -> Self {
        Self {
            web_base: format!("https://{}.repairshopr.com", subdomain),
            include_internal_comments,
        }
    }

    pub fn build(
        &self,
        entity: &RawEntity,
        cache: &EnrichmentCache,
    ) -> Result<SyncDocument, SyncError> {
        match entity {
            RawEntity::Ticket(t) => self.ticket(t, cache),
            RawEntity::Customer(c) => Ok(self.customer(c)),
            RawEntity::Asset(a) => self.asset(a, cache),
            RawEntity::Invoice(i) => self.invoice(i, cache),
        }
    }

    fn link(&self, entity: EntityType, id: u64) -> String {
        format!("{}/{}/{}", self.web_base, entity.web_path(), id)
    }

    // ============ Tickets ============

    fn ticket(&self, t: &Ticket, cache: &EnrichmentCache) -> Result<SyncDocument, SyncError> {
        let subject = t.subject.trim();
        if subject.is_empty() {
            return Err(malformed(EntityType::Ticket, t.id, "ticket has no subject"));
        }

        let customer = t.customer_id.and_then(|id| cache.customer(id));
        let customer_name = customer
            .as_ref()
            .map(|c| c.name.clone())
            .or_else(|| {
                t.customer_business_then_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string());
        let asset = ticket_asset(t, cache);
        let comments = self.visible_comments(&t.comments);

        let semantic = format!("Ticket #{}: {}", t.number, subject);
        let mut text = String::new();
        let w = &mut text;
        line(w, format_args!("REPAIRSHOPR TICKET #{}", t.number));
        line(w, format_args!("{}", HEAVY_RULE));
        blank(w);
        line(w, format_args!("SUBJECT: {}", subject));
        line(w, format_args!("STATUS: {}", t.status));
        line(w, format_args!("PROBLEM TYPE: {}", or(&t.problem_type, "Not specified")));
        line(w, format_args!("PRIORITY: {}", or(&t.priority, "Normal")));
        blank(w);
        line(w, format_args!("CUSTOMER: {}", customer_name));
        line(w, format_args!("ASSET/DEVICE: {}", asset_label(asset.as_ref())));
        line(w, format_args!("ASSIGNED TO: {}", t.assigned_tech().unwrap_or("Unassigned")));
        line(w, format_args!("LOCATION: {}", or(&t.location_name, "Default")));
        blank(w);
        line(w, format_args!("CREATED: {}", minutes(t.created_at, "N/A")));
        line(w, format_args!("DUE DATE: {}", day(t.due_date, "Not set")));
        line(w, format_args!("RESOLVED: {}", minutes(t.resolved_at, "Not yet")));
        heading(w, "PROBLEM DESCRIPTION:");
        line(w, format_args!("{}", or(&t.problem_description, "No description provided.")));
        heading(w, "RESOLUTION/NOTES:");
        line(w, format_args!("{}", or(&t.resolution, "No resolution recorded yet.")));
        heading(w, "WORK HISTORY / COMMENTS:");
        write_comments(w, &comments);
        heading(w, "PARTS & LABOR:");
        write_line_items(w, &t.line_items);

        if let Some(c) = &customer {
            heading(w, "CUSTOMER DETAILS:");
            line(w, format_args!("Name: {}", c.name));
            line(w, format_args!("Email: {}", or(&c.email, "N/A")));
            line(w, format_args!("Phone: {}", or(&c.phone, "N/A")));
            line(w, format_args!("Address: {}", non_empty(&c.address, "N/A")));
            line(w, format_args!("Notes: {}", or(&c.notes, "None")));
        }
        if let Some(a) = &asset {
            heading(w, "ASSET DETAILS:");
            line(w, format_args!("Name: {}", a.name));
            line(w, format_args!("Type: {}", or(&a.type_name, "Unknown")));
            line(w, format_args!("Serial: {}", or(&a.serial, "N/A")));
            line(w, format_args!("Manufacturer: {}", or(&a.manufacturer, "N/A")));
            line(w, format_args!("Model: {}", or(&a.model, "N/A")));
            line(w, format_args!("OS: {}", or(&a.os, "N/A")));
        }

        let mut meta = Metadata::new();
        meta.put("ticket_id", t.id)
            .put("ticket_number", t.number.as_str())
            .put("status", t.status.as_str())
            .put("problem_type", t.problem_type.as_deref())
            .put("priority", t.priority.as_deref())
            .put("is_resolved", t.is_resolved())
            .put("customer_id", t.customer_id)
            .put("customer_name", customer_name.as_str())
            .put("technician", t.assigned_tech())
            .put("location", t.location_name.as_deref())
            .put("created_at", t.created_at)
            .put("resolved_at", t.resolved_at)
            .put("updated_at", t.updated_at)
            .put("comment_count", comments.len())
            .put("parts_count", t.line_items.len())
            .put("parts_total", round2(t.parts_total()))
            .put("labor_hours", t.labor_hours());
        if let Some(a) = &asset {
            meta.put("asset_id", a.id)
                .put("asset_name", a.name.as_str())
                .put("asset_serial", a.serial.as_deref())
                .put("asset_type", a.type_name.as_deref());
        }

        let primary_owners = t.assigned_tech().map(Owner::named).into_iter().collect();
        let secondary_owners = if customer_name == UNKNOWN_CUSTOMER {
            Vec::new()
        } else {
            vec![Owner::with_email(
                customer_name.as_str(),
                customer.as_ref().and_then(|c| c.email.as_deref()),
            )]
        };

        Ok(SyncDocument {
            id: EntityType::Ticket.doc_id(t.id),
            sections: vec![Section {
                link: self.link(EntityType::Ticket, t.id),
                text: finish(text),
            }],
            title: semantic.clone(),
            semantic_identifier: semantic,
            metadata: meta,
            doc_updated_at: t.updated_at,
            primary_owners,
            secondary_owners,
        })
    }

    /// Comments in chronological order, internal ones only when configured.
    fn visible_comments<'c>(&self, comments: &'c [Comment]) -> Vec<&'c Comment> {
        let mut visible: Vec<&Comment> = comments
            .iter()
            .filter(|c| self.include_internal_comments || !c.hidden)
            .collect();
        visible.sort_by(|a, b| match a.created_at.cmp(&b.created_at) {
            Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        });
        visible
    }

    // ============ Customers ============

    fn customer(&self, c: &Customer) -> SyncDocument {
        let name = c.full_name();
        let semantic = format!("Customer: {}", name);
        let address = c.full_address();

        let mut text = String::new();
        let w = &mut text;
        line(w, format_args!("REPAIRSHOPR CUSTOMER PROFILE"));
        line(w, format_args!("{}", HEAVY_RULE));
        blank(w);
        line(w, format_args!("NAME: {}", name));
        line(w, format_args!("BUSINESS: {}", or(&c.business_name, "Individual")));
        heading(w, "CONTACT INFORMATION:");
        line(w, format_args!("Email: {}", or(&c.email, "Not provided")));
        line(w, format_args!("Phone: {}", or(&c.phone, "Not provided")));
        line(w, format_args!("Mobile: {}", or(&c.mobile, "Not provided")));
        heading(w, "ADDRESS:");
        line(w, format_args!("{}", non_empty(&address, "No address on file")));
        heading(w, "NOTES:");
        line(w, format_args!("{}", or(&c.notes, "No notes recorded.")));
        heading(w, "PREFERENCES:");
        line(
            w,
            format_args!(
                "SMS Notifications: {}",
                if c.get_sms { "Enabled" } else { "Disabled" }
            ),
        );
        line(
            w,
            format_args!("Email Opt-Out: {}", if c.opt_out { "Yes" } else { "No" }),
        );
        if !c.contacts.is_empty() {
            heading(w, "ADDITIONAL CONTACTS:");
            for contact in &c.contacts {
                line(
                    w,
                    format_args!(
                        "  - {}: {} {}",
                        or(&contact.name, "Unnamed"),
                        contact.email.as_deref().unwrap_or(""),
                        contact.phone.as_deref().unwrap_or("")
                    ),
                );
            }
        }

        let mut meta = Metadata::new();
        meta.put("customer_id", c.id)
            .put("customer_name", name.as_str())
            .put("business_name", c.business_name.as_deref())
            .put("email", c.email.as_deref())
            .put("phone", c.best_phone())
            .put("city", c.city.as_deref())
            .put("state", c.state.as_deref())
            .put("created_at", c.created_at)
            .put("updated_at", c.updated_at);

        SyncDocument {
            id: EntityType::Customer.doc_id(c.id),
            sections: vec![Section {
                link: self.link(EntityType::Customer, c.id),
                text: finish(text),
            }],
            title: semantic.clone(),
            semantic_identifier: semantic,
            metadata: meta,
            doc_updated_at: c.updated_at,
            primary_owners: Vec::new(),
            secondary_owners: vec![Owner::with_email(name, c.email.as_deref())],
        }
    }

    // ============ Assets ============

    fn asset(&self, a: &Asset, cache: &EnrichmentCache) -> Result<SyncDocument, SyncError> {
        let name = a.name.trim();
        if name.is_empty() {
            return Err(malformed(EntityType::Asset, a.id, "asset has no name"));
        }
        let mut semantic = format!("Asset: {}", name);
        if let Some(serial) = nonblank(&a.asset_serial) {
            let _ = write!(semantic, " ({})", serial);
        }
        let owner = a
            .customer_id
            .and_then(|id| cache.customer(id))
            .map(|c| c.name);
        let owner_name = owner.as_deref().unwrap_or(UNKNOWN_OWNER);
        let (manufacturer, model, os) = (a.manufacturer(), a.model(), a.operating_system());

        let mut text = String::new();
        let w = &mut text;
        line(w, format_args!("REPAIRSHOPR ASSET/DEVICE"));
        line(w, format_args!("{}", HEAVY_RULE));
        blank(w);
        line(w, format_args!("NAME: {}", name));
        line(w, format_args!("TYPE: {}", or(&a.asset_type_name, "Unknown")));
        line(w, format_args!("SERIAL NUMBER: {}", or(&a.asset_serial, "N/A")));
        heading(w, "SPECIFICATIONS:");
        line(w, format_args!("Manufacturer: {}", or(&manufacturer, "N/A")));
        line(w, format_args!("Model: {}", or(&model, "N/A")));
        line(w, format_args!("Operating System: {}", or(&os, "N/A")));
        heading(w, "OWNER:");
        line(w, format_args!("Customer: {}", owner_name));
        blank(w);
        line(w, format_args!("CREATED: {}", day(a.created_at, "N/A")));

        let extra: Vec<(&String, String)> = a
            .properties
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.to_ascii_lowercase().as_str(),
                    "manufacturer" | "model" | "os" | "operating system"
                )
            })
            .filter_map(|(k, v)| property_text(v).map(|t| (k, t)))
            .collect();
        if !extra.is_empty() {
            heading(w, "ADDITIONAL PROPERTIES:");
            for (k, v) in extra {
                line(w, format_args!("  {}: {}", k, v));
            }
        }

        let mut meta = Metadata::new();
        meta.put("asset_id", a.id)
            .put("asset_name", name)
            .put("asset_serial", a.asset_serial.as_deref())
            .put("asset_type", a.asset_type_name.as_deref())
            .put("customer_id", a.customer_id)
            .put("customer_name", owner_name)
            .put("manufacturer", manufacturer)
            .put("model", model)
            .put("created_at", a.created_at)
            .put("updated_at", a.updated_at);

        Ok(SyncDocument {
            id: EntityType::Asset.doc_id(a.id),
            sections: vec![Section {
                link: self.link(EntityType::Asset, a.id),
                text: finish(text),
            }],
            title: semantic.clone(),
            semantic_identifier: semantic,
            metadata: meta,
            doc_updated_at: a.updated_at,
            primary_owners: Vec::new(),
            secondary_owners: owner.map(Owner::named).into_iter().collect(),
        })
    }

    // ============ Invoices ============

    fn invoice(&self, i: &Invoice, cache: &EnrichmentCache) -> Result<SyncDocument, SyncError> {
        let number = i.number.trim();
        if number.is_empty() {
            return Err(malformed(EntityType::Invoice, i.id, "invoice has no number"));
        }
        let customer = i.customer_id.and_then(|id| cache.customer(id));
        let customer_name = customer
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or(UNKNOWN_CUSTOMER);
        let semantic = format!("Invoice #{}", number);

        let mut text = String::new();
        let w = &mut text;
        line(w, format_args!("REPAIRSHOPR INVOICE"));
        line(w, format_args!("{}", HEAVY_RULE));
        blank(w);
        line(w, format_args!("INVOICE #: {}", number));
        line(w, format_args!("DATE: {}", day(i.date, "N/A")));
        line(w, format_args!("STATUS: {}", if i.paid { "PAID" } else { "UNPAID" }));
        blank(w);
        line(w, format_args!("CUSTOMER: {}", customer_name));
        match i.ticket_id {
            Some(tid) => line(w, format_args!("TICKET: #{}", tid)),
            None => line(w, format_args!("No linked ticket")),
        }
        blank(w);
        line(w, format_args!("TOTAL: ${:.2}", i.total));
        line(w, format_args!("BALANCE DUE: ${:.2}", i.balance_due));
        heading(w, "LINE ITEMS:");
        write_line_items(w, &i.line_items);

        let mut meta = Metadata::new();
        meta.put("invoice_id", i.id)
            .put("invoice_number", number)
            .put("customer_id", i.customer_id)
            .put("customer_name", customer_name)
            .put("ticket_id", i.ticket_id)
            .put("total", round2(i.total))
            .put("balance_due", round2(i.balance_due))
            .put("paid", i.paid)
            .put("date", i.date)
            .put("updated_at", i.updated_at);

        let secondary_owners = customer
            .as_ref()
            .map(|c| Owner::with_email(c.name.as_str(), c.email.as_deref()))
            .into_iter()
            .collect();

        Ok(SyncDocument {
            id: EntityType::Invoice.doc_id(i.id),
            sections: vec![Section {
                link: self.link(EntityType::Invoice, i.id),
                text: finish(text),
            }],
            title: semantic.clone(),
            semantic_identifier: semantic,
            metadata: meta,
            doc_updated_at: i.updated_at,
            primary_owners: Vec::new(),
            secondary_owners,
        })
    }
}

/// Linked asset from the cache, else the linked asset's own summary, else
/// the customer's first known asset.
fn ticket_asset(t: &Ticket, cache: &EnrichmentCache) -> Option<AssetProfile> {
    if let Some(linked) = t.assets.first() {
        return cache.asset(linked.id).or_else(|| {
            Some(AssetProfile {
                id: linked.id,
                customer_id: t.customer_id,
                name: linked
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Asset #{}", linked.id)),
                serial: linked.asset_serial.clone(),
                type_name: None,
                manufacturer: None,
                model: None,
                os: None,
            })
        });
    }
    t.customer_id.and_then(|id| cache.asset_for_customer(id))
}

fn asset_label(asset: Option<&AssetProfile>) -> String {
    let Some(a) = asset else {
        return NO_ASSET.to_string();
    };
    let mut label = a.name.clone();
    if let Some(serial) = nonblank(&a.serial) {
        let _ = write!(label, " (Serial: {})", serial);
    }
    let make = [a.manufacturer.as_deref(), a.model.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if !make.is_empty() {
        let _ = write!(label, " - {}", make);
    }
    label
}

fn write_comments(w: &mut String, comments: &[&Comment]) {
    if comments.is_empty() {
        line(w, format_args!("No comments recorded."));
        return;
    }
    for c in comments {
        let visibility = if c.hidden { "[INTERNAL] " } else { "" };
        line(
            w,
            format_args!(
                "--- {}{} by {} ---",
                visibility,
                minutes(c.created_at, "N/A"),
                c.tech.as_deref().unwrap_or("System")
            ),
        );
        if let Some(subject) = nonblank(&c.subject) {
            line(w, format_args!("Subject: {}", subject));
        }
        if let Some(body) = nonblank(&c.body) {
            line(w, format_args!("{}", body));
        }
        blank(w);
    }
}

fn write_line_items(w: &mut String, items: &[LineItem]) {
    if items.is_empty() {
        line(w, format_args!("No parts or labor recorded."));
        return;
    }
    let mut total = 0.0;
    for item in items {
        let item_total = item.total();
        total += item_total;
        line(
            w,
            format_args!(
                "  - {}x {} @ ${:.2} = ${:.2}",
                item.quantity, item.name, item.price, item_total
            ),
        );
    }
    line(w, format_args!("  TOTAL: ${:.2}", total));
}

// ============ Text helpers ============

fn line(w: &mut String, args: std::fmt::Arguments<'_>) {
    let _ = w.write_fmt(args);
    w.push('\n');
}

fn blank(w: &mut String) {
    w.push('\n');
}

fn heading(w: &mut String, title: &str) {
    blank(w);
    w.push_str(title);
    w.push('\n');
    w.push_str(LIGHT_RULE);
    w.push('\n');
}

fn finish(mut text: String) -> String {
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
    text
}

fn nonblank(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn or<'s>(s: &'s Option<String>, fallback: &'s str) -> &'s str {
    nonblank(s).unwrap_or(fallback)
}

fn non_empty<'s>(s: &'s str, fallback: &'s str) -> &'s str {
    if s.trim().is_empty() {
        fallback
    } else {
        s
    }
}

fn minutes(t: Option<DateTime<Utc>>, fallback: &str) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn day(t: Option<DateTime<Utc>>, fallback: &str) -> String {
    t.map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn property_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

fn malformed(entity: EntityType, id: u64, reason: &str) -> SyncError {
    SyncError::Malformed {
        entity,
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CustomerProfile, EnrichmentRecord};
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    fn cache() -> EnrichmentCache {
        EnrichmentCache::new(NonZeroUsize::new(100).unwrap(), Duration::from_secs(3600))
    }

    fn acme() -> Customer {
        serde_json::from_value(json!({
            "id": 100,
            "business_name": "Acme Corp",
            "email": "ops@acme.test",
            "phone": "555-0100",
            "city": "Springfield",
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn ticket(id: u64) -> RawEntity {
        RawEntity::parse(
            EntityType::Ticket,
            json!({
                "id": id,
                "number": 1000 + id,
                "subject": "Laptop will not boot",
                "status": "Resolved",
                "customer_id": 100,
                "user": {"full_name": "Sam Tech"},
                "updated_at": "2024-03-01T12:00:00Z",
                "comments": [
                    {"id": 2, "body": "Replaced SSD", "tech": "Sam",
                     "created_at": "2024-03-01T11:00:00Z"},
                    {"id": 1, "body": "Customer is rude", "hidden": true,
                     "created_at": "2024-03-01T10:00:00Z"},
                    {"id": 3, "body": "Picked up", "created_at": "2024-03-01T11:30:00Z"}
                ],
                "line_items": [{"name": "SSD 512GB", "quantity": 1, "price": 79.5}]
            }),
        )
        .unwrap()
    }

    fn builder() -> DocumentBuilder {
        DocumentBuilder::new("acme", false)
    }

    #[test]
    fn ticket_is_enriched_from_cache() {
        let c = cache();
        c.preload([EnrichmentRecord::Customer(CustomerProfile::from(&acme()))]);
        let doc = builder().build(&ticket(1), &c).unwrap();

        assert_eq!(doc.id, "rs_ticket_1");
        assert_eq!(doc.semantic_identifier, "Ticket #1001: Laptop will not boot");
        assert_eq!(doc.sections[0].link, "https://acme.repairshopr.com/tickets/1");
        let text = &doc.sections[0].text;
        assert!(text.contains("CUSTOMER: Acme Corp"));
        assert!(text.contains("Email: ops@acme.test"));
        assert!(text.contains("  - 1x SSD 512GB @ $79.50 = $79.50"));
        assert_eq!(doc.metadata.get("customer_name"), Some("Acme Corp"));
        assert_eq!(doc.metadata.get("is_resolved"), Some("true"));
        assert_eq!(doc.metadata.get("parts_total"), Some("79.5"));
        assert_eq!(doc.primary_owners, vec![Owner::named("Sam Tech")]);
        assert_eq!(doc.secondary_owners[0].email.as_deref(), Some("ops@acme.test"));
    }

    #[test]
    fn internal_comments_excluded_by_default() {
        let c = cache();
        let doc = builder().build(&ticket(1), &c).unwrap();
        let text = &doc.sections[0].text;
        assert!(!text.contains("Customer is rude"));
        assert_eq!(doc.metadata.get("comment_count"), Some("2"));
        // chronological
        assert!(text.find("Replaced SSD").unwrap() < text.find("Picked up").unwrap());

        let doc = DocumentBuilder::new("acme", true).build(&ticket(1), &c).unwrap();
        assert!(doc.sections[0].text.contains("[INTERNAL] 2024-03-01 10:00 by System"));
    }

    #[test]
    fn cache_miss_uses_placeholders() {
        let doc = builder().build(&ticket(2), &cache()).unwrap();
        let text = &doc.sections[0].text;
        assert!(text.contains(&format!("CUSTOMER: {}", UNKNOWN_CUSTOMER)));
        assert!(text.contains(&format!("ASSET/DEVICE: {}", NO_ASSET)));
        assert!(doc.secondary_owners.is_empty());
        assert!(!doc.metadata.contains_key("asset_id"));
    }

    #[test]
    fn build_is_deterministic() {
        let c = cache();
        c.preload([EnrichmentRecord::Customer(CustomerProfile::from(&acme()))]);
        let b = builder();
        let e = ticket(3);
        let first = b.build(&e, &c).unwrap();
        let second = b.build(&e, &c).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.to_ingestion_body(Some("ingestion_api")).to_string(),
            second.to_ingestion_body(Some("ingestion_api")).to_string()
        );
    }

    #[test]
    fn blank_subject_is_malformed() {
        let e = RawEntity::parse(
            EntityType::Ticket,
            json!({"id": 5, "number": 5, "subject": "  ", "updated_at": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        let err = builder().build(&e, &cache()).unwrap_err();
        assert!(matches!(err, SyncError::Malformed { .. }));
    }

    #[test]
    fn ticket_falls_back_to_customers_asset() {
        let c = cache();
        let laptop: Asset = serde_json::from_value(json!({
            "id": 55, "name": "ThinkPad", "customer_id": 100, "asset_serial": "SN1",
            "properties": {"Manufacturer": "Lenovo", "Model": "T14"},
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        c.preload([EnrichmentRecord::Asset(AssetProfile::from(&laptop))]);
        let doc = builder().build(&ticket(1), &c).unwrap();
        assert!(doc.sections[0]
            .text
            .contains("ASSET/DEVICE: ThinkPad (Serial: SN1) - Lenovo T14"));
        assert_eq!(doc.metadata.get("asset_id"), Some("55"));
    }

    #[test]
    fn asset_and_invoice_documents() {
        let c = cache();
        c.preload([EnrichmentRecord::Customer(CustomerProfile::from(&acme()))]);
        let asset = RawEntity::parse(
            EntityType::Asset,
            json!({"id": 9, "name": "iPhone", "asset_serial": "F2L", "customer_id": 100,
                   "properties": {"Color": "Black", "os": "iOS"},
                   "updated_at": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        let doc = builder().build(&asset, &c).unwrap();
        assert_eq!(doc.semantic_identifier, "Asset: iPhone (F2L)");
        assert!(doc.sections[0].text.contains("  Color: Black"));
        assert!(doc.sections[0].text.contains("Operating System: iOS"));
        assert_eq!(doc.secondary_owners, vec![Owner::named("Acme Corp")]);

        let invoice = RawEntity::parse(
            EntityType::Invoice,
            json!({"id": 3, "number": "INV-3", "customer_id": 100, "paid": true,
                   "total": "120.00", "updated_at": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        let doc = builder().build(&invoice, &c).unwrap();
        assert_eq!(doc.id, "rs_invoice_3");
        assert!(doc.sections[0].text.contains("STATUS: PAID"));
        assert!(doc.sections[0].text.contains("No linked ticket"));
        assert_eq!(doc.metadata.get("total"), Some("120"));
    }

    #[test]
    fn customer_document() {
        let doc = builder().build(&RawEntity::Customer(acme()), &cache()).unwrap();
        assert_eq!(doc.id, "rs_customer_100");
        assert_eq!(doc.title, "Customer: Acme Corp");
        assert!(doc.sections[0].text.contains("ADDRESS:\n------------------------------\nSpringfield"));
        assert_eq!(doc.metadata.get("phone"), Some("555-0100"));
    }
}
