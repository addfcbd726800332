//! Bounded enrichment cache.
//!
//! Tickets and invoices reference customers and assets by id. Instead of
//! one rate-limited lookup per reference, the engine preloads the reduced
//! [`EnrichmentRecord`] projections in bulk and resolves every reference
//! from memory.
//!
//! Entries live in a single [`lru::LruCache`] keyed by `(EntityType, id)`:
//!
//! - capacity pressure evicts the least-recently-used entry on insert,
//! - entries past their TTL are treated as absent on read and dropped then
//!   (no background sweep; [`EnrichmentCache::purge_expired`] exists for
//!   callers that want one),
//! - lookups never perform I/O and only ever wait on the internal lock.
//!
//! A secondary customer → asset index supports enriching tickets that carry
//! no asset link with the customer's first known device. It is bounded by
//! the same capacity.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::models::{Asset, Customer, EntityType, RawEntity};

/// Customer fields used to decorate other documents.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerProfile {
    pub id: u64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: String,
    pub notes: Option<String>,
}

impl From<&Customer> for CustomerProfile {
    fn from(c: &Customer) -> Self {
        Self {
            id: c.id,
            name: c.full_name(),
            email: c.email.clone(),
            phone: c.best_phone().map(str::to_string),
            address: c.full_address(),
            notes: c.notes.clone(),
        }
    }
}

/// Asset fields used to decorate other documents.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetProfile {
    pub id: u64,
    pub customer_id: Option<u64>,
    pub name: String,
    pub serial: Option<String>,
    pub type_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
}

impl From<&Asset> for AssetProfile {
    fn from(a: &Asset) -> Self {
        Self {
            id: a.id,
            customer_id: a.customer_id,
            name: a.name.clone(),
            serial: a.asset_serial.clone(),
            type_name: a.asset_type_name.clone(),
            manufacturer: a.manufacturer(),
            model: a.model(),
            os: a.operating_system(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentRecord {
    Customer(CustomerProfile),
    Asset(AssetProfile),
}

impl EnrichmentRecord {
    /// Projection of a customer or asset; other types enrich nothing.
    pub fn from_entity(entity: &RawEntity) -> Option<Self> {
        match entity {
            RawEntity::Customer(c) => Some(EnrichmentRecord::Customer(c.into())),
            RawEntity::Asset(a) => Some(EnrichmentRecord::Asset(a.into())),
            RawEntity::Ticket(_) | RawEntity::Invoice(_) => None,
        }
    }

    pub fn key(&self) -> CacheKey {
        match self {
            EnrichmentRecord::Customer(c) => CacheKey::new(EntityType::Customer, c.id),
            EnrichmentRecord::Asset(a) => CacheKey::new(EntityType::Asset, a.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: EntityType,
    pub id: u64,
}

impl CacheKey {
    pub fn new(entity: EntityType, id: u64) -> Self {
        Self { entity, id }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    record: EnrichmentRecord,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    owner_index: LruCache<u64, u64>,
    stats: CacheStats,
}

pub struct EnrichmentCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl EnrichmentCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                owner_index: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bulk insert; every record expires `ttl` from now.
    pub fn preload<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = EnrichmentRecord>,
    {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut inner = self.lock();
        let mut n = 0;
        for record in records {
            inner.insert(record, now, expires_at);
            n += 1;
        }
        debug!(inserted = n, len = inner.entries.len(), "cache preload");
        n
    }

    pub fn insert(&self, record: EnrichmentRecord) {
        let now = Instant::now();
        self.lock().insert(record, now, now + self.ttl);
    }

    /// Live entry for `key`, or `None` when absent or expired.
    pub fn get(&self, key: CacheKey) -> Option<EnrichmentRecord> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.get_live(key, now)
    }

    pub fn customer(&self, id: u64) -> Option<CustomerProfile> {
        match self.get(CacheKey::new(EntityType::Customer, id)) {
            Some(EnrichmentRecord::Customer(c)) => Some(c),
            _ => None,
        }
    }

    pub fn asset(&self, id: u64) -> Option<AssetProfile> {
        match self.get(CacheKey::new(EntityType::Asset, id)) {
            Some(EnrichmentRecord::Asset(a)) => Some(a),
            _ => None,
        }
    }

    /// Earliest-inserted asset of `customer_id` that is still cached.
    ///
    /// Once that asset is evicted or expires, the next asset inserted for the
    /// customer replaces it in the index.
    pub fn asset_for_customer(&self, customer_id: u64) -> Option<AssetProfile> {
        let asset_id = {
            let mut inner = self.lock();
            inner.owner_index.get(&customer_id).copied()
        }?;
        self.asset(asset_id)
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.stats.expired += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            len: inner.entries.len(),
            ..inner.stats
        }
    }
}

impl Inner {
    fn insert(&mut self, record: EnrichmentRecord, now: Instant, expires_at: Instant) {
        let key = record.key();
        if let EnrichmentRecord::Asset(a) = &record {
            if let Some(owner) = a.customer_id {
                // Keep the indexed asset while it is still cached; otherwise this one takes over.
                let indexed_live = self.owner_index.peek(&owner).is_some_and(|id| {
                    self.entries
                        .peek(&CacheKey::new(EntityType::Asset, *id))
                        .is_some_and(|e| e.expires_at > now)
                });
                if !indexed_live {
                    self.owner_index.put(owner, a.id);
                }
            }
        }
        // push hands back either the replaced value (same key) or the LRU victim.
        if let Some((old_key, _)) = self.entries.push(key, Entry { record, expires_at }) {
            if old_key != key {
                self.stats.evictions += 1;
            }
        }
    }

    fn get_live(&mut self, key: CacheKey, now: Instant) -> Option<EnrichmentRecord> {
        let expired = match self.entries.get(&key) {
            Some(entry) if entry.expires_at > now => {
                self.stats.hits += 1;
                return Some(entry.record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(&key);
            self.stats.expired += 1;
        }
        self.stats.misses += 1;
        None
    }
}
