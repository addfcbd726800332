//! # rs-onyx-bridge
//!
//! Resumable, rate-limited sync of RepairShopr records (customers, assets,
//! tickets, invoices) into an Onyx ingestion API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ RepairShopr  │──▶│ PageStream │──▶│  Document    │──▶│    Onyx      │
//! │ (RateBudget) │   │  + dedup   │   │  Builder     │   │  ingestion   │
//! └──────────────┘   └────────────┘   └──────┬───────┘   └──────┬───────┘
//!                                            │                  │
//!                                     ┌──────┴──────┐   ┌───────┴──────┐
//!                                     │ Enrichment  │   │  Checkpoint  │
//!                                     │   Cache     │   │  (file/sql)  │
//!                                     └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export RS_SUBDOMAIN=acme RS_API_KEY=... ONYX_API_URL=http://onyx:8080 ONYX_API_KEY=...
//! rs-onyx check                 # verify RepairShopr credentials
//! rs-onyx sync                  # full run, or resume / incremental
//! rs-onyx status                # inspect the checkpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Entity types and source payloads |
//! | [`document`] | Destination document and wire form |
//! | [`builder`] | Entity → document transform |
//! | [`rate_limit`] | Token bucket for the source API |
//! | [`cache`] | Bounded LRU + TTL enrichment cache |
//! | [`checkpoint`] | Resume state and the JSON file store |
//! | [`sqlite_store`] | SQLite checkpoint store |
//! | [`retry`] | Backoff policy shared by both legs |
//! | [`source`] | RepairShopr client |
//! | [`fetcher`] | Restartable pagination with dedup |
//! | [`destination`] | Onyx client and batch delivery |
//! | [`sync`] | Orchestrator |

pub mod builder;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod destination;
pub mod document;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod models;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod sqlite_store;
pub mod status;
pub mod sync;
