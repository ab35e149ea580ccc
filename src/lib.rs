//! # FHIR Harness
//!
//! **A clinical record ingestion and hybrid retrieval service for FHIR bundles.**
//!
//! FHIR Harness ingests hierarchical clinical resources, converts each one
//! into independently retrievable chunks enriched with structured metadata
//! and a dense embedding, and persists them for similarity, keyword, and
//! hybrid retrieval. A multi-strategy query engine (dense, sparse, hybrid,
//! patient timeline, and two-stage rerank) serves ranked chunks back to an
//! agent orchestrator over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌───────────┐
//! │   Parser    │──▶│   Ingestion Queue     │──▶│  SQLite   │
//! │ POST /ingest│   │ journal + workers    │   │ FTS5+vec  │
//! └─────────────┘   │ chunk→meta→embed     │   └─────┬─────┘
//!                   └──────────────────────┘         │
//!                              ┌─────────────────────┤
//!                              ▼                     ▼
//!                      ┌──────────────┐       ┌──────────────┐
//!                      │  Retrieval   │       │    Rerank    │
//!                      │ dense/sparse │──────▶│ cache + xenc │
//!                      │ hybrid/timeln│       └──────────────┘
//!                      └──────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The parser submits resources via `POST /ingest`; submissions are
//!    validated and journaled before acknowledgement ([`queue`]).
//! 2. Workers chunk the resource JSON ([`fhir_harness_core::chunk`]),
//!    extract filterable metadata ([`fhir_harness_core::metadata`]), embed
//!    every chunk ([`providers`]), and commit the batch atomically
//!    ([`store`]). Failures are classified onto a closed error sum and
//!    retried or dead-lettered ([`pipeline`], [`queue`]).
//! 3. The query engine ([`search`]) serves dense, sparse, hybrid, and
//!    patient-timeline retrieval; [`rerank`] adds the cached two-stage
//!    cross-encoder pass.
//! 4. Everything is exposed over HTTP by [`server`] and on the command
//!    line by the `fhx` binary.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`store`] | SQLite chunk store: batch upsert, cosine, BM25, scans |
//! | [`providers`] | HTTP embedding and rerank providers with retry |
//! | [`pipeline`] | Per-item processing: parse → chunk → embed → commit |
//! | [`queue`] | Durable bounded queue: journal, workers, retry, dead letters |
//! | [`search`] | Retrieval engine: dense, sparse, hybrid, timeline |
//! | [`rerank`] | Two-stage rerank orchestrator with LRU/TTL score cache |
//! | [`server`] | Axum HTTP API and stats endpoints |
//! | [`ingest`] | Bundle file ingestion command |
//! | [`stats`] | CLI stats overview |

pub mod config;
pub mod db;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod rerank;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
