//! # FHIR Harness Core
//!
//! Shared, runtime-free logic for FHIR Harness: data models, JSON-aware
//! chunking, resource metadata extraction, hybrid rank fusion, the store
//! abstraction, and the provider traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Everything here is deterministic and testable
//! without a database or a network.

pub mod chunk;
pub mod fusion;
pub mod metadata;
pub mod models;
pub mod provider;
pub mod store;
