//! Repository layer contracts and persistence implementations.
//!
//! # Responsibility
//! - Define the kit data access contract and the deferred history seam.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository writes enforce `Kit::validate()` before persistence.
//! - Empty query results are empty vectors, never errors.

pub mod kit_repo;
