//! Kit domain model.
//!
//! # Responsibility
//! - Define the kit aggregate and the status history entries it owns.
//!
//! # Invariants
//! - Every domain object is identified by a stable UUID surrogate key.
//! - Child entries refer to their kit by id only; the kit owns the entries.

pub mod kit;
