//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into transaction-scoped use cases.
//! - Keep CLI callers decoupled from storage and session details.

pub mod kit_service;
