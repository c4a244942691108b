//! Core data models for the TripBasket media service.
//!
//! Buckets and objects map onto SQLite tables via `sqlx::FromRow`; documents
//! and optimizer reports serialize as JSON via `serde`.

pub mod bucket;
pub mod document;
pub mod metadata;
pub mod object;
pub mod optimization;
