//! Core data models for the map-layer service.
//!
//! Map records map to database rows via `sqlx::FromRow` and serialize as JSON
//! via `serde`. Upload types describe the transient staging state.

pub mod map_record;
pub mod upload;
