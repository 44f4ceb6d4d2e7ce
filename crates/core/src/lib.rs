//! `stockman-core`: domain primitives shared by the offline sync engine.
//!
//! This crate contains **pure domain** types (no IO, no async): identifiers,
//! the closed set of syncable entity types and mutation operations, and the
//! domain error model.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{EntityType, Operation};
pub use error::DomainError;
pub use id::ActionId;
