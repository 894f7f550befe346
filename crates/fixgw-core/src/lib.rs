//! # fixgw-core
//!
//! Item store and data model for the fixgw gateway.
//!
//! This crate provides:
//! - Data model types (item definitions, typed values, quality flags)
//! - The in-memory item store with per-item locking and change callbacks
//! - Gateway configuration types and loading
//!
//! This crate is intentionally runtime-agnostic and contains no async code;
//! the server and cluster crates drive it from tokio tasks.

pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use error::StoreError;
pub use model::*;
pub use store::{Handler, Item, ItemStore, UpdateHandler};
