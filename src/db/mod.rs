//! Database module: row models and SQL repositories.
//!
//! - `compress`: gzip codec for stored bundle content and binary data.
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions; the native claim and expiry statements live here.
//!
//! External modules import from `notification_archive::db`; the repository API
//! and commonly used models are re-exported.

pub mod compress;
pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ClaimedRecord, OutboxRecord, StoredBinary, StoredBundle};
