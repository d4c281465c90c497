//! Job persistence on SQLite.
//!
//! - `model`: the row shape stored in the `jobs` table.
//! - `repo`: SQL-only functions mapping rows to and from [`crate::model::Job`].

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::JobRow;
