//! Database module for streamstress.
//!
//! Saves finished runs and per-worker history to SQLite.

mod models;
mod store;
mod writer;

pub use models::*;
pub use store::*;
pub use writer::*;
