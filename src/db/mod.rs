//! Database module for NetSentinel.
//!
//! Provides SQLite storage for the published state and the fault event log.

mod models;
mod store;

pub use store::{DbError, Store};
