//! Diagnosis module: batch model, latency history, router scoring and the
//! layered fault-attribution engine. Nothing here performs I/O.

mod engine;
mod history;
mod models;
mod score;

pub use engine::*;
pub use history::*;
pub use models::*;
pub use score::*;

#[cfg(test)]
pub(crate) use models::fixtures;
