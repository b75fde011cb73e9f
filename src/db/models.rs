//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fault event as read back from the event log.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub event_type: String,
    pub target: String,
    pub code: String,
    pub details: String,
    pub severity: String,
}

