//! Publishing of state updates and fault events.
//!
//! The orchestrator only talks to the [`Publisher`] trait. Delivery is best
//! effort: a failed publish is logged by the caller and never retried.

mod log;

pub use log::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::db::DbError;
use crate::diagnosis::{Diagnosis, FaultCode, Severity};

/// Publisher error types.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// Kind of fault transition recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Outage,
    Degraded,
    Recovered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Outage => "OUTAGE",
            EventType::Degraded => "DEGRADED",
            EventType::Recovered => "RECOVERED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Critical,
    Warning,
    Info,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Critical => "CRITICAL",
            EventSeverity::Warning => "WARNING",
            EventSeverity::Info => "INFO",
        }
    }
}

/// One fault transition: a fault raised, or a fault clearing itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultEvent {
    pub time: DateTime<Utc>,
    pub event_type: EventType,
    /// Responsible party, e.g. "YourRouter" or "ISP".
    pub target: String,
    pub code: FaultCode,
    pub details: String,
    pub severity: EventSeverity,
}

impl FaultEvent {
    /// Build the event for a diagnosis that changed the fault code.
    pub fn from_diagnosis(diagnosis: &Diagnosis, time: DateTime<Utc>) -> Self {
        let (event_type, severity) = match diagnosis.severity() {
            Severity::Outage => (EventType::Outage, EventSeverity::Critical),
            Severity::Degraded => (EventType::Degraded, EventSeverity::Warning),
            Severity::None => (EventType::Recovered, EventSeverity::Info),
        };
        Self {
            time,
            event_type,
            target: diagnosis.code.responsible_party().to_string(),
            code: diagnosis.code,
            details: diagnosis.detail.clone(),
            severity,
        }
    }
}

/// Receives state updates and fault events from the orchestrator.
pub trait Publisher: Send + Sync {
    /// Set `key` to `value`. Idempotent.
    fn update_state(&self, key: &str, value: &str) -> Result<(), PublishError>;

    /// Append a fault transition to the event record.
    fn log_event(&self, event: &FaultEvent) -> Result<(), PublishError>;
}

/// Sends everything to several publishers. One failing does not stop the others;
/// the first error is returned.
#[derive(Clone, Default)]
pub struct Fanout {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl Fanout {
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    fn each<F>(&self, mut f: F) -> Result<(), PublishError>
    where
        F: FnMut(&dyn Publisher) -> Result<(), PublishError>,
    {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = f(publisher.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Publisher for Fanout {
    fn update_state(&self, key: &str, value: &str) -> Result<(), PublishError> {
        self.each(|p| p.update_state(key, value))
    }

    fn log_event(&self, event: &FaultEvent) -> Result<(), PublishError> {
        self.each(|p| p.log_event(event))
    }
}
