//! Publisher that writes to the tracing log.

use super::{EventSeverity, FaultEvent, PublishError, Publisher};

/// Logs state changes at debug level and fault events at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn update_state(&self, key: &str, value: &str) -> Result<(), PublishError> {
        tracing::debug!("State: {} = {}", key, value);
        Ok(())
    }

    fn log_event(&self, event: &FaultEvent) -> Result<(), PublishError> {
        match event.severity {
            EventSeverity::Critical => tracing::error!(
                "FAULT {}: {} [{}] {}",
                event.event_type.as_str(),
                event.code,
                event.target,
                event.details
            ),
            EventSeverity::Warning => tracing::warn!(
                "FAULT {}: {} [{}] {}",
                event.event_type.as_str(),
                event.code,
                event.target,
                event.details
            ),
            EventSeverity::Info => tracing::info!(
                "{}: {} [{}] {}",
                event.event_type.as_str(),
                event.code,
                event.target,
                event.details
            ),
        }
        Ok(())
    }
}
