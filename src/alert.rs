// 🚨 Alerts - raised when a sync job is given up on
//
// The local ledger stays authoritative; an alert tells an operator which entry
// the external system is missing or holding stale.

use crate::entities::{EntryId, OwnerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: OwnerKind,
    pub entry_id: EntryId,
    /// "upsert" or "delete"
    pub operation: String,
    pub error: String,
    pub attempts: u32,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn subject(&self) -> String {
        format!(
            "{} sync failed for {} entry {}",
            self.operation,
            self.kind.stream_name(),
            self.entry_id
        )
    }
}

pub trait Alerter: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Writes alerts to the log at error level
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn alert(&self, alert: Alert) {
        error!(
            kind = %alert.kind,
            entry_id = alert.entry_id,
            operation = %alert.operation,
            attempts = alert.attempts,
            error = %alert.error,
            "ALERT: {}",
            alert.subject()
        );
    }
}

/// Keeps alerts in memory
#[derive(Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Alerter for RecordingAlerter {
    fn alert(&self, alert: Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_alerter_keeps_alerts() {
        let alerter = RecordingAlerter::new();
        alerter.alert(Alert {
            kind: OwnerKind::Sector,
            entry_id: 5,
            operation: "upsert".to_string(),
            error: "transient: erp down".to_string(),
            attempts: 5,
            raised_at: Utc::now(),
        });

        let alerts = alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject(), "upsert sync failed for sector claims entry 5");
    }
}
