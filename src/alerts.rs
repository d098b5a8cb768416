//! Alert delivery for conditions that need an operator but are not failures

use crate::error::RelayerError;

use tracing::error;

/// Receives alert-worthy conditions
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &RelayerError);
}

/// Logs alerts at error level and counts them
pub struct LogAlertSink {
    instance_id: String,
}

impl LogAlertSink {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: &RelayerError) {
        error!(
            instance = %self.instance_id,
            kind = alert.kind(),
            "ALERT: {}",
            alert
        );
        crate::metrics::record_alert(alert.kind());
    }
}
