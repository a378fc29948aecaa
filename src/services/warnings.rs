//! Post-save warning checks. Evaluation happens in an external service; this side only forwards
//! the freshly saved fields.

use crate::models::telemetry::DeviceRef;
use http::StatusCode;
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug)]
pub enum WarningError {
    Transport(String),
    Http { status: StatusCode },
}

impl core::fmt::Display for WarningError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WarningError::Transport(s) => write!(f, "transport error: {}", s),
            WarningError::Http { status } => write!(f, "http {}", status),
        }
    }
}

impl std::error::Error for WarningError {}

/// Blocking; callers run it off the async workers.
pub trait WarningChecker: Send + Sync {
    fn check_device_warnings(
        &self,
        device: &DeviceRef,
        values: &BTreeMap<String, Value>,
        record_id: Option<i64>,
    ) -> Result<(), WarningError>;
}

/// Used when no warning service is configured.
pub struct LogOnlyWarnings;

impl WarningChecker for LogOnlyWarnings {
    fn check_device_warnings(
        &self,
        device: &DeviceRef,
        values: &BTreeMap<String, Value>,
        record_id: Option<i64>,
    ) -> Result<(), WarningError> {
        debug!(
            "Warnings: no checker configured, skipping device {} ({} field(s), record {:?})",
            device.serial_number,
            values.len(),
            record_id
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WarningRequest<'a> {
    device_id: i64,
    serial_number: &'a str,
    values: &'a BTreeMap<String, Value>,
    record_id: Option<i64>,
}

pub struct WebhookWarnings {
    agent: ureq::Agent,
    url: String,
}

impl WebhookWarnings {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        let url = url.into();
        info!("Warnings: forwarding saved readings to {}", url);
        WebhookWarnings { agent, url }
    }
}

impl WarningChecker for WebhookWarnings {
    fn check_device_warnings(
        &self,
        device: &DeviceRef,
        values: &BTreeMap<String, Value>,
        record_id: Option<i64>,
    ) -> Result<(), WarningError> {
        let body = WarningRequest {
            device_id: device.id.0,
            serial_number: &device.serial_number,
            values,
            record_id,
        };
        let resp = self
            .agent
            .post(&self.url)
            .send_json(&body)
            .map_err(|e| WarningError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WarningError::Http { status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::DeviceId;
    use serde_json::json;

    #[test]
    fn request_body_shape() {
        let values = BTreeMap::from([("voltage".to_string(), json!(231.5))]);
        let body = WarningRequest {
            device_id: 5,
            serial_number: "SN-5",
            values: &values,
            record_id: Some(42),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"deviceId": 5, "serialNumber": "SN-5", "values": {"voltage": 231.5}, "recordId": 42})
        );
    }

    #[test]
    fn log_only_never_fails() {
        let device = DeviceRef {
            id: DeviceId(1),
            serial_number: "SN-1".into(),
            name: None,
        };
        assert!(LogOnlyWarnings.check_device_warnings(&device, &BTreeMap::new(), None).is_ok());
    }

    #[test]
    fn unreachable_webhook_is_a_transport_error() {
        let hook = WebhookWarnings::new("http://127.0.0.1:9/warnings", Duration::from_millis(200));
        let device = DeviceRef {
            id: DeviceId(1),
            serial_number: "SN-1".into(),
            name: None,
        };
        let err = hook.check_device_warnings(&device, &BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, WarningError::Transport(_)), "{err}");
    }
}
