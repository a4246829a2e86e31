//! Report Ingestor - batch messages from protocol adapters
//!
//! A batch is applied device by device. All properties of one device are
//! applied under a single acquisition of that device's lock, so readers
//! never observe half a batch. Devices are independent of each other and
//! fan out across the rayon pool once a batch is large enough.

use rayon::prelude::*;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::TwinError;
use crate::status::DeviceState;
use crate::twin::TwinProperty;

/// Properties reported by one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportDeviceMessage {
    pub device_id: String,
    #[serde(default)]
    pub services: Vec<TwinProperty>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportDevicesMessage {
    #[serde(default)]
    pub devices: Vec<ReportDeviceMessage>,
}

/// Connectivity of one device, with an optional device-level error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusMessage {
    pub device_id: String,
    pub status: String,
    /// Unix millis at the adapter; 0 when the adapter does not stamp
    #[serde(default, skip_serializing_if = "is_unstamped")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn is_unstamped(timestamp: &i64) -> bool {
    *timestamp == 0
}

impl DeviceStatusMessage {
    pub fn new(device_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: status.into(),
            timestamp: 0,
            error_message: None,
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesStatusMessage {
    #[serde(default)]
    pub devices_status: Vec<DeviceStatusMessage>,
}

fn serialize_error<S: Serializer>(error: &Option<TwinError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => {
            #[derive(Serialize)]
            struct Wire<'a> {
                kind: &'a str,
                message: String,
            }
            Wire {
                kind: e.kind(),
                message: e.to_string(),
            }
            .serialize(s)
        }
        None => s.serialize_none(),
    }
}

/// Outcome for one reported property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyResult {
    pub device_id: String,
    pub service: String,
    pub property_name: String,
    /// True when the stored value changed
    pub changed: bool,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<TwinError>,
}

impl PropertyResult {
    pub fn ok(device_id: &str, property: &TwinProperty, changed: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            service: property.service.clone(),
            property_name: property.property_name.clone(),
            changed,
            error: None,
        }
    }

    pub fn failed(device_id: &str, property: &TwinProperty, error: TwinError) -> Self {
        Self {
            device_id: device_id.to_string(),
            service: property.service.clone(),
            property_name: property.property_name.clone(),
            changed: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome for one status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResult {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<TwinError>,
}

impl StatusResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of a report batch, one per input property, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub results: Vec<PropertyResult>,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn rejected(&self) -> usize {
        self.results.len() - self.accepted()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PropertyResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn is_clean(&self) -> bool {
        self.rejected() == 0
    }
}

/// Results of a status batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusBatchReport {
    pub results: Vec<StatusResult>,
}

impl StatusBatchReport {
    pub fn rejected(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }
}

/// Map `f` over `items`, in parallel once there are more than `threshold`.
/// Output order always matches input order.
pub fn fan_out<T, R, F>(items: &[T], threshold: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if items.len() > threshold {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}
