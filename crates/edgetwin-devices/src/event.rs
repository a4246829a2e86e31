//! Events published on the twin service's event bus.

use serde::{Deserialize, Serialize};

use crate::mdl::PropertyValue;
use crate::reconciler::DesiredIntent;
use crate::status::DeviceState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TwinEvent {
    ModelRegistered {
        model: String,
        version: u64,
    },
    ModelReplaced {
        model: String,
        version: u64,
        invalidated: Vec<String>,
    },
    ModelRemoved {
        model: String,
    },
    DeviceBound {
        device_id: String,
        model: String,
    },
    DeviceRebound {
        device_id: String,
        model: String,
        dropped: Vec<String>,
    },
    DeviceRemoved {
        device_id: String,
    },
    DesiredChanged {
        device_id: String,
        service: String,
        property: String,
        value: PropertyValue,
        timestamp: i64,
    },
    ReportedChanged {
        device_id: String,
        service: String,
        property: String,
        value: PropertyValue,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    StatusChanged {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
        collecting: bool,
    },
    IntentIssued(DesiredIntent),
}

impl TwinEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ModelRegistered { .. } => "model_registered",
            Self::ModelReplaced { .. } => "model_replaced",
            Self::ModelRemoved { .. } => "model_removed",
            Self::DeviceBound { .. } => "device_bound",
            Self::DeviceRebound { .. } => "device_rebound",
            Self::DeviceRemoved { .. } => "device_removed",
            Self::DesiredChanged { .. } => "desired_changed",
            Self::ReportedChanged { .. } => "reported_changed",
            Self::StatusChanged { .. } => "status_changed",
            Self::IntentIssued(_) => "intent_issued",
        }
    }

    /// Device the event concerns, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceBound { device_id, .. }
            | Self::DeviceRebound { device_id, .. }
            | Self::DeviceRemoved { device_id }
            | Self::DesiredChanged { device_id, .. }
            | Self::ReportedChanged { device_id, .. }
            | Self::StatusChanged { device_id, .. } => Some(device_id),
            Self::IntentIssued(intent) => Some(&intent.device_id),
            _ => None,
        }
    }
}
