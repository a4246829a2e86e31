//! Device instance records.
//!
//! A device instance references a [`DeviceModel`](crate::mdl::DeviceModel)
//! by name and carries its own protocol and access configuration. Access
//! specs hold only the member name; the definition stays owned by the model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::DeviceState;
use crate::twin::DeviceTwin;

/// How a device attaches to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    #[default]
    Direct,
    Gateway,
    SubDevice,
}

/// Access configuration for one property, event or command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSpec {
    /// Name of the member definition in the model
    pub name: String,
    /// Protocol specific JSON text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_config: String,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, access_config: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_config: access_config.into(),
        }
    }
}

/// Instance-side view of one service of the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<MemberSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<MemberSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<MemberSpec>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            events: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, access_config: impl Into<String>) -> Self {
        self.properties.push(MemberSpec::new(name, access_config));
        self
    }

    pub fn with_event(mut self, name: impl Into<String>, access_config: impl Into<String>) -> Self {
        self.events.push(MemberSpec::new(name, access_config));
        self
    }

    pub fn with_command(mut self, name: impl Into<String>, access_config: impl Into<String>) -> Self {
        self.commands.push(MemberSpec::new(name, access_config));
        self
    }
}

/// Describes how to reach the device's properties, events and commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl ExtensionConfig {
    pub fn find_service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Static description of a device instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "edgeID", default)]
    pub edge_id: String,
    #[serde(rename = "deviceOS", alias = "deviceOs", default, skip_serializing_if = "String::is_empty")]
    pub device_os: String,
    #[serde(
        rename = "deviceCatagory",
        alias = "deviceCategory",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub device_category: String,
    #[serde(default)]
    pub device_version: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_identification_code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub creator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_auth_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default)]
    pub device_type: DeviceKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Name of the device model this instance is built from
    pub device_model_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol_type: String,
    /// Protocol connection settings as JSON text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default)]
    pub extension_config: ExtensionConfig,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, device_model_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_model_ref: device_model_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol_type: impl Into<String>, protocol: impl Into<String>) -> Self {
        self.protocol_type = protocol_type.into();
        self.protocol = protocol.into();
        self
    }

    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.extension_config.services.push(service);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Device state together with its twin, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_status: DeviceState,
    pub collecting: bool,
    /// Last device-level error carried by a status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub twins: DeviceTwin,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            device_status: DeviceState::Inactive,
            collecting: false,
            last_error: None,
            twins: DeviceTwin::default(),
        }
    }
}

/// A device instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "groupId", default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(rename = "createTimeStamp", default)]
    pub create_timestamp: i64,
    #[serde(rename = "updateTimeStamp", default)]
    pub update_timestamp: i64,
    pub spec: DeviceSpec,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(device_id: impl Into<String>, spec: DeviceSpec) -> Self {
        Self {
            device_id: device_id.into(),
            group_id: String::new(),
            create_timestamp: 0,
            update_timestamp: 0,
            spec,
            status: DeviceStatus::default(),
        }
    }

    /// Assign a generated id when none was provided.
    pub fn ensure_id(&mut self) -> &str {
        if self.device_id.trim().is_empty() {
            self.device_id = uuid::Uuid::new_v4().to_string();
        }
        &self.device_id
    }
}

/// Identity summary a device or edge gateway announces about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpecMeta {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "deviceOS", default, skip_serializing_if = "String::is_empty")]
    pub device_os: String,
    #[serde(rename = "deviceCatagory", default, skip_serializing_if = "String::is_empty")]
    pub device_category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_identification_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "Services", default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
}

impl From<&Device> for DeviceSpecMeta {
    fn from(device: &Device) -> Self {
        let spec = &device.spec;
        Self {
            device_id: device.device_id.clone(),
            device_os: spec.device_os.clone(),
            device_category: spec.device_category.clone(),
            device_identification_code: spec.device_identification_code.clone(),
            state: device.status.device_status.as_str().to_string(),
            tags: spec.tags.clone(),
            protocol: spec.protocol.clone(),
            services: spec.extension_config.services.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceList {
    pub items: Vec<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_wire_shape() {
        let device: Device = serde_json::from_value(json!({
            "DeviceID": "dev1",
            "spec": {
                "Name": "Living room",
                "deviceModelRef": "Thermometer",
                "deviceType": "subDevice",
                "protocol": "{\"port\": 502}",
                "extensionConfig": {
                    "services": [
                        {"name": "svc", "properties": [{"name": "targetTemp", "accessConfig": "{\"register\": 1}"}]}
                    ]
                }
            }
        }))
        .unwrap();

        assert_eq!(device.device_id, "dev1");
        assert_eq!(device.spec.device_type, DeviceKind::SubDevice);
        assert_eq!(device.status.device_status, DeviceState::Inactive);
        let svc = device.spec.extension_config.find_service("svc").unwrap();
        assert_eq!(svc.properties[0].name, "targetTemp");
    }

    #[test]
    fn test_spec_field_spellings() {
        let spec: DeviceSpec = serde_json::from_value(json!({
            "Name": "meter",
            "deviceOS": "linux",
            "deviceCatagory": "power",
            "secret": "s3",
            "deviceModelRef": "Meter"
        }))
        .unwrap();
        assert_eq!(spec.device_os, "linux");
        assert_eq!(spec.device_category, "power");

        let wire = serde_json::to_value(&spec).unwrap();
        assert_eq!(wire["deviceCatagory"], "power");
        assert_eq!(wire["deviceOS"], "linux");
        assert_eq!(wire["secret"], "s3");
        assert!(wire.get("deviceCategory").is_none());

        // The corrected spelling is still read
        let alias: DeviceSpec =
            serde_json::from_value(json!({"deviceCategory": "power", "deviceModelRef": "Meter"})).unwrap();
        assert_eq!(alias.device_category, "power");
    }

    #[test]
    fn test_spec_meta_from_device() {
        let mut device = Device::new(
            "gw1",
            DeviceSpec::new("gateway", "Meter")
                .with_protocol("modbus", "{\"port\": 502}")
                .with_tag("site", "north")
                .with_service(ServiceSpec::new("power")),
        );
        device.spec.device_category = "gateway".to_string();
        device.status.device_status = DeviceState::Online;

        let meta = DeviceSpecMeta::from(&device);
        assert_eq!(meta.state, "online");
        assert_eq!(meta.services.len(), 1);

        let wire = serde_json::to_value(&meta).unwrap();
        assert_eq!(wire["DeviceID"], "gw1");
        assert_eq!(wire["deviceCatagory"], "gateway");
        assert_eq!(wire["tags"]["site"], "north");
        assert_eq!(wire["Services"][0]["name"], "power");
    }

    #[test]
    fn test_ensure_id_generates_uuid() {
        let mut device = Device::new("", DeviceSpec::new("d", "m"));
        let id = device.ensure_id().to_string();
        assert_eq!(id.len(), 36);

        let mut named = Device::new("dev7", DeviceSpec::new("d", "m"));
        assert_eq!(named.ensure_id(), "dev7");
    }
}
