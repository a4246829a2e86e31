//! Device model definitions.
//!
//! A device model describes a class of devices as a set of services, each
//! exposing properties, events and commands. Every property carries a typed
//! [`ValueDefinition`] that values written to the twin are checked against.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Values held in a twin are plain JSON.
pub type PropertyValue = Value;

/// Identifies a property, event or command within a device model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberKey {
    pub service: String,
    pub name: String,
}

/// Twin entries are keyed by (service, property).
pub type PropertyKey = MemberKey;

impl MemberKey {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegerDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesDefinition {}

/// Type and bounds of a value. Exactly one variant, enforced by the enum.
///
/// Serialized externally tagged: `{"double": {"minimum": 10, "maximum": 30}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueDefinition {
    #[serde(rename = "int", alias = "integer")]
    Integer(IntegerDefinition),
    String(StringDefinition),
    Double(DoubleDefinition),
    Float(FloatDefinition),
    Boolean(BooleanDefinition),
    Bytes(BytesDefinition),
}

/// Why a value did not fit its definition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value {value} outside [{}, {}]", fmt_bound(.minimum), fmt_bound(.maximum))]
    OutOfRange {
        value: f64,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },

    #[error("value is missing")]
    Missing,
}

fn fmt_bound(bound: &Option<f64>) -> String {
    bound.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Short name of a JSON value's shape, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_bounds<T: PartialOrd + fmt::Display + Copy>(
    minimum: Option<T>,
    maximum: Option<T>,
    default_value: Option<T>,
) -> Result<(), String> {
    if let (Some(min), Some(max)) = (minimum, maximum) {
        if min > max {
            return Err(format!("minimum {} is greater than maximum {}", min, max));
        }
    }
    if let Some(default) = default_value {
        if minimum.is_some_and(|min| default < min) || maximum.is_some_and(|max| default > max) {
            return Err(format!("default {} lies outside the declared bounds", default));
        }
    }
    Ok(())
}

fn range_error(value: f64, minimum: Option<f64>, maximum: Option<f64>) -> ValueError {
    ValueError::OutOfRange {
        value,
        minimum,
        maximum,
    }
}

fn check_range(value: f64, minimum: Option<f64>, maximum: Option<f64>) -> Result<(), ValueError> {
    if minimum.is_some_and(|min| value < min) || maximum.is_some_and(|max| value > max) {
        return Err(range_error(value, minimum, maximum));
    }
    Ok(())
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Widen an `f32` to the `f64` nearest its shortest decimal form, so `0.1f32`
/// reads back as `0.1`.
fn widen_f32(v: f32) -> f64 {
    v.to_string().parse().unwrap_or(f64::from(v))
}

fn integer_of(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn bytes_of(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => STANDARD.decode(s).ok(),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

impl ValueDefinition {
    pub fn integer_range(minimum: i64, maximum: i64) -> Self {
        Self::Integer(IntegerDefinition {
            minimum: Some(minimum),
            maximum: Some(maximum),
            ..Default::default()
        })
    }

    pub fn double_range(minimum: f64, maximum: f64) -> Self {
        Self::Double(DoubleDefinition {
            minimum: Some(minimum),
            maximum: Some(maximum),
            ..Default::default()
        })
    }

    pub fn float_range(minimum: f32, maximum: f32) -> Self {
        Self::Float(FloatDefinition {
            minimum: Some(minimum),
            maximum: Some(maximum),
            ..Default::default()
        })
    }

    pub fn string() -> Self {
        Self::String(StringDefinition::default())
    }

    pub fn boolean() -> Self {
        Self::Boolean(BooleanDefinition::default())
    }

    pub fn bytes() -> Self {
        Self::Bytes(BytesDefinition::default())
    }

    /// Attach a unit to a numeric definition. No-op for other variants.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        match &mut self {
            Self::Integer(d) => d.unit = Some(unit.into()),
            Self::Double(d) => d.unit = Some(unit.into()),
            Self::Float(d) => d.unit = Some(unit.into()),
            _ => {}
        }
        self
    }

    /// Wire name of the variant.
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Integer(_) => "int",
            Self::String(_) => "string",
            Self::Double(_) => "double",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Bytes(_) => "bytes",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Double(_) | Self::Float(_))
    }

    pub fn minimum(&self) -> Option<f64> {
        match self {
            Self::Integer(d) => d.minimum.map(|v| v as f64),
            Self::Double(d) => d.minimum,
            Self::Float(d) => d.minimum.map(widen_f32),
            _ => None,
        }
    }

    pub fn maximum(&self) -> Option<f64> {
        match self {
            Self::Integer(d) => d.maximum.map(|v| v as f64),
            Self::Double(d) => d.maximum,
            Self::Float(d) => d.maximum.map(widen_f32),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::Integer(d) => d.unit.as_deref(),
            Self::Double(d) => d.unit.as_deref(),
            Self::Float(d) => d.unit.as_deref(),
            _ => None,
        }
    }

    pub fn default_value(&self) -> Option<Value> {
        match self {
            Self::Integer(d) => d.default_value.map(Value::from),
            Self::Double(d) => d.default_value.map(Value::from),
            Self::Float(d) => d.default_value.map(|v| Value::from(widen_f32(v))),
            Self::String(d) => d.default_value.clone().map(Value::from),
            Self::Boolean(d) => d.default_value.map(Value::from),
            Self::Bytes(_) => None,
        }
    }

    /// Check the definition itself: bounds ordered, default within bounds.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Integer(d) => check_bounds(d.minimum, d.maximum, d.default_value),
            Self::Double(d) => check_bounds(d.minimum, d.maximum, d.default_value),
            Self::Float(d) => check_bounds(d.minimum, d.maximum, d.default_value),
            _ => Ok(()),
        }
    }

    /// Check a value against this definition.
    ///
    /// Returns the canonical form of the value: integers as JSON integers,
    /// doubles and floats as JSON floats (floats rounded to f32), bytes as
    /// standard base64.
    pub fn check(&self, value: &Value) -> Result<Value, ValueError> {
        if value.is_null() {
            return Err(ValueError::Missing);
        }
        let mismatch = || ValueError::TypeMismatch {
            expected: self.data_type(),
            found: json_kind(value),
        };

        match self {
            Self::Integer(d) => {
                let n = integer_of(value).ok_or_else(mismatch)?;
                if d.minimum.is_some_and(|min| n < min) || d.maximum.is_some_and(|max| n > max) {
                    return Err(range_error(n as f64, self.minimum(), self.maximum()));
                }
                Ok(Value::from(n))
            }
            Self::Double(_) => {
                let x = value.as_f64().ok_or_else(mismatch)?;
                check_range(x, self.minimum(), self.maximum())?;
                Ok(Value::from(x))
            }
            Self::Float(d) => {
                let x = value.as_f64().ok_or_else(mismatch)?;
                // Bounds are f32, so compare at f32 precision
                let v = x as f32;
                if !v.is_finite()
                    || d.minimum.is_some_and(|min| v < min)
                    || d.maximum.is_some_and(|max| v > max)
                {
                    return Err(range_error(x, self.minimum(), self.maximum()));
                }
                Ok(Value::from(widen_f32(v)))
            }
            Self::String(_) => value.as_str().map(|_| value.clone()).ok_or_else(mismatch),
            Self::Boolean(_) => value.as_bool().map(Value::from).ok_or_else(mismatch),
            Self::Bytes(_) => bytes_of(value)
                .map(|bytes| Value::String(STANDARD.encode(bytes)))
                .ok_or_else(mismatch),
        }
    }
}

/// The access mode for a device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWrite,
    #[default]
    ReadOnly,
}

/// Device property definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    pub data_type: ValueDefinition,
    #[serde(default)]
    pub description: String,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, access_mode: AccessMode, data_type: ValueDefinition) -> Self {
        Self {
            name: name.into(),
            access_mode,
            data_type,
            description: String::new(),
        }
    }

    pub fn read_write(name: impl Into<String>, data_type: ValueDefinition) -> Self {
        Self::new(name, AccessMode::ReadWrite, data_type)
    }

    pub fn read_only(name: impl Into<String>, data_type: ValueDefinition) -> Self {
        Self::new(name, AccessMode::ReadOnly, data_type)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access_mode == AccessMode::ReadWrite
    }

    pub fn minimum(&self) -> Option<f64> {
        self.data_type.minimum()
    }

    pub fn maximum(&self) -> Option<f64> {
        self.data_type.maximum()
    }

    pub fn unit(&self) -> Option<&str> {
        self.data_type.unit()
    }
}

/// Severity class of a device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    Info,
    Warning,
    Alert,
}

/// Device event definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub name: String,
    #[serde(default)]
    pub event_type: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<ValueDefinition>,
    #[serde(default)]
    pub description: String,
}

impl EventDefinition {
    pub fn new(name: impl Into<String>, event_type: EventKind) -> Self {
        Self {
            name: name.into(),
            event_type,
            data_type: None,
            description: String::new(),
        }
    }
}

/// Problem found when checking command parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamError {
    /// Parameter not declared by the command
    Unknown(String),
    /// Declared parameter with a bad or missing value
    Invalid(String, ValueError),
}

/// Device command definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub request_params: BTreeMap<String, ValueDefinition>,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            request_params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, data_type: ValueDefinition) -> Self {
        self.request_params.insert(name.into(), data_type);
        self
    }

    /// Check invocation parameters, returning their canonical values.
    pub fn check_params(
        &self,
        params: &serde_json::Map<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ParamError> {
        if let Some(unknown) = params.keys().find(|k| !self.request_params.contains_key(*k)) {
            return Err(ParamError::Unknown(unknown.clone()));
        }
        self.request_params
            .iter()
            .map(|(name, def)| {
                let raw = params.get(name).unwrap_or(&Value::Null);
                def.check(raw)
                    .map(|v| (name.clone(), v))
                    .map_err(|e| ParamError::Invalid(name.clone(), e))
            })
            .collect()
    }
}

/// A service groups related properties, events and commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            properties: Vec::new(),
            events: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_event(mut self, event: EventDefinition) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_command(mut self, command: CommandDefinition) -> Self {
        self.commands.push(command);
        self
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_event(&self, name: &str) -> Option<&EventDefinition> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn find_command(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> Result<(), String> {
        unique_names("property", &self.name, self.properties.iter().map(|p| p.name.as_str()))?;
        unique_names("event", &self.name, self.events.iter().map(|e| e.name.as_str()))?;
        unique_names("command", &self.name, self.commands.iter().map(|c| c.name.as_str()))?;

        for p in &self.properties {
            p.data_type
                .validate()
                .map_err(|e| format!("property {}/{}: {}", self.name, p.name, e))?;
        }
        for e in &self.events {
            if let Some(def) = &e.data_type {
                def.validate()
                    .map_err(|err| format!("event {}/{}: {}", self.name, e.name, err))?;
            }
        }
        for c in &self.commands {
            for (param, def) in &c.request_params {
                def.validate().map_err(|err| {
                    format!("command {}/{} parameter {}: {}", self.name, c.name, param, err)
                })?;
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(
    kind: &str,
    scope: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(format!("{} in {} has an empty name", kind, scope));
        }
        if !seen.insert(name) {
            return Err(format!("duplicate {} '{}' in {}", kind, name, scope));
        }
    }
    Ok(())
}

/// Model body: the list of services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceModelSpec {
    #[serde(rename = "Services", default)]
    pub services: Vec<ServiceDefinition>,
}

/// A reusable device schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub industry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_format: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub device_number: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tag_number: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default, rename = "createTimeStamp")]
    pub create_timestamp: i64,
    #[serde(default, rename = "updateTimeStamp")]
    pub update_timestamp: i64,
    #[serde(default)]
    pub spec: DeviceModelSpec,
}

impl DeviceModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            manufacturer: String::new(),
            industry: String::new(),
            data_format: String::new(),
            device_number: 0,
            tag_number: 0,
            group_id: String::new(),
            creator: String::new(),
            create_timestamp: 0,
            update_timestamp: 0,
            spec: DeviceModelSpec::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.spec.services.push(service);
        self
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.spec.services
    }

    pub fn find_service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.spec.services.iter().find(|s| s.name == name)
    }

    /// Structural checks run at registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("model name is empty".to_string());
        }
        if self.spec.services.is_empty() {
            return Err(format!("model {} declares no services", self.name));
        }
        unique_names(
            "service",
            &self.name,
            self.spec.services.iter().map(|s| s.name.as_str()),
        )?;
        for service in &self.spec.services {
            service.validate()?;
        }
        Ok(())
    }
}

/// Wrapper matching the list payload shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceModelList {
    pub items: Vec<DeviceModel>,
}
