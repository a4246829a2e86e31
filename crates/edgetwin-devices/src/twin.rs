//! Twin Store - desired and reported state per device
//!
//! Each device lives in its own [`DeviceEntry`] behind its own mutex. The
//! device table is a sharded map; a shard lock is held only long enough to
//! clone the entry handle, never while the entry is mutated.
//!
//! Writes are last-writer-wins by timestamp: an incoming timestamp must be
//! strictly newer than the stored one. Replaying the exact stored write is
//! accepted as a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binder::BoundInstance;
use crate::error::{TwinError, TwinResult};
use crate::instance::{Device, DeviceStatus};
use crate::mdl::{PropertyKey, PropertyValue};
use crate::status::{DeviceState, StatusMachine, StatusSignal, Transition};

/// One desired or reported property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinProperty {
    pub service: String,
    pub property_name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: PropertyValue,
    /// Unix milliseconds
    #[serde(default)]
    pub timestamp: i64,
    /// Collection error, reported side only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TwinProperty {
    pub fn new(service: impl Into<String>, property_name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            service: service.into(),
            property_name: property_name.into(),
            value,
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

    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(&self.service, &self.property_name)
    }

    /// Error message, treating an empty string as absent.
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref().filter(|m| !m.is_empty())
    }
}

/// Snapshot of a device's desired and reported state, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwin {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub desired: Vec<TwinProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reported: Vec<TwinProperty>,
}

impl DeviceTwin {
    pub fn find_desired(&self, service: &str, property: &str) -> Option<&TwinProperty> {
        self.desired
            .iter()
            .find(|p| p.service == service && p.property_name == property)
    }

    pub fn find_reported(&self, service: &str, property: &str) -> Option<&TwinProperty> {
        self.reported
            .iter()
            .find(|p| p.service == service && p.property_name == property)
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty() && self.reported.is_empty()
    }
}

/// Result of an accepted desired or reported write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Property stored before the write, if any
    pub previous: Option<TwinProperty>,
    /// Property stored after the write
    pub current: TwinProperty,
    /// False when the write replayed the stored value and timestamp
    pub changed: bool,
}

/// Result of an accepted report, including any status change it caused.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub write: WriteOutcome,
    pub transition: Option<Transition>,
}

/// Mutable state of one device. Always accessed under its entry mutex.
#[derive(Debug)]
pub struct DeviceEntry {
    record: Device,
    binding: BoundInstance,
    desired: BTreeMap<PropertyKey, TwinProperty>,
    reported: BTreeMap<PropertyKey, TwinProperty>,
    status: StatusMachine,
    last_seen: Option<i64>,
    removed: bool,
}

impl DeviceEntry {
    pub fn new(record: Device, binding: BoundInstance, max_diagnostics: usize) -> Self {
        Self {
            record,
            binding,
            desired: BTreeMap::new(),
            reported: BTreeMap::new(),
            status: StatusMachine::new(max_diagnostics),
            last_seen: None,
            removed: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.record.device_id
    }

    pub fn binding(&self) -> &BoundInstance {
        &self.binding
    }

    pub fn status_machine(&self) -> &StatusMachine {
        &self.status
    }

    pub fn desired(&self) -> &BTreeMap<PropertyKey, TwinProperty> {
        &self.desired
    }

    pub fn reported(&self) -> &BTreeMap<PropertyKey, TwinProperty> {
        &self.reported
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Record a desired value.
    pub fn set_desired(
        &mut self,
        key: PropertyKey,
        value: PropertyValue,
        timestamp: i64,
    ) -> TwinResult<WriteOutcome> {
        self.binding.ensure_current()?;
        let bound = self.binding.resolve_property(&key)?;
        if !bound.definition.is_writable() {
            return Err(TwinError::NotWritable(key));
        }
        let value = bound
            .definition
            .data_type
            .check(&value)
            .map_err(|e| TwinError::from_value(key.clone(), e))?;

        let previous = self.desired.get(&key);
        let timestamp = effective_timestamp(timestamp, previous);
        let incoming = TwinProperty {
            service: key.service.clone(),
            property_name: key.name.clone(),
            value,
            timestamp,
            error_message: None,
        };
        store(&mut self.desired, key, incoming)
    }

    /// Record a reported value, feeding any error into the status machine.
    pub fn apply_reported(
        &mut self,
        key: PropertyKey,
        value: PropertyValue,
        timestamp: i64,
        error_message: Option<String>,
    ) -> TwinResult<ReportOutcome> {
        self.binding.ensure_current()?;
        let bound = self.binding.resolve_property(&key)?;
        let error_message = error_message.filter(|m| !m.is_empty());

        let value = match bound.definition.data_type.check(&value) {
            Ok(canonical) => canonical,
            // A failed collection may carry garbage; keep the error, drop the value
            Err(_) if error_message.is_some() => Value::Null,
            Err(e) => return Err(TwinError::from_value(key, e)),
        };

        let now = edgetwin_core::now_millis();
        let previous = self.reported.get(&key);
        let timestamp = effective_timestamp(timestamp, previous);
        let errored = error_message.is_some();
        let incoming = TwinProperty {
            service: key.service.clone(),
            property_name: key.name.clone(),
            value,
            timestamp,
            error_message,
        };
        let write = store(&mut self.reported, key.clone(), incoming)?;
        self.last_seen = Some(now);

        let transition = if write.changed {
            let signal = if errored {
                StatusSignal::PropertyError(key)
            } else {
                StatusSignal::PropertyClean(key)
            };
            Some(self.status.apply(signal))
        } else {
            None
        };
        Ok(ReportOutcome { write, transition })
    }

    /// Feed a status signal.
    pub fn apply_signal(&mut self, signal: StatusSignal) -> Transition {
        let starting = signal == StatusSignal::StartCollect;
        let transition = self.status.apply(signal);
        if starting && transition.changed() {
            // Liveness is measured from the start of collection
            self.last_seen = Some(edgetwin_core::now_millis());
        }
        transition
    }

    /// Note that the device spoke, without touching its twin.
    pub fn touch(&mut self, now: i64) {
        self.last_seen = Some(now);
    }

    pub fn record_device_error(&mut self, message: impl Into<String>) {
        self.status.record_device_error(message);
    }

    /// Apply a connectivity message stamped at `timestamp`.
    ///
    /// A message older than the last one applied is ignored, including its
    /// error and its liveness credit.
    pub fn apply_status_message(
        &mut self,
        signal: StatusSignal,
        timestamp: i64,
        error_message: Option<String>,
    ) -> Transition {
        if !self.status.admit_status_at(timestamp) {
            return self.status.current();
        }
        self.touch(edgetwin_core::now_millis());
        if let Some(error) = error_message {
            self.record_device_error(error);
        }
        self.apply_signal(signal)
    }

    /// Whether a collecting device has been silent for at least `timeout_ms`.
    pub fn is_silent(&self, now: i64, timeout_ms: i64) -> bool {
        if !self.status.is_collecting() || self.status.state() == DeviceState::Offline {
            return false;
        }
        self.last_seen.is_some_and(|seen| now - seen >= timeout_ms)
    }

    /// Sorted snapshot of both sides.
    pub fn twin(&self) -> DeviceTwin {
        DeviceTwin {
            desired: self.desired.values().cloned().collect(),
            reported: self.reported.values().cloned().collect(),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_status: self.status.state(),
            collecting: self.status.is_collecting(),
            last_error: self.status.last_error().map(str::to_string),
            twins: self.twin(),
        }
    }

    /// Device record with its current status filled in.
    pub fn record(&self) -> Device {
        let mut record = self.record.clone();
        record.status = self.status();
        record
    }

    /// Swap in a new binding; returns the twin keys that are no longer bound.
    pub fn rebind(&mut self, record: Device, binding: BoundInstance) -> Vec<PropertyKey> {
        let mut dropped: Vec<PropertyKey> = self
            .desired
            .keys()
            .chain(self.reported.keys())
            .filter(|k| !binding.has_property(k))
            .cloned()
            .collect();
        dropped.sort();
        dropped.dedup();

        self.desired.retain(|k, _| binding.has_property(k));
        self.reported.retain(|k, _| binding.has_property(k));
        for key in &dropped {
            self.status.forget_property(key);
        }
        self.record = record;
        self.binding = binding;
        dropped
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
    }
}

/// Missing or zero timestamps mean "now", ordered after anything stored.
fn effective_timestamp(timestamp: i64, stored: Option<&TwinProperty>) -> i64 {
    if timestamp > 0 {
        return timestamp;
    }
    let now = edgetwin_core::now_millis();
    match stored {
        Some(p) if p.timestamp >= now => p.timestamp + 1,
        _ => now,
    }
}

fn store(
    map: &mut BTreeMap<PropertyKey, TwinProperty>,
    key: PropertyKey,
    incoming: TwinProperty,
) -> TwinResult<WriteOutcome> {
    if let Some(stored) = map.get(&key) {
        if incoming.timestamp < stored.timestamp {
            return Err(TwinError::StaleWrite {
                key,
                stored: stored.timestamp,
                incoming: incoming.timestamp,
            });
        }
        if incoming.timestamp == stored.timestamp {
            if incoming.value == stored.value && incoming.error_message == stored.error_message {
                tracing::debug!(property = %key, timestamp = incoming.timestamp, "Replayed write ignored");
                return Ok(WriteOutcome {
                    previous: Some(stored.clone()),
                    current: stored.clone(),
                    changed: false,
                });
            }
            return Err(TwinError::StaleWrite {
                key,
                stored: stored.timestamp,
                incoming: incoming.timestamp,
            });
        }
    }
    let previous = map.insert(key, incoming.clone());
    Ok(WriteOutcome {
        previous,
        current: incoming,
        changed: true,
    })
}

pub type SharedEntry = Arc<Mutex<DeviceEntry>>;

/// Arena of device entries keyed by device id.
#[derive(Default)]
pub struct TwinStore {
    entries: DashMap<String, SharedEntry>,
}

impl TwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: DeviceEntry) -> TwinResult<SharedEntry> {
        let id = entry.device_id().to_string();
        match self.entries.entry(id) {
            Entry::Occupied(o) => Err(TwinError::DuplicateDevice(o.key().clone())),
            Entry::Vacant(v) => {
                let shared = Arc::new(Mutex::new(entry));
                v.insert(Arc::clone(&shared));
                Ok(shared)
            }
        }
    }

    /// Remove an entry. Writers still holding its handle see `NotFound`.
    pub fn remove(&self, device_id: &str) -> TwinResult<SharedEntry> {
        let (_, shared) = self
            .entries
            .remove(device_id)
            .ok_or_else(|| not_found(device_id))?;
        shared.lock().mark_removed();
        Ok(shared)
    }

    pub fn entry(&self, device_id: &str) -> TwinResult<SharedEntry> {
        self.entries
            .get(device_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| not_found(device_id))
    }

    /// Run `f` under the device's lock.
    pub fn with_entry<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceEntry) -> TwinResult<R>,
    ) -> TwinResult<R> {
        let shared = self.entry(device_id)?;
        let mut entry = shared.lock();
        if entry.is_removed() {
            return Err(not_found(device_id));
        }
        f(&mut entry)
    }

    pub fn get_twin(&self, device_id: &str) -> TwinResult<DeviceTwin> {
        self.with_entry(device_id, |e| Ok(e.twin()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    /// Device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn not_found(device_id: &str) -> TwinError {
    TwinError::NotFound(format!("device {}", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::bind;
    use crate::instance::DeviceSpec;
    use crate::mdl::{DeviceModel, PropertyDefinition, ServiceDefinition, ValueDefinition};
    use crate::registry::ModelRegistry;
    use crate::status::DeviceState;
    use serde_json::json;

    fn entry() -> DeviceEntry {
        let registry = ModelRegistry::new();
        let registered = registry
            .register(
                DeviceModel::new("Thermometer").with_service(
                    ServiceDefinition::new("svc")
                        .with_property(PropertyDefinition::read_write(
                            "targetTemp",
                            ValueDefinition::double_range(10.0, 30.0),
                        ))
                        .with_property(PropertyDefinition::read_only(
                            "currentTemp",
                            ValueDefinition::double_range(-40.0, 80.0),
                        )),
                ),
            )
            .unwrap();
        let spec = DeviceSpec::new("thermo", "Thermometer");
        let binding = bind("dev1", &spec, &registered).unwrap();
        DeviceEntry::new(Device::new("dev1", spec), binding, 8)
    }

    fn target() -> PropertyKey {
        PropertyKey::new("svc", "targetTemp")
    }

    fn current() -> PropertyKey {
        PropertyKey::new("svc", "currentTemp")
    }

    #[test]
    fn test_set_desired_and_snapshot() {
        let mut e = entry();
        let outcome = e.set_desired(target(), json!(22.5), 100).unwrap();
        assert!(outcome.changed);
        assert!(outcome.previous.is_none());

        let twin = e.twin();
        assert_eq!(twin.desired.len(), 1);
        assert_eq!(twin.desired[0].value, json!(22.5));
        assert_eq!(twin.desired[0].timestamp, 100);
        assert!(twin.reported.is_empty());
    }

    #[test]
    fn test_set_desired_rejections() {
        let mut e = entry();
        assert!(matches!(
            e.set_desired(target(), json!(35.0), 1),
            Err(TwinError::OutOfRange { .. })
        ));
        assert!(matches!(
            e.set_desired(target(), json!("warm"), 1),
            Err(TwinError::TypeMismatch { .. })
        ));
        assert_eq!(
            e.set_desired(current(), json!(20.0), 1).unwrap_err(),
            TwinError::NotWritable(current())
        );
        assert_eq!(
            e.set_desired(PropertyKey::new("svc", "nope"), json!(1), 1).unwrap_err(),
            TwinError::UnknownProperty(PropertyKey::new("svc", "nope"))
        );
        assert_eq!(
            e.set_desired(target(), Value::Null, 1).unwrap_err(),
            TwinError::InvalidReport(target())
        );
        assert!(e.twin().is_empty());
    }

    #[test]
    fn test_staleness() {
        let mut e = entry();
        e.set_desired(target(), json!(20.0), 200).unwrap();

        let err = e.set_desired(target(), json!(21.0), 100).unwrap_err();
        assert_eq!(
            err,
            TwinError::StaleWrite {
                key: target(),
                stored: 200,
                incoming: 100
            }
        );

        // Same timestamp, same value: accepted without change
        let replay = e.set_desired(target(), json!(20.0), 200).unwrap();
        assert!(!replay.changed);

        // Same timestamp, different value: rejected
        assert!(matches!(
            e.set_desired(target(), json!(25.0), 200),
            Err(TwinError::StaleWrite { .. })
        ));

        let newer = e.set_desired(target(), json!(25.0), 201).unwrap();
        assert_eq!(newer.previous.unwrap().value, json!(20.0));
    }

    #[test]
    fn test_zero_timestamp_orders_after_stored() {
        let mut e = entry();
        let first = e.set_desired(target(), json!(20.0), 0).unwrap();
        let second = e.set_desired(target(), json!(21.0), 0).unwrap();
        assert!(second.current.timestamp > first.current.timestamp);
    }

    #[test]
    fn test_reported_error_handling() {
        let mut e = entry();
        e.apply_signal(StatusSignal::StartCollect);

        // Garbage with an error message is recorded as null plus the error
        let outcome = e
            .apply_reported(current(), json!("garbage"), 10, Some("sensor timeout".to_string()))
            .unwrap();
        assert_eq!(outcome.write.current.value, Value::Null);
        assert_eq!(outcome.transition.unwrap().to, DeviceState::Error);

        // Without one, a null value is an invalid report
        assert_eq!(
            e.apply_reported(current(), Value::Null, 11, None).unwrap_err(),
            TwinError::InvalidReport(current())
        );

        // A clean report clears the error
        let outcome = e.apply_reported(current(), json!(19.5), 12, None).unwrap();
        assert_eq!(outcome.transition.unwrap().to, DeviceState::Online);
        assert!(e.last_seen().is_some());
    }

    #[test]
    fn test_store_insert_remove() {
        let store = TwinStore::new();
        let shared = store.insert(entry()).unwrap();
        assert!(matches!(store.insert(entry()), Err(TwinError::DuplicateDevice(_))));
        assert_eq!(store.device_ids(), vec!["dev1".to_string()]);

        store.remove("dev1").unwrap();
        assert!(shared.lock().is_removed());
        assert!(matches!(store.get_twin("dev1"), Err(TwinError::NotFound(_))));
        assert!(store.is_empty());
    }
}
