//! Twin Service - the public face of the device twin engine
//!
//! Wires the registry, binder, twin store, status machine and reconciler
//! together and publishes what happens on an [`EventBus`]. Every method is
//! synchronous and safe to call from any thread.
//!
//! Lock order: device lifecycle operations (create, rebind, remove) take a
//! lifecycle mutex, then the registry, then the device entry. The write
//! path takes only the device entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use edgetwin_core::{EventBus, EventBusReceiver, TwinConfig};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::binder::bind;
use crate::error::{TwinError, TwinResult};
use crate::event::TwinEvent;
use crate::ingest::{
    BatchReport, DeviceStatusMessage, DevicesStatusMessage, PropertyResult, ReportDeviceMessage,
    ReportDevicesMessage, StatusBatchReport, StatusResult, fan_out,
};
use crate::instance::{Device, DeviceSpec, DeviceSpecMeta, DeviceStatus};
use crate::mdl::{DeviceModel, MemberKey, ParamError, PropertyKey, PropertyValue};
use crate::reconciler::{DesiredIntent, IntentSink, Reconciler, TwinDelta, diff_entry};
use crate::registry::{ModelRegistry, UpdatePolicy};
use crate::status::{Connectivity, Diagnostic, StatusSignal, Transition};
use crate::store::DeviceRecordStore;
use crate::twin::{DeviceEntry, DeviceTwin, ReportOutcome, TwinStore, WriteOutcome};

const EVENT_SOURCE: &str = "twin";

/// Device twin engine.
pub struct TwinService {
    config: TwinConfig,
    registry: ModelRegistry,
    twins: TwinStore,
    reconciler: Reconciler,
    event_bus: EventBus<TwinEvent>,
    record_store: Option<Arc<dyn DeviceRecordStore>>,
    lifecycle: Mutex<()>,
}

impl TwinService {
    pub fn new(config: TwinConfig) -> Self {
        let event_bus = EventBus::with_capacity(config.events.channel_capacity).named("twin");
        Self {
            config,
            registry: ModelRegistry::new(),
            twins: TwinStore::new(),
            reconciler: Reconciler::new(),
            event_bus,
            record_store: None,
            lifecycle: Mutex::new(()),
        }
    }

    /// Write model and device records through to `store`.
    pub fn with_record_store(mut self, store: Arc<dyn DeviceRecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn config(&self) -> &TwinConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus<TwinEvent> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> EventBusReceiver<TwinEvent> {
        self.event_bus.subscribe()
    }

    pub fn add_intent_sink(&self, sink: Arc<dyn IntentSink>) {
        self.reconciler.add_sink(sink);
    }

    // ========== Models ==========

    /// Register a model; returns its registration version.
    pub fn register_model(&self, mut model: DeviceModel) -> TwinResult<u64> {
        let now = edgetwin_core::now_millis();
        if model.create_timestamp == 0 {
            model.create_timestamp = now;
        }
        model.update_timestamp = now;
        let registered = self.registry.register(model)?;
        self.persist(|s| s.save_model(registered.model()));
        self.publish(TwinEvent::ModelRegistered {
            model: registered.name().to_string(),
            version: registered.version(),
        });
        Ok(registered.version())
    }

    pub fn get_model(&self, name: &str) -> TwinResult<DeviceModel> {
        Ok(self.registry.get(name)?.model().clone())
    }

    pub fn list_models(&self) -> Vec<DeviceModel> {
        self.registry.list()
    }

    /// Replace a model; returns the devices whose bindings went stale.
    pub fn update_model(&self, mut model: DeviceModel, policy: UpdatePolicy) -> TwinResult<Vec<String>> {
        if let Ok(previous) = self.registry.get(&model.name) {
            model.create_timestamp = previous.model().create_timestamp;
        }
        model.update_timestamp = edgetwin_core::now_millis();
        let (registered, invalidated) = self.registry.update(model, policy)?;
        self.persist(|s| s.save_model(registered.model()));
        self.publish(TwinEvent::ModelReplaced {
            model: registered.name().to_string(),
            version: registered.version(),
            invalidated: invalidated.clone(),
        });
        Ok(invalidated)
    }

    pub fn remove_model(&self, name: &str) -> TwinResult<DeviceModel> {
        let removed = self.registry.remove(name)?;
        self.persist(|s| s.delete_model(name));
        self.publish(TwinEvent::ModelRemoved {
            model: name.to_string(),
        });
        Ok(removed)
    }

    // ========== Devices ==========

    /// Bind and start tracking a device. An empty id is replaced by a UUID.
    pub fn create_device(&self, device: Device) -> TwinResult<Device> {
        self.create_device_inner(device, true)
    }

    fn create_device_inner(&self, mut device: Device, persist: bool) -> TwinResult<Device> {
        let device_id = device.ensure_id().to_string();
        let _guard = self.lifecycle.lock();
        if self.twins.contains(&device_id) {
            return Err(TwinError::DuplicateDevice(device_id));
        }

        let model_name = device.spec.device_model_ref.clone();
        let registered = self.registry.acquire(&model_name, &device_id)?;
        let binding = match bind(&device_id, &device.spec, &registered) {
            Ok(binding) => binding,
            Err(e) => {
                self.registry.release(&model_name, &device_id);
                return Err(e);
            }
        };

        let now = edgetwin_core::now_millis();
        if device.create_timestamp == 0 {
            device.create_timestamp = now;
        }
        device.update_timestamp = now;
        device.status = DeviceStatus::default();

        let entry = DeviceEntry::new(device, binding, self.config.status.max_diagnostics);
        let shared = match self.twins.insert(entry) {
            Ok(shared) => shared,
            Err(e) => {
                self.registry.release(&model_name, &device_id);
                return Err(e);
            }
        };
        let record = shared.lock().record();
        drop(_guard);

        if persist {
            self.persist(|s| s.save_device(&record));
        }
        tracing::info!(device_id = %device_id, model = %model_name, "Device bound");
        self.publish(TwinEvent::DeviceBound {
            device_id,
            model: model_name,
        });
        Ok(record)
    }

    pub fn get_device(&self, device_id: &str) -> TwinResult<Device> {
        self.twins.with_entry(device_id, |e| Ok(e.record()))
    }

    /// The identity summary a device announces, with its current state.
    pub fn device_meta(&self, device_id: &str) -> TwinResult<DeviceSpecMeta> {
        self.get_device(device_id).map(|d| DeviceSpecMeta::from(&d))
    }

    /// All devices, sorted by id.
    pub fn list_devices(&self) -> Vec<Device> {
        self.twins
            .device_ids()
            .into_iter()
            .filter_map(|id| self.get_device(&id).ok())
            .collect()
    }

    /// Re-bind a device against the current model registration.
    ///
    /// With `spec` the device's static description is replaced as well.
    /// Twin entries whose keys are still bound survive; the rest are
    /// dropped and returned.
    pub fn rebind_device(&self, device_id: &str, spec: Option<DeviceSpec>) -> TwinResult<Vec<PropertyKey>> {
        let _guard = self.lifecycle.lock();
        let shared = self.twins.entry(device_id)?;
        let mut record = shared.lock().record();
        let old_model = record.spec.device_model_ref.clone();
        if let Some(spec) = spec {
            record.spec = spec;
        }
        let new_model = record.spec.device_model_ref.clone();

        let registered = self.registry.acquire(&new_model, device_id)?;
        let binding = match bind(device_id, &record.spec, &registered) {
            Ok(binding) => binding,
            Err(e) => {
                if new_model != old_model {
                    self.registry.release(&new_model, device_id);
                }
                return Err(e);
            }
        };
        record.update_timestamp = edgetwin_core::now_millis();

        let (dropped, record) = {
            let mut entry = shared.lock();
            if entry.is_removed() {
                return Err(TwinError::NotFound(format!("device {}", device_id)));
            }
            let dropped = entry.rebind(record, binding);
            (dropped, entry.record())
        };
        if new_model != old_model {
            self.registry.release(&old_model, device_id);
        }
        drop(_guard);

        self.persist(|s| s.save_device(&record));
        tracing::info!(
            device_id = %device_id,
            model = %new_model,
            dropped = dropped.len(),
            "Device re-bound"
        );
        self.publish(TwinEvent::DeviceRebound {
            device_id: device_id.to_string(),
            model: new_model,
            dropped: dropped.iter().map(ToString::to_string).collect(),
        });
        Ok(dropped)
    }

    pub fn remove_device(&self, device_id: &str) -> TwinResult<Device> {
        let _guard = self.lifecycle.lock();
        let shared = self.twins.remove(device_id)?;
        let record = shared.lock().record();
        self.registry.release(&record.spec.device_model_ref, device_id);
        drop(_guard);

        self.persist(|s| s.delete_device(device_id));
        tracing::info!(device_id = %device_id, "Device removed");
        self.publish(TwinEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
        Ok(record)
    }

    // ========== Twin ==========

    pub fn set_desired(
        &self,
        device_id: &str,
        service: &str,
        property: &str,
        value: PropertyValue,
        timestamp: i64,
    ) -> TwinResult<WriteOutcome> {
        let key = PropertyKey::new(service, property);
        let (outcome, intent) = self.twins.with_entry(device_id, |entry| {
            let outcome = entry.set_desired(key, value, timestamp)?;
            let intent = if outcome.changed {
                self.reconciler.plan(entry)
            } else {
                None
            };
            Ok((outcome, intent))
        })?;

        if outcome.changed {
            self.publish(TwinEvent::DesiredChanged {
                device_id: device_id.to_string(),
                service: outcome.current.service.clone(),
                property: outcome.current.property_name.clone(),
                value: outcome.current.value.clone(),
                timestamp: outcome.current.timestamp,
            });
        }
        self.issue(intent);
        Ok(outcome)
    }

    pub fn apply_reported(
        &self,
        device_id: &str,
        service: &str,
        property: &str,
        value: PropertyValue,
        timestamp: i64,
        error_message: Option<String>,
    ) -> TwinResult<ReportOutcome> {
        let key = PropertyKey::new(service, property);
        let mut events = Vec::new();
        let (outcome, intent) = self.twins.with_entry(device_id, |entry| {
            let (outcome, replan) =
                self.report_locked(entry, key, value, timestamp, error_message, &mut events)?;
            let intent = if replan {
                self.reconciler.plan(entry)
            } else {
                None
            };
            Ok((outcome, intent))
        })?;
        self.publish_all(events);
        self.issue(intent);
        Ok(outcome)
    }

    /// Apply one report to a locked entry, queueing the events it causes.
    /// The flag says whether the entry should be reconciled afterwards.
    fn report_locked(
        &self,
        entry: &mut DeviceEntry,
        key: PropertyKey,
        value: PropertyValue,
        timestamp: i64,
        error_message: Option<String>,
        events: &mut Vec<TwinEvent>,
    ) -> TwinResult<(ReportOutcome, bool)> {
        let outcome = entry.apply_reported(key.clone(), value, timestamp, error_message)?;
        let device_id = entry.device_id().to_string();
        let mut replan = false;

        if outcome.write.changed {
            let current = &outcome.write.current;
            events.push(TwinEvent::ReportedChanged {
                device_id: device_id.clone(),
                service: current.service.clone(),
                property: current.property_name.clone(),
                value: current.value.clone(),
                timestamp: current.timestamp,
                error_message: current.error_message.clone(),
            });
            if let Some(desired) = entry.desired().get(&key) {
                replan = desired.value != current.value;
            }
        }
        if let Some(t) = outcome.transition {
            if t.changed() {
                replan |= t.to.accepts_commands();
                events.push(status_event(&device_id, &t));
            }
        }
        Ok((outcome, replan))
    }

    pub fn get_twin(&self, device_id: &str) -> TwinResult<DeviceTwin> {
        self.twins.get_twin(device_id)
    }

    /// Desired keys the device has not yet matched.
    pub fn diff(&self, device_id: &str) -> TwinResult<Vec<TwinDelta>> {
        self.twins.with_entry(device_id, |e| Ok(diff_entry(e)))
    }

    // ========== Status ==========

    pub fn status(&self, device_id: &str) -> TwinResult<DeviceStatus> {
        self.twins.with_entry(device_id, |e| Ok(e.status()))
    }

    /// Status inputs that were ignored, oldest first.
    pub fn diagnostics(&self, device_id: &str) -> TwinResult<Vec<Diagnostic>> {
        self.twins
            .with_entry(device_id, |e| Ok(e.status_machine().diagnostics().cloned().collect()))
    }

    pub fn start_collect(&self, device_id: &str) -> TwinResult<Transition> {
        self.drive(device_id, |entry| entry.apply_signal(StatusSignal::StartCollect))
    }

    pub fn stop_collect(&self, device_id: &str) -> TwinResult<Transition> {
        self.drive(device_id, |entry| entry.apply_signal(StatusSignal::StopCollect))
    }

    /// Declare a device offline, as the liveness monitor does.
    pub fn mark_offline(&self, device_id: &str) -> TwinResult<Transition> {
        let transition = self.drive(device_id, |entry| entry.apply_signal(StatusSignal::LivenessTimeout))?;
        if transition.changed() {
            tracing::warn!(device_id = %device_id, "Device silent past liveness window, marked offline");
        }
        Ok(transition)
    }

    /// Apply a connectivity message from a protocol adapter. A stamped
    /// message older than the last one applied to the device is ignored.
    pub fn device_status_message(&self, message: &DeviceStatusMessage) -> TwinResult<Transition> {
        let signal = match Connectivity::parse(&message.status) {
            Some(c) => StatusSignal::Connectivity(c),
            None => StatusSignal::Unrecognized(message.status.clone()),
        };
        let error = message
            .error_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let timestamp = message.timestamp;
        self.drive(&message.device_id, move |entry| {
            entry.apply_status_message(signal, timestamp, error)
        })
    }

    /// Collecting devices silent for at least `timeout_ms` as of `now`.
    pub fn stale_devices(&self, now: i64, timeout_ms: i64) -> Vec<String> {
        self.twins
            .device_ids()
            .into_iter()
            .filter(|id| {
                self.twins
                    .with_entry(id, |e| Ok(e.is_silent(now, timeout_ms)))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn drive(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceEntry) -> Transition,
    ) -> TwinResult<Transition> {
        let (transition, intent) = self.twins.with_entry(device_id, |entry| {
            let transition = f(entry);
            let intent = if transition.changed() && transition.to.accepts_commands() {
                self.reconciler.plan(entry)
            } else {
                None
            };
            Ok((transition, intent))
        })?;
        if transition.changed() {
            self.publish(status_event(device_id, &transition));
        }
        self.issue(intent);
        Ok(transition)
    }

    // ========== Batches ==========

    /// Apply a batch of reports. Never aborts on a single failure.
    pub fn ingest_reports(&self, message: &ReportDevicesMessage) -> BatchReport {
        let per_device = fan_out(
            &message.devices,
            self.config.ingest.parallel_threshold,
            |device| self.ingest_device(device),
        );
        let report = BatchReport {
            results: per_device.into_iter().flatten().collect(),
        };
        tracing::debug!(
            devices = message.devices.len(),
            accepted = report.accepted(),
            rejected = report.rejected(),
            "Ingested report batch"
        );
        report
    }

    fn ingest_device(&self, message: &ReportDeviceMessage) -> Vec<PropertyResult> {
        let device_id = message.device_id.as_str();
        let mut events = Vec::new();
        let applied = self.twins.with_entry(device_id, |entry| {
            let mut results = Vec::with_capacity(message.services.len());
            let mut replan = false;
            for property in &message.services {
                match self.report_locked(
                    entry,
                    property.key(),
                    property.value.clone(),
                    property.timestamp,
                    property.error_message.clone(),
                    &mut events,
                ) {
                    Ok((outcome, again)) => {
                        replan |= again;
                        results.push(PropertyResult::ok(device_id, property, outcome.write.changed));
                    }
                    Err(e) => results.push(PropertyResult::failed(device_id, property, e)),
                }
            }
            let intent = if replan {
                self.reconciler.plan(entry)
            } else {
                None
            };
            Ok((results, intent))
        });

        match applied {
            Ok((results, intent)) => {
                self.publish_all(events);
                self.issue(intent);
                results
            }
            Err(e) => message
                .services
                .iter()
                .map(|p| PropertyResult::failed(device_id, p, e.clone()))
                .collect(),
        }
    }

    /// Apply a batch of status messages. Unknown devices come back as `NotFound`.
    pub fn ingest_statuses(&self, message: &DevicesStatusMessage) -> StatusBatchReport {
        let results = fan_out(
            &message.devices_status,
            self.config.ingest.parallel_threshold,
            |status| match self.device_status_message(status) {
                Ok(t) => StatusResult {
                    device_id: status.device_id.clone(),
                    state: Some(t.to),
                    error: None,
                },
                Err(e) => StatusResult {
                    device_id: status.device_id.clone(),
                    state: None,
                    error: Some(e),
                },
            },
        );
        StatusBatchReport { results }
    }

    // ========== Commands ==========

    /// Check a command invocation against the device's bound definition.
    /// Returns the canonical parameter values.
    pub fn validate_command(
        &self,
        device_id: &str,
        service: &str,
        command: &str,
        params: &Map<String, Value>,
    ) -> TwinResult<BTreeMap<String, Value>> {
        self.twins.with_entry(device_id, |entry| {
            let binding = entry.binding();
            binding.ensure_current()?;
            let bound = binding
                .command(&MemberKey::new(service, command))
                .ok_or_else(|| TwinError::UnknownMember {
                    service: service.to_string(),
                    member: command.to_string(),
                })?;
            bound.definition.check_params(params).map_err(|e| match e {
                ParamError::Unknown(name) => TwinError::UnknownMember {
                    service: service.to_string(),
                    member: format!("{}.{}", command, name),
                },
                ParamError::Invalid(name, err) => {
                    TwinError::from_value(MemberKey::new(service, format!("{}.{}", command, name)), err)
                }
            })
        })
    }

    // ========== Persistence ==========

    /// Restore models and devices from the attached record store.
    ///
    /// Returns the number of models and devices restored. Records that no
    /// longer bind are skipped with a warning.
    pub fn load_from_store(&self) -> TwinResult<(usize, usize)> {
        let Some(store) = self.record_store.clone() else {
            return Ok((0, 0));
        };

        let mut models = 0;
        for model in store.load_models()? {
            let name = model.name.clone();
            match self.registry.register(model) {
                Ok(registered) => {
                    models += 1;
                    self.publish(TwinEvent::ModelRegistered {
                        model: name,
                        version: registered.version(),
                    });
                }
                Err(e) => tracing::warn!(model = %name, error = %e, "Skipping stored model"),
            }
        }

        let mut devices = 0;
        for device in store.load_devices()? {
            let device_id = device.device_id.clone();
            match self.create_device_inner(device, false) {
                Ok(_) => devices += 1,
                Err(e) => tracing::warn!(device_id = %device_id, error = %e, "Skipping stored device"),
            }
        }

        tracing::info!(models, devices, "Restored records from store");
        Ok((models, devices))
    }

    fn persist(&self, op: impl FnOnce(&dyn DeviceRecordStore) -> TwinResult<()>) {
        if let Some(store) = &self.record_store {
            if let Err(e) = op(store.as_ref()) {
                tracing::warn!(error = %e, "Record store write failed");
            }
        }
    }

    // ========== Events ==========

    fn publish(&self, event: TwinEvent) {
        tracing::trace!(event = event.type_name(), "Publishing twin event");
        self.event_bus.publish_with_source(event, EVENT_SOURCE);
    }

    fn publish_all(&self, events: Vec<TwinEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    fn issue(&self, intent: Option<DesiredIntent>) {
        let Some(intent) = intent else {
            return;
        };
        tracing::debug!(
            device_id = %intent.device_id,
            deltas = intent.deltas.len(),
            "Desired intent issued"
        );
        self.reconciler.dispatch(&intent);
        self.publish(TwinEvent::IntentIssued(intent));
    }
}

impl Default for TwinService {
    fn default() -> Self {
        Self::new(TwinConfig::default())
    }
}

fn status_event(device_id: &str, t: &Transition) -> TwinEvent {
    TwinEvent::StatusChanged {
        device_id: device_id.to_string(),
        from: t.from,
        to: t.to,
        collecting: t.collecting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServiceSpec;
    use crate::mdl::{CommandDefinition, PropertyDefinition, ServiceDefinition, ValueDefinition};
    use crate::status::DeviceState;
    use crate::store::MemoryRecordStore;
    use serde_json::json;

    fn lamp() -> DeviceModel {
        DeviceModel::new("Lamp").with_service(
            ServiceDefinition::new("light")
                .with_property(PropertyDefinition::read_write("on", ValueDefinition::boolean()))
                .with_property(PropertyDefinition::read_write(
                    "brightness",
                    ValueDefinition::integer_range(0, 100),
                ))
                .with_command(
                    CommandDefinition::new("blink")
                        .with_param("times", ValueDefinition::integer_range(1, 10)),
                ),
        )
    }

    fn service_with_lamp() -> TwinService {
        let service = TwinService::default();
        service.register_model(lamp()).unwrap();
        service
            .create_device(Device::new("lamp1", DeviceSpec::new("lamp", "Lamp")))
            .unwrap();
        service
    }

    #[test]
    fn test_create_device_duplicate_and_unknown_model() {
        let service = service_with_lamp();
        assert!(matches!(
            service.create_device(Device::new("lamp1", DeviceSpec::new("lamp", "Lamp"))),
            Err(TwinError::DuplicateDevice(_))
        ));
        assert!(matches!(
            service.create_device(Device::new("x", DeviceSpec::new("x", "Ghost"))),
            Err(TwinError::NotFound(_))
        ));
        assert_eq!(service.registry().references("Lamp"), vec!["lamp1".to_string()]);
    }

    #[test]
    fn test_generated_device_id() {
        let service = service_with_lamp();
        let device = service
            .create_device(Device::new("", DeviceSpec::new("anon", "Lamp")))
            .unwrap();
        assert!(!device.device_id.is_empty());
        assert_eq!(service.list_devices().len(), 2);
    }

    #[test]
    fn test_bad_binding_releases_reference() {
        let service = TwinService::default();
        service.register_model(lamp()).unwrap();
        let spec = DeviceSpec::new("lamp", "Lamp").with_service(ServiceSpec::new("fan"));
        assert_eq!(
            service.create_device(Device::new("lamp2", spec)).unwrap_err(),
            TwinError::UnknownService("fan".to_string())
        );
        assert!(service.registry().references("Lamp").is_empty());
        service.remove_model("Lamp").unwrap();
    }

    #[test]
    fn test_intent_planned_only_when_accepting_commands() {
        let service = service_with_lamp();
        let mut rx = service.subscribe();

        service.set_desired("lamp1", "light", "on", json!(true), 1).unwrap();
        let mut saw_intent = false;
        while let Some((event, _)) = rx.try_recv() {
            saw_intent |= matches!(event, TwinEvent::IntentIssued(_));
        }
        assert!(!saw_intent);

        // Becoming active reconciles outstanding desired state
        service.start_collect("lamp1").unwrap();
        let mut intents = Vec::new();
        while let Some((event, _)) = rx.try_recv() {
            if let TwinEvent::IntentIssued(intent) = event {
                intents.push(intent);
            }
        }
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].deltas[0].property_name, "on");
    }

    #[test]
    fn test_validate_command() {
        let service = service_with_lamp();
        let mut params = Map::new();
        params.insert("times".to_string(), json!(3));
        let checked = service.validate_command("lamp1", "light", "blink", &params).unwrap();
        assert_eq!(checked["times"], json!(3));

        params.insert("times".to_string(), json!(30));
        assert!(matches!(
            service.validate_command("lamp1", "light", "blink", &params),
            Err(TwinError::OutOfRange { .. })
        ));

        params.insert("speed".to_string(), json!(1));
        assert!(matches!(
            service.validate_command("lamp1", "light", "blink", &params),
            Err(TwinError::UnknownMember { .. })
        ));

        assert!(matches!(
            service.validate_command("lamp1", "light", "explode", &Map::new()),
            Err(TwinError::UnknownMember { .. })
        ));
        assert_eq!(
            service.validate_command("lamp1", "light", "blink", &Map::new()).unwrap_err(),
            TwinError::InvalidReport(MemberKey::new("light", "blink.times"))
        );
    }

    #[test]
    fn test_status_message_records_error_without_transition() {
        let service = service_with_lamp();
        service.start_collect("lamp1").unwrap();
        let t = service
            .device_status_message(&DeviceStatusMessage::new("lamp1", "online").with_error("flaky link"))
            .unwrap();
        assert_eq!(t.to, DeviceState::Online);
        let status = service.status("lamp1").unwrap();
        assert_eq!(status.last_error.as_deref(), Some("flaky link"));

        let t = service
            .device_status_message(&DeviceStatusMessage::new("lamp1", "rebooting"))
            .unwrap();
        assert!(!t.changed());
        assert_eq!(service.diagnostics("lamp1").unwrap().len(), 1);
    }

    #[test]
    fn test_write_through_and_restore() {
        let store = Arc::new(MemoryRecordStore::new());
        let service = TwinService::default().with_record_store(store.clone());
        service.register_model(lamp()).unwrap();
        service
            .create_device(Device::new("lamp1", DeviceSpec::new("lamp", "Lamp")))
            .unwrap();
        assert_eq!(store.model_count(), 1);
        assert_eq!(store.device_count(), 1);

        let restored = TwinService::default().with_record_store(store.clone());
        assert_eq!(restored.load_from_store().unwrap(), (1, 1));
        assert_eq!(restored.get_device("lamp1").unwrap().spec.device_model_ref, "Lamp");

        restored.remove_device("lamp1").unwrap();
        assert_eq!(store.device_count(), 0);
    }
}
