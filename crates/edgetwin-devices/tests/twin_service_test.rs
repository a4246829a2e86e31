//! Twin Service Tests
//!
//! End-to-end behavior of the twin service:
//! - Desired/reported writes and diffs
//! - Status lifecycle
//! - Model replacement, stale bindings and re-binding
//! - Model removal while referenced

use edgetwin_devices::{
    Device, DeviceModel, DeviceSpec, DeviceState, DeviceStatusMessage, PropertyDefinition,
    PropertyKey, ServiceDefinition, ServiceSpec, TwinError, TwinEvent, TwinService,
    UpdatePolicy, ValueDefinition,
};
use serde_json::json;

fn thermometer() -> DeviceModel {
    DeviceModel::new("Thermometer").with_service(
        ServiceDefinition::new("svc")
            .with_property(PropertyDefinition::read_write(
                "targetTemp",
                ValueDefinition::double_range(10.0, 30.0),
            ))
            .with_property(PropertyDefinition::read_only(
                "currentTemp",
                ValueDefinition::double_range(-20.0, 60.0),
            )),
    )
}

fn service_with_thermometer() -> TwinService {
    let service = TwinService::default();
    service.register_model(thermometer()).unwrap();
    service
        .create_device(Device::new("dev1", DeviceSpec::new("living room", "Thermometer")))
        .unwrap();
    service
}

#[test]
fn test_thermometer_scenario() {
    let service = service_with_thermometer();

    service
        .set_desired("dev1", "svc", "targetTemp", json!(22.5), 1)
        .unwrap();

    assert_eq!(
        service
            .set_desired("dev1", "svc", "currentTemp", json!(25), 2)
            .unwrap_err(),
        TwinError::NotWritable(PropertyKey::new("svc", "currentTemp"))
    );

    let err = service
        .apply_reported("dev1", "svc", "currentTemp", json!(70), 3, None)
        .unwrap_err();
    assert!(matches!(err, TwinError::OutOfRange { .. }));

    service
        .apply_reported("dev1", "svc", "currentTemp", json!(25), 3, Some(String::new()))
        .unwrap();

    let deltas = service.diff("dev1").unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].key(), PropertyKey::new("svc", "targetTemp"));
    assert_eq!(deltas[0].desired, json!(22.5));
    assert_eq!(deltas[0].reported, None);

    let twin = service.get_twin("dev1").unwrap();
    assert_eq!(twin.find_desired("svc", "targetTemp").unwrap().value, json!(22.5));
    assert_eq!(twin.find_reported("svc", "currentTemp").unwrap().value, json!(25.0));
}

#[test]
fn test_diff_empty_once_converged() {
    let service = service_with_thermometer();
    service
        .set_desired("dev1", "svc", "targetTemp", json!(21.0), 10)
        .unwrap();
    service
        .apply_reported("dev1", "svc", "targetTemp", json!(21), 11, None)
        .unwrap();
    assert!(service.diff("dev1").unwrap().is_empty());
    assert_eq!(service.diff("dev1").unwrap(), service.diff("dev1").unwrap());
}

#[test]
fn test_float_property_accepts_declared_bounds() {
    let service = TwinService::default();
    service
        .register_model(DeviceModel::new("Valve").with_service(
            ServiceDefinition::new("flow").with_property(PropertyDefinition::read_write(
                "opening",
                ValueDefinition::float_range(0.1, 0.7),
            )),
        ))
        .unwrap();
    service
        .create_device(Device::new("valve1", DeviceSpec::new("valve", "Valve")))
        .unwrap();

    service
        .apply_reported("valve1", "flow", "opening", json!(0.1), 1, None)
        .unwrap();
    service
        .apply_reported("valve1", "flow", "opening", json!(0.7), 2, None)
        .unwrap();
    service
        .set_desired("valve1", "flow", "opening", json!(0.1), 1)
        .unwrap();
    assert!(matches!(
        service
            .set_desired("valve1", "flow", "opening", json!(0.75), 2)
            .unwrap_err(),
        TwinError::OutOfRange { .. }
    ));

    // A reading rounded to f32 by the device matches the desired value
    service
        .apply_reported("valve1", "flow", "opening", json!(f64::from(0.1f32)), 3, None)
        .unwrap();
    assert!(service.diff("valve1").unwrap().is_empty());
}

#[test]
fn test_unknown_device() {
    let service = service_with_thermometer();
    assert!(matches!(
        service.set_desired("ghost", "svc", "targetTemp", json!(20.0), 1),
        Err(TwinError::NotFound(_))
    ));
    assert!(matches!(service.get_twin("ghost"), Err(TwinError::NotFound(_))));
    assert!(matches!(service.start_collect("ghost"), Err(TwinError::NotFound(_))));
}

#[test]
fn test_status_walk() {
    let service = service_with_thermometer();
    assert_eq!(service.status("dev1").unwrap().device_status, DeviceState::Inactive);

    let t = service.start_collect("dev1").unwrap();
    assert_eq!(t.to, DeviceState::Active);
    assert!(service.status("dev1").unwrap().collecting);

    service
        .device_status_message(&DeviceStatusMessage::new("dev1", "online"))
        .unwrap();
    assert_eq!(service.status("dev1").unwrap().device_status, DeviceState::Online);

    service
        .apply_reported("dev1", "svc", "currentTemp", json!(null), 5, Some("probe disconnected".into()))
        .unwrap();
    assert_eq!(service.status("dev1").unwrap().device_status, DeviceState::Error);

    service
        .apply_reported("dev1", "svc", "currentTemp", json!(19.0), 6, None)
        .unwrap();
    assert_eq!(service.status("dev1").unwrap().device_status, DeviceState::Online);

    service.stop_collect("dev1").unwrap();
    let status = service.status("dev1").unwrap();
    assert_eq!(status.device_status, DeviceState::Inactive);
    assert!(!status.collecting);
}

#[test]
fn test_late_status_message_does_not_override_newer() {
    let service = service_with_thermometer();
    service.start_collect("dev1").unwrap();

    service
        .device_status_message(&DeviceStatusMessage::new("dev1", "online").at(2_000))
        .unwrap();
    let late = service
        .device_status_message(
            &DeviceStatusMessage::new("dev1", "offline")
                .at(1_000)
                .with_error("link lost"),
        )
        .unwrap();
    assert!(!late.changed());

    let status = service.status("dev1").unwrap();
    assert_eq!(status.device_status, DeviceState::Online);
    assert_eq!(status.last_error, None);
    assert!(service
        .diagnostics("dev1")
        .unwrap()
        .iter()
        .any(|d| d.message.contains("older than last applied")));

    // Newer stamps still apply
    service
        .device_status_message(&DeviceStatusMessage::new("dev1", "offline").at(3_000))
        .unwrap();
    assert_eq!(service.status("dev1").unwrap().device_status, DeviceState::Offline);
    assert_eq!(service.device_meta("dev1").unwrap().state, "offline");

    // Stamped batches decode from the adapter shape
    let batch: edgetwin_devices::DevicesStatusMessage = serde_json::from_value(json!({
        "devices_status": [{"device_id": "dev1", "status": "online", "timestamp": 2_500}]
    }))
    .unwrap();
    let report = service.ingest_statuses(&batch);
    assert_eq!(report.results[0].state, Some(DeviceState::Offline));
}

#[test]
fn test_status_events_published() {
    let service = service_with_thermometer();
    let mut rx = service.subscribe();
    service.start_collect("dev1").unwrap();

    let (event, meta) = rx.try_recv().unwrap();
    assert_eq!(meta.source, "twin");
    assert_eq!(
        event,
        TwinEvent::StatusChanged {
            device_id: "dev1".to_string(),
            from: DeviceState::Inactive,
            to: DeviceState::Active,
            collecting: true,
        }
    );
}

#[test]
fn test_stale_binding_until_rebind() {
    let service = service_with_thermometer();
    service
        .set_desired("dev1", "svc", "targetTemp", json!(20.0), 1)
        .unwrap();

    assert!(matches!(
        service.update_model(thermometer(), UpdatePolicy::RejectInUse),
        Err(TwinError::InUse { devices: 1, .. })
    ));

    // Drop currentTemp, keep targetTemp
    let slimmer = DeviceModel::new("Thermometer").with_service(
        ServiceDefinition::new("svc").with_property(PropertyDefinition::read_write(
            "targetTemp",
            ValueDefinition::double_range(5.0, 35.0),
        )),
    );
    service
        .apply_reported("dev1", "svc", "currentTemp", json!(18.0), 1, None)
        .unwrap();
    let invalidated = service
        .update_model(slimmer, UpdatePolicy::InvalidateBindings)
        .unwrap();
    assert_eq!(invalidated, vec!["dev1".to_string()]);

    assert_eq!(
        service
            .set_desired("dev1", "svc", "targetTemp", json!(21.0), 2)
            .unwrap_err(),
        TwinError::StaleBinding {
            device_id: "dev1".to_string(),
            model: "Thermometer".to_string()
        }
    );

    let dropped = service.rebind_device("dev1", None).unwrap();
    assert_eq!(dropped, vec![PropertyKey::new("svc", "currentTemp")]);

    // New bounds apply after re-binding
    service
        .set_desired("dev1", "svc", "targetTemp", json!(33.0), 2)
        .unwrap();
    let twin = service.get_twin("dev1").unwrap();
    assert!(twin.reported.is_empty());
    assert_eq!(twin.desired.len(), 1);
}

#[test]
fn test_rebind_with_new_spec_rejects_bad_config() {
    let service = service_with_thermometer();
    let spec = DeviceSpec::new("living room", "Thermometer").with_service(
        ServiceSpec::new("svc")
            .with_property("targetTemp", "{}")
            .with_property("targetTemp", "{}"),
    );
    assert!(matches!(
        service.rebind_device("dev1", Some(spec)),
        Err(TwinError::DuplicateAccessConfig { .. })
    ));
    // Old binding still works
    service
        .set_desired("dev1", "svc", "targetTemp", json!(20.0), 1)
        .unwrap();
}

#[test]
fn test_model_remove_in_use() {
    let service = service_with_thermometer();
    assert_eq!(
        service.remove_model("Thermometer").unwrap_err(),
        TwinError::InUse {
            model: "Thermometer".to_string(),
            devices: 1
        }
    );

    let removed = service.remove_device("dev1").unwrap();
    assert_eq!(removed.device_id, "dev1");
    assert!(matches!(service.get_device("dev1"), Err(TwinError::NotFound(_))));

    service.remove_model("Thermometer").unwrap();
    assert!(service.list_models().is_empty());
    assert!(matches!(service.get_model("Thermometer"), Err(TwinError::NotFound(_))));
}

#[test]
fn test_device_record_carries_status() {
    let service = service_with_thermometer();
    service.start_collect("dev1").unwrap();
    service
        .set_desired("dev1", "svc", "targetTemp", json!(22.0), 1)
        .unwrap();

    let device = service.get_device("dev1").unwrap();
    assert_eq!(device.status.device_status, DeviceState::Active);
    assert_eq!(device.status.twins.desired.len(), 1);
    assert!(device.create_timestamp > 0);

    let wire = serde_json::to_value(&device).unwrap();
    assert_eq!(wire["DeviceID"], "dev1");
    assert_eq!(wire["status"]["deviceStatus"], "active");
    assert_eq!(wire["status"]["twins"]["desired"][0]["property_name"], "targetTemp");
}
