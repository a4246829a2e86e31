//! Instance Binder - resolves a device instance against its model
//!
//! The result is a [`BoundInstance`]: definitions for every member the
//! device exposes, keyed by (service, name), plus the access configuration
//! the instance supplied for it. The twin store validates writes against
//! the bound instance alone and never touches the registry on the write path.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::{TwinError, TwinResult};
use crate::instance::{DeviceSpec, MemberSpec, ServiceSpec};
use crate::mdl::{
    CommandDefinition, EventDefinition, MemberKey, PropertyDefinition, PropertyKey,
    ServiceDefinition,
};
use crate::registry::RegisteredModel;

/// A property definition plus the instance's access configuration for it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundProperty {
    pub definition: PropertyDefinition,
    pub access_config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundEvent {
    pub definition: EventDefinition,
    pub access_config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundCommand {
    pub definition: CommandDefinition,
    pub access_config: Option<Value>,
}

/// Resolved, queryable view of a device instance.
#[derive(Debug, Clone)]
pub struct BoundInstance {
    device_id: String,
    model_name: String,
    model_version: u64,
    retired: Arc<AtomicBool>,
    protocol: Option<Value>,
    services: BTreeSet<String>,
    properties: HashMap<PropertyKey, BoundProperty>,
    events: HashMap<MemberKey, BoundEvent>,
    commands: HashMap<MemberKey, BoundCommand>,
}

impl BoundInstance {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> u64 {
        self.model_version
    }

    pub fn protocol(&self) -> Option<&Value> {
        self.protocol.as_ref()
    }

    /// Whether the model registration this binding was made against was replaced.
    pub fn is_stale(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn ensure_current(&self) -> TwinResult<()> {
        if self.is_stale() {
            return Err(TwinError::StaleBinding {
                device_id: self.device_id.clone(),
                model: self.model_name.clone(),
            });
        }
        Ok(())
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(String::as_str)
    }

    pub fn property(&self, key: &PropertyKey) -> Option<&BoundProperty> {
        self.properties.get(key)
    }

    pub fn resolve_property(&self, key: &PropertyKey) -> TwinResult<&BoundProperty> {
        self.properties
            .get(key)
            .ok_or_else(|| TwinError::UnknownProperty(key.clone()))
    }

    pub fn has_property(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    pub fn property_keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.properties.keys()
    }

    pub fn event(&self, key: &MemberKey) -> Option<&BoundEvent> {
        self.events.get(key)
    }

    pub fn command(&self, key: &MemberKey) -> Option<&BoundCommand> {
        self.commands.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MemberKind {
    Property,
    Event,
    Command,
}

fn parse_blob(text: &str, what: &str) -> TwinResult<Option<Value>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| TwinError::InvalidConfig(format!("{} is not valid JSON: {}", what, e)))
}

/// Tracks (service, kind, member) triples already configured.
#[derive(Default)]
struct SeenConfigs(HashSet<(String, MemberKind, String)>);

impl SeenConfigs {
    fn claim(&mut self, service: &str, kind: MemberKind, member: &str) -> TwinResult<()> {
        if !self
            .0
            .insert((service.to_string(), kind, member.to_string()))
        {
            return Err(TwinError::DuplicateAccessConfig {
                service: service.to_string(),
                member: member.to_string(),
            });
        }
        Ok(())
    }
}

/// Resolve a device spec against a registered model.
///
/// An empty extension config binds every service of the model without
/// access configuration.
pub fn bind(
    device_id: &str,
    spec: &DeviceSpec,
    registered: &RegisteredModel,
) -> TwinResult<BoundInstance> {
    let model = registered.model();
    if spec.device_model_ref != model.name {
        return Err(TwinError::InvalidConfig(format!(
            "device {} references model {}, not {}",
            device_id, spec.device_model_ref, model.name
        )));
    }

    let protocol = parse_blob(&spec.protocol, "protocol")?;

    let defaults: Vec<ServiceSpec>;
    let service_specs: &[ServiceSpec] = if spec.extension_config.services.is_empty() {
        defaults = model
            .services()
            .iter()
            .map(|s| ServiceSpec::new(&s.name))
            .collect();
        &defaults
    } else {
        &spec.extension_config.services
    };

    let mut bound = BoundInstance {
        device_id: device_id.to_string(),
        model_name: model.name.clone(),
        model_version: registered.version(),
        retired: registered.retired_flag(),
        protocol,
        services: BTreeSet::new(),
        properties: HashMap::new(),
        events: HashMap::new(),
        commands: HashMap::new(),
    };
    let mut seen = SeenConfigs::default();

    for service_spec in service_specs {
        let definition = model
            .find_service(&service_spec.name)
            .ok_or_else(|| TwinError::UnknownService(service_spec.name.clone()))?;
        bind_service(&mut bound, &mut seen, definition, service_spec)?;
    }

    tracing::debug!(
        device_id,
        model = %bound.model_name,
        properties = bound.properties.len(),
        "Bound device instance"
    );
    Ok(bound)
}

fn bind_service(
    bound: &mut BoundInstance,
    seen: &mut SeenConfigs,
    definition: &ServiceDefinition,
    spec: &ServiceSpec,
) -> TwinResult<()> {
    let service = definition.name.as_str();
    bound.services.insert(service.to_string());

    for p in &definition.properties {
        bound
            .properties
            .entry(MemberKey::new(service, &p.name))
            .or_insert_with(|| BoundProperty {
                definition: p.clone(),
                access_config: None,
            });
    }
    for e in &definition.events {
        bound
            .events
            .entry(MemberKey::new(service, &e.name))
            .or_insert_with(|| BoundEvent {
                definition: e.clone(),
                access_config: None,
            });
    }
    for c in &definition.commands {
        bound
            .commands
            .entry(MemberKey::new(service, &c.name))
            .or_insert_with(|| BoundCommand {
                definition: c.clone(),
                access_config: None,
            });
    }

    for member in &spec.properties {
        resolve(definition, member, MemberKind::Property)?;
        seen.claim(service, MemberKind::Property, &member.name)?;
        let access = parse_blob(&member.access_config, &access_label(service, member))?;
        if let Some(p) = bound.properties.get_mut(&MemberKey::new(service, &member.name)) {
            p.access_config = access;
        }
    }
    for member in &spec.events {
        resolve(definition, member, MemberKind::Event)?;
        seen.claim(service, MemberKind::Event, &member.name)?;
        let access = parse_blob(&member.access_config, &access_label(service, member))?;
        if let Some(e) = bound.events.get_mut(&MemberKey::new(service, &member.name)) {
            e.access_config = access;
        }
    }
    for member in &spec.commands {
        resolve(definition, member, MemberKind::Command)?;
        seen.claim(service, MemberKind::Command, &member.name)?;
        let access = parse_blob(&member.access_config, &access_label(service, member))?;
        if let Some(c) = bound.commands.get_mut(&MemberKey::new(service, &member.name)) {
            c.access_config = access;
        }
    }
    Ok(())
}

fn resolve(definition: &ServiceDefinition, member: &MemberSpec, kind: MemberKind) -> TwinResult<()> {
    let found = match kind {
        MemberKind::Property => definition.find_property(&member.name).is_some(),
        MemberKind::Event => definition.find_event(&member.name).is_some(),
        MemberKind::Command => definition.find_command(&member.name).is_some(),
    };
    if !found {
        return Err(TwinError::UnknownMember {
            service: definition.name.clone(),
            member: member.name.clone(),
        });
    }
    Ok(())
}

fn access_label(service: &str, member: &MemberSpec) -> String {
    format!("access config of {}/{}", service, member.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdl::{CommandDefinition, DeviceModel, EventDefinition, EventKind, ValueDefinition};
    use crate::registry::{ModelRegistry, UpdatePolicy};

    fn thermometer() -> DeviceModel {
        DeviceModel::new("Thermometer")
            .with_service(
                ServiceDefinition::new("svc")
                    .with_property(PropertyDefinition::read_write(
                        "targetTemp",
                        ValueDefinition::double_range(10.0, 30.0),
                    ))
                    .with_property(PropertyDefinition::read_only(
                        "currentTemp",
                        ValueDefinition::double_range(-20.0, 60.0),
                    ))
                    .with_event(EventDefinition::new("overheat", EventKind::Alert))
                    .with_command(CommandDefinition::new("reset")),
            )
            .with_service(ServiceDefinition::new("diag").with_property(
                PropertyDefinition::read_only("uptime", ValueDefinition::integer_range(0, i64::MAX)),
            ))
    }

    fn setup() -> (ModelRegistry, Arc<RegisteredModel>) {
        let registry = ModelRegistry::new();
        let registered = registry.register(thermometer()).unwrap();
        (registry, registered)
    }

    #[test]
    fn test_bind_resolves_entries() {
        let (_, registered) = setup();
        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_protocol("modbus", r#"{"slave": 1}"#)
            .with_service(
                ServiceSpec::new("svc")
                    .with_property("targetTemp", r#"{"register": 40001}"#)
                    .with_event("overheat", "")
                    .with_command("reset", r#"{"coil": 3}"#),
            );

        let bound = bind("dev1", &spec, &registered).unwrap();
        let target = bound
            .property(&PropertyKey::new("svc", "targetTemp"))
            .unwrap();
        assert_eq!(target.access_config.as_ref().unwrap()["register"], 40001);
        // Unlisted properties of a bound service are still bound
        assert!(bound.has_property(&PropertyKey::new("svc", "currentTemp")));
        // Services not listed are not
        assert!(!bound.has_property(&PropertyKey::new("diag", "uptime")));
        assert!(bound.command(&MemberKey::new("svc", "reset")).is_some());
        assert_eq!(bound.protocol().unwrap()["slave"], 1);
        assert!(!bound.is_stale());
    }

    #[test]
    fn test_empty_extension_config_binds_everything() {
        let (_, registered) = setup();
        let bound = bind("dev1", &DeviceSpec::new("t1", "Thermometer"), &registered).unwrap();
        assert_eq!(bound.services().collect::<Vec<_>>(), vec!["diag", "svc"]);
        assert!(bound.has_property(&PropertyKey::new("diag", "uptime")));
    }

    #[test]
    fn test_unknown_service_and_member() {
        let (_, registered) = setup();

        let spec = DeviceSpec::new("t1", "Thermometer").with_service(ServiceSpec::new("nope"));
        assert_eq!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::UnknownService("nope".to_string())
        );

        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_service(ServiceSpec::new("svc").with_property("humidity", ""));
        assert!(matches!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::UnknownMember { .. }
        ));

        // A command name is not a property
        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_service(ServiceSpec::new("svc").with_property("reset", ""));
        assert!(matches!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::UnknownMember { .. }
        ));
    }

    #[test]
    fn test_removing_bad_entry_leaves_others_valid() {
        let (_, registered) = setup();
        let good = ServiceSpec::new("svc").with_property("targetTemp", "");
        let bad = ServiceSpec::new("svc").with_property("humidity", "");

        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_service(good.clone())
            .with_service(ServiceSpec::new("diag").with_property("uptime", ""));
        assert!(bind("dev1", &spec, &registered).is_ok());

        let with_bad = spec.clone().with_service(bad);
        assert!(bind("dev1", &with_bad, &registered).is_err());
    }

    #[test]
    fn test_duplicate_access_config() {
        let (_, registered) = setup();
        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_service(ServiceSpec::new("svc").with_property("targetTemp", "{}"))
            .with_service(ServiceSpec::new("svc").with_property("targetTemp", "{}"));
        assert_eq!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::DuplicateAccessConfig {
                service: "svc".to_string(),
                member: "targetTemp".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_json_blobs() {
        let (_, registered) = setup();
        let spec = DeviceSpec::new("t1", "Thermometer").with_protocol("modbus", "{not json");
        assert!(matches!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::InvalidConfig(_)
        ));

        let spec = DeviceSpec::new("t1", "Thermometer")
            .with_service(ServiceSpec::new("svc").with_property("targetTemp", "[1,"));
        assert!(matches!(
            bind("dev1", &spec, &registered).unwrap_err(),
            TwinError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_binding_goes_stale_on_replacement() {
        let (registry, registered) = setup();
        registry.acquire("Thermometer", "dev1").unwrap();
        let bound = bind("dev1", &DeviceSpec::new("t1", "Thermometer"), &registered).unwrap();
        assert!(bound.ensure_current().is_ok());

        registry
            .update(thermometer(), UpdatePolicy::InvalidateBindings)
            .unwrap();
        assert!(matches!(
            bound.ensure_current(),
            Err(TwinError::StaleBinding { .. })
        ));
    }
}
