//! Device record persistence
//!
//! The twin service writes model and device records through to a
//! [`DeviceRecordStore`] when one is attached. Twin values are not
//! persisted; they are rebuilt from reports after a restart.

use dashmap::DashMap;

use crate::error::{TwinError, TwinResult};
use crate::instance::Device;
use crate::mdl::DeviceModel;

/// Storage backend for model and device records.
pub trait DeviceRecordStore: Send + Sync {
    fn save_model(&self, model: &DeviceModel) -> TwinResult<()>;

    fn delete_model(&self, name: &str) -> TwinResult<()>;

    fn load_models(&self) -> TwinResult<Vec<DeviceModel>>;

    fn save_device(&self, device: &Device) -> TwinResult<()>;

    fn delete_device(&self, device_id: &str) -> TwinResult<()>;

    fn load_devices(&self) -> TwinResult<Vec<Device>>;
}

/// In-memory record store. Records are kept serialized so a load returns
/// exactly what a durable backend would.
#[derive(Default)]
pub struct MemoryRecordStore {
    models: DashMap<String, String>,
    devices: DashMap<String, String>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> TwinResult<String> {
    serde_json::to_string(value).map_err(|e| TwinError::Storage(e.to_string()))
}

fn decode_all<T: serde::de::DeserializeOwned>(map: &DashMap<String, String>) -> TwinResult<Vec<(String, T)>> {
    let mut out = Vec::with_capacity(map.len());
    for item in map.iter() {
        let value = serde_json::from_str(item.value())
            .map_err(|e| TwinError::Storage(format!("corrupt record {}: {}", item.key(), e)))?;
        out.push((item.key().clone(), value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

impl DeviceRecordStore for MemoryRecordStore {
    fn save_model(&self, model: &DeviceModel) -> TwinResult<()> {
        self.models.insert(model.name.clone(), encode(model)?);
        Ok(())
    }

    fn delete_model(&self, name: &str) -> TwinResult<()> {
        self.models.remove(name);
        Ok(())
    }

    fn load_models(&self) -> TwinResult<Vec<DeviceModel>> {
        Ok(decode_all(&self.models)?.into_iter().map(|(_, m)| m).collect())
    }

    fn save_device(&self, device: &Device) -> TwinResult<()> {
        self.devices.insert(device.device_id.clone(), encode(device)?);
        Ok(())
    }

    fn delete_device(&self, device_id: &str) -> TwinResult<()> {
        self.devices.remove(device_id);
        Ok(())
    }

    fn load_devices(&self) -> TwinResult<Vec<Device>> {
        Ok(decode_all(&self.devices)?.into_iter().map(|(_, d)| d).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::DeviceSpec;
    use crate::mdl::{PropertyDefinition, ServiceDefinition, ValueDefinition};

    #[test]
    fn test_save_load_delete() {
        let store = MemoryRecordStore::new();
        let model = DeviceModel::new("Lamp").with_service(
            ServiceDefinition::new("light")
                .with_property(PropertyDefinition::read_write("on", ValueDefinition::boolean())),
        );
        store.save_model(&model).unwrap();
        store.save_device(&Device::new("b", DeviceSpec::new("b", "Lamp"))).unwrap();
        store.save_device(&Device::new("a", DeviceSpec::new("a", "Lamp"))).unwrap();

        assert_eq!(store.load_models().unwrap(), vec![model]);
        let ids: Vec<String> = store.load_devices().unwrap().into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        store.delete_device("a").unwrap();
        store.delete_model("Lamp").unwrap();
        assert_eq!(store.device_count(), 1);
        assert_eq!(store.model_count(), 0);
    }
}
