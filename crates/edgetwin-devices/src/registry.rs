//! Schema Registry - device model definitions and their references
//!
//! Models are immutable once registered. Replacing a model swaps in a new
//! registration; the old one is retired so bindings made against it can be
//! detected as stale without consulting the registry again.
//!
//! The table sits behind a single read/write lock: lookups take the read
//! side, registration and removal the write side. Reference tracking lives
//! under the same lock so a model cannot disappear between lookup and bind.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{TwinError, TwinResult};
use crate::mdl::DeviceModel;

/// A registered model plus its registration identity.
#[derive(Debug)]
pub struct RegisteredModel {
    model: DeviceModel,
    version: u64,
    retired: Arc<AtomicBool>,
}

impl RegisteredModel {
    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }

    /// Registration version, unique across the registry's lifetime.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Shared flag flipped when this registration is replaced.
    pub fn retired_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.retired)
    }
}

/// How [`ModelRegistry::update`] treats models that devices still use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Fail with `InUse` if any device references the model
    #[default]
    RejectInUse,
    /// Replace anyway; bound devices fail writes with `StaleBinding` until re-bound
    InvalidateBindings,
}

#[derive(Default)]
struct RegistryInner {
    models: HashMap<String, Arc<RegisteredModel>>,
    /// model name -> ids of devices bound to it
    references: HashMap<String, BTreeSet<String>>,
    next_version: u64,
}

impl RegistryInner {
    fn make(&mut self, model: DeviceModel) -> Arc<RegisteredModel> {
        self.next_version += 1;
        Arc::new(RegisteredModel {
            model,
            version: self.next_version,
            retired: Arc::new(AtomicBool::new(false)),
        })
    }

    fn reference_count(&self, name: &str) -> usize {
        self.references.get(name).map(|r| r.len()).unwrap_or(0)
    }
}

/// Device model registry.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new model.
    pub fn register(&self, model: DeviceModel) -> TwinResult<Arc<RegisteredModel>> {
        model.validate().map_err(TwinError::InvalidModel)?;

        let mut inner = self.inner.write();
        if inner.models.contains_key(&model.name) {
            return Err(TwinError::DuplicateModel(model.name));
        }
        let name = model.name.clone();
        let registered = inner.make(model);
        inner.models.insert(name.clone(), Arc::clone(&registered));
        drop(inner);

        tracing::info!(model = %name, version = registered.version, "Registered device model");
        Ok(registered)
    }

    pub fn get(&self, name: &str) -> TwinResult<Arc<RegisteredModel>> {
        self.inner
            .read()
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| TwinError::NotFound(format!("device model {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().models.contains_key(name)
    }

    /// All models, sorted by name.
    pub fn list(&self) -> Vec<DeviceModel> {
        let inner = self.inner.read();
        let mut models: Vec<DeviceModel> =
            inner.models.values().map(|r| r.model.clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn len(&self) -> usize {
        self.inner.read().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a model wholesale.
    ///
    /// Returns the new registration and the devices whose bindings it
    /// invalidated (always empty under `RejectInUse`).
    pub fn update(
        &self,
        model: DeviceModel,
        policy: UpdatePolicy,
    ) -> TwinResult<(Arc<RegisteredModel>, Vec<String>)> {
        model.validate().map_err(TwinError::InvalidModel)?;

        let mut inner = self.inner.write();
        let Some(previous) = inner.models.get(&model.name).cloned() else {
            return Err(TwinError::NotFound(format!("device model {}", model.name)));
        };

        let in_use = inner.reference_count(&model.name);
        if in_use > 0 && policy == UpdatePolicy::RejectInUse {
            return Err(TwinError::InUse {
                model: model.name,
                devices: in_use,
            });
        }

        let affected: Vec<String> = inner
            .references
            .get(&model.name)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();

        previous.retired.store(true, Ordering::Release);
        let name = model.name.clone();
        let registered = inner.make(model);
        inner.models.insert(name.clone(), Arc::clone(&registered));
        drop(inner);

        tracing::info!(
            model = %name,
            version = registered.version,
            invalidated = affected.len(),
            "Replaced device model"
        );
        Ok((registered, affected))
    }

    /// Remove a model no device references.
    pub fn remove(&self, name: &str) -> TwinResult<DeviceModel> {
        let mut inner = self.inner.write();
        let in_use = inner.reference_count(name);
        if in_use > 0 {
            return Err(TwinError::InUse {
                model: name.to_string(),
                devices: in_use,
            });
        }
        let removed = inner
            .models
            .remove(name)
            .ok_or_else(|| TwinError::NotFound(format!("device model {}", name)))?;
        inner.references.remove(name);
        drop(inner);

        removed.retired.store(true, Ordering::Release);
        tracing::info!(model = %name, "Removed device model");
        Ok(removed.model.clone())
    }

    /// Look up a model and record that `device_id` references it.
    pub fn acquire(&self, name: &str, device_id: &str) -> TwinResult<Arc<RegisteredModel>> {
        let mut inner = self.inner.write();
        let registered = inner
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| TwinError::NotFound(format!("device model {}", name)))?;
        inner
            .references
            .entry(name.to_string())
            .or_default()
            .insert(device_id.to_string());
        Ok(registered)
    }

    /// Drop a reference recorded by [`acquire`](Self::acquire).
    pub fn release(&self, name: &str, device_id: &str) {
        let mut inner = self.inner.write();
        if let Some(refs) = inner.references.get_mut(name) {
            refs.remove(device_id);
            if refs.is_empty() {
                inner.references.remove(name);
            }
        }
    }

    /// Ids of devices referencing a model, sorted.
    pub fn references(&self, name: &str) -> Vec<String> {
        self.inner
            .read()
            .references
            .get(name)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}
