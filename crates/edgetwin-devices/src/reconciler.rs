//! Reconciler - desired/reported divergence and outbound intents
//!
//! `diff` is a pure function of a twin snapshot. Intent planning runs under
//! the device lock; dispatch to sinks happens after the lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::mdl::{PropertyKey, PropertyValue};
use crate::twin::{DeviceEntry, DeviceTwin, TwinProperty};

/// One desired key whose reported value does not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinDelta {
    pub service: String,
    pub property_name: String,
    pub desired: PropertyValue,
    /// `None` when nothing has been reported yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<PropertyValue>,
}

impl TwinDelta {
    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(&self.service, &self.property_name)
    }
}

/// Deltas between a twin's desired and reported sides, sorted by key.
pub fn diff(twin: &DeviceTwin) -> Vec<TwinDelta> {
    let desired: BTreeMap<PropertyKey, &TwinProperty> =
        twin.desired.iter().map(|p| (p.key(), p)).collect();
    let reported: BTreeMap<PropertyKey, &TwinProperty> =
        twin.reported.iter().map(|p| (p.key(), p)).collect();
    deltas(desired.into_iter(), |k| reported.get(k).copied())
}

/// Same as [`diff`], straight from an entry's maps.
pub fn diff_entry(entry: &DeviceEntry) -> Vec<TwinDelta> {
    let reported = entry.reported();
    deltas(entry.desired().iter().map(|(k, p)| (k.clone(), p)), |k| {
        reported.get(k)
    })
}

fn deltas<'a>(
    desired: impl Iterator<Item = (PropertyKey, &'a TwinProperty)>,
    reported: impl Fn(&PropertyKey) -> Option<&'a TwinProperty>,
) -> Vec<TwinDelta> {
    desired
        .filter_map(|(key, want)| {
            let have = reported(&key);
            if have.is_some_and(|r| r.value == want.value) {
                return None;
            }
            Some(TwinDelta {
                service: key.service,
                property_name: key.name,
                desired: want.value.clone(),
                reported: have.map(|r| r.value.clone()),
            })
        })
        .collect()
}

/// Work for an outbound protocol adapter: bring these properties in line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredIntent {
    pub device_id: String,
    pub deltas: Vec<TwinDelta>,
}

/// Receives intents. Implemented by protocol adapters.
///
/// Called after the device lock is released, from whichever thread made
/// the write. Implementations should hand work off rather than block.
pub trait IntentSink: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, intent: &DesiredIntent);
}

/// Plans intents and fans them out to sinks.
#[derive(Default)]
pub struct Reconciler {
    sinks: RwLock<Vec<Arc<dyn IntentSink>>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn IntentSink>) {
        tracing::info!(sink = sink.name(), "Registered intent sink");
        self.sinks.write().push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Intent for the entry, if it accepts commands and has diverged.
    pub fn plan(&self, entry: &DeviceEntry) -> Option<DesiredIntent> {
        if !entry.status_machine().state().accepts_commands() {
            return None;
        }
        let deltas = diff_entry(entry);
        if deltas.is_empty() {
            return None;
        }
        Some(DesiredIntent {
            device_id: entry.device_id().to_string(),
            deltas,
        })
    }

    /// Hand an intent to every sink. Must not be called under a device lock.
    pub fn dispatch(&self, intent: &DesiredIntent) {
        let sinks: Vec<Arc<dyn IntentSink>> = self.sinks.read().clone();
        for sink in sinks {
            tracing::debug!(
                sink = sink.name(),
                device_id = %intent.device_id,
                deltas = intent.deltas.len(),
                "Dispatching desired intent"
            );
            sink.handle(intent);
        }
    }
}
