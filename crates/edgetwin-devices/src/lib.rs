//! EdgeTwin Devices
//!
//! Device model registry and device twin engine for edge gateways.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      TwinService                          │
//! │  models ─ devices ─ twin writes ─ status ─ batches        │
//! └──────┬───────────────┬──────────────────┬────────────────┘
//!        │               │                  │
//!   ModelRegistry    TwinStore          Reconciler ──▶ IntentSink
//!   (RwLock)         (DashMap of        (diff, plan)
//!        │            Mutex<DeviceEntry>)
//!        └──▶ bind() ──▶ BoundInstance
//! ```
//!
//! ## Modules
//!
//! - `mdl`: device model definitions and value checking
//! - `instance`: device instance records
//! - `registry`: model registration and reference tracking
//! - `binder`: resolving an instance against its model
//! - `twin`: desired/reported state per device
//! - `status`: device status lifecycle
//! - `reconciler`: divergence and outbound intents
//! - `ingest`: batch report and status messages
//! - `store`: record persistence
//! - `liveness`: offline detection task
//! - `service`: the facade tying it together

pub mod binder;
pub mod error;
pub mod event;
pub mod ingest;
pub mod instance;
pub mod liveness;
pub mod mdl;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod status;
pub mod store;
pub mod twin;

pub use binder::{BoundInstance, BoundProperty, bind};
pub use error::{TwinError, TwinResult};
pub use event::TwinEvent;
pub use ingest::{
    BatchReport, DeviceStatusMessage, DevicesStatusMessage, PropertyResult, ReportDeviceMessage,
    ReportDevicesMessage, StatusBatchReport, StatusResult,
};
pub use instance::{
    Device, DeviceKind, DeviceList, DeviceSpec, DeviceSpecMeta, DeviceStatus, ExtensionConfig,
    MemberSpec, ServiceSpec,
};
pub use liveness::{LivenessHandle, LivenessMonitor};
pub use mdl::{
    AccessMode, CommandDefinition, DeviceModel, DeviceModelList, EventDefinition, EventKind,
    MemberKey, PropertyDefinition, PropertyKey, PropertyValue, ServiceDefinition, ValueDefinition,
    ValueError,
};
pub use reconciler::{DesiredIntent, IntentSink, Reconciler, TwinDelta, diff};
pub use registry::{ModelRegistry, RegisteredModel, UpdatePolicy};
pub use service::TwinService;
pub use status::{Connectivity, DeviceState, Diagnostic, StatusMachine, StatusSignal, Transition};
pub use store::{DeviceRecordStore, MemoryRecordStore};
pub use twin::{DeviceEntry, DeviceTwin, ReportOutcome, TwinProperty, TwinStore, WriteOutcome};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
