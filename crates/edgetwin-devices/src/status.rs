//! Device status lifecycle.
//!
//! ```text
//!            StartCollect                 online msg
//!  inactive ─────────────▶ active ─────────────────────▶ online
//!     ▲                      │                           │  ▲
//!     │ StopCollect          │ offline msg / timeout     │  │ online msg
//!     └──── (any collecting) ▼                           ▼  │
//!                          offline ◀──────────────────────  │
//!                                                           │
//!  any collecting state ── property error ──▶ error ── all errors cleared
//! ```
//!
//! Transitions are total: an input that does not apply to the current state
//! leaves it unchanged and records a diagnostic.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mdl::PropertyKey;

/// Device status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Inactive,
    Active,
    Online,
    Offline,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// States in which outbound desired-state intents are worth sending.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Active | Self::Online)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity reported by a device status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    /// Parse the wire value; unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Inputs to the status machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSignal {
    StartCollect,
    StopCollect,
    Connectivity(Connectivity),
    /// No report within the liveness window
    LivenessTimeout,
    /// A reported property carried an error message
    PropertyError(PropertyKey),
    /// A reported property arrived without error
    PropertyClean(PropertyKey),
    /// Status message with a status string nobody recognizes
    Unrecognized(String),
}

/// Outcome of feeding one signal to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeviceState,
    pub to: DeviceState,
    pub collecting: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// A signal that did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: i64,
    pub state: DeviceState,
    pub message: String,
}

/// Per-device status state machine.
#[derive(Debug, Clone)]
pub struct StatusMachine {
    state: DeviceState,
    collecting: bool,
    errored: BTreeSet<PropertyKey>,
    last_error: Option<String>,
    last_status_at: Option<i64>,
    diagnostics: VecDeque<Diagnostic>,
    max_diagnostics: usize,
}

impl StatusMachine {
    pub fn new(max_diagnostics: usize) -> Self {
        Self {
            state: DeviceState::Inactive,
            collecting: false,
            errored: BTreeSet::new(),
            last_error: None,
            last_status_at: None,
            diagnostics: VecDeque::new(),
            max_diagnostics,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Properties whose latest report carried an error.
    pub fn errored_properties(&self) -> impl Iterator<Item = &PropertyKey> {
        self.errored.iter()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Record a device-level error message without changing state.
    pub fn record_device_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    /// Timestamp of the newest stamped status message applied so far.
    pub fn last_status_at(&self) -> Option<i64> {
        self.last_status_at
    }

    /// Admit a status message stamped at `timestamp` (millis, 0 = unstamped).
    ///
    /// Stamped messages older than the newest one already applied are
    /// rejected with a diagnostic. Unstamped messages are always admitted.
    pub fn admit_status_at(&mut self, timestamp: i64) -> bool {
        if timestamp <= 0 {
            return true;
        }
        if let Some(last) = self.last_status_at {
            if timestamp < last {
                self.note(format!(
                    "status message at {} older than last applied at {}",
                    timestamp, last
                ));
                return false;
            }
        }
        self.last_status_at = Some(timestamp);
        true
    }

    /// The no-op transition for the current state.
    pub fn current(&self) -> Transition {
        Transition {
            from: self.state,
            to: self.state,
            collecting: self.collecting,
        }
    }

    /// Forget a property, e.g. when it is no longer bound.
    pub fn forget_property(&mut self, key: &PropertyKey) -> Transition {
        self.apply(StatusSignal::PropertyClean(key.clone()))
    }

    /// Feed a signal. Never fails.
    pub fn apply(&mut self, signal: StatusSignal) -> Transition {
        let from = self.state;
        match signal {
            StatusSignal::StartCollect => {
                if self.collecting {
                    self.note("start collect while already collecting");
                } else {
                    self.collecting = true;
                    self.state = DeviceState::Active;
                }
            }
            StatusSignal::StopCollect => {
                if self.collecting {
                    self.collecting = false;
                    self.errored.clear();
                    self.state = DeviceState::Inactive;
                } else {
                    self.note("stop collect while not collecting");
                }
            }
            StatusSignal::Connectivity(Connectivity::Online) => match self.state {
                DeviceState::Active | DeviceState::Online | DeviceState::Offline => {
                    self.state = if self.errored.is_empty() {
                        DeviceState::Online
                    } else {
                        DeviceState::Error
                    };
                }
                DeviceState::Inactive => self.note("online status while inactive"),
                DeviceState::Error => self.note("online status while property errors outstanding"),
            },
            StatusSignal::Connectivity(Connectivity::Offline) | StatusSignal::LivenessTimeout => {
                if self.collecting {
                    self.state = DeviceState::Offline;
                } else {
                    self.note("offline signal while not collecting");
                }
            }
            StatusSignal::PropertyError(key) => {
                if self.collecting {
                    self.errored.insert(key);
                    self.state = DeviceState::Error;
                } else {
                    self.note(format!("error on {} while not collecting", key));
                }
            }
            StatusSignal::PropertyClean(key) => {
                if self.errored.remove(&key)
                    && self.errored.is_empty()
                    && self.state == DeviceState::Error
                {
                    self.state = DeviceState::Online;
                }
            }
            StatusSignal::Unrecognized(status) => {
                self.note(format!("unrecognized device status '{}'", status));
            }
        }

        Transition {
            from,
            to: self.state,
            collecting: self.collecting,
        }
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(state = %self.state, "Ignored status signal: {}", message);
        if self.max_diagnostics == 0 {
            return;
        }
        while self.diagnostics.len() >= self.max_diagnostics {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(Diagnostic {
            timestamp: edgetwin_core::now_millis(),
            state: self.state,
            message,
        });
    }
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new(edgetwin_core::config::defaults::STATUS_MAX_DIAGNOSTICS)
    }
}
