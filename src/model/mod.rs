use serde::{Deserialize, Serialize};
use std::fmt;

pub const TEMPERATURE_UNIT: &str = "°C";
pub const HOURS_UNIT: &str = "h";
pub const TIME_LEFT_PLACEHOLDER: &str = "---";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    #[default]
    Connecting,
    Operational,
    Printing,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Finishing,
    Error,
    Offline,
    Closed,
    Unknown,
}

impl PrinterState {
    /// Maps the human-readable `state.text` of a snapshot, ignoring case.
    pub fn from_state_text(text: &str) -> Self {
        match text.trim().to_lowercase().as_str() {
            "connecting"
            | "opening serial connection"
            | "detecting serial connection"
            | "detecting baudrate" => Self::Connecting,
            "operational" => Self::Operational,
            "printing" | "printing from sd" => Self::Printing,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "resuming" => Self::Resuming,
            "cancelling" => Self::Cancelling,
            "finishing" => Self::Finishing,
            "error" | "offline after error" => Self::Error,
            "offline" => Self::Offline,
            "closed" => Self::Closed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub current: i32,
    pub set: i32,
    pub unit: String,
}

impl Default for Temperature {
    fn default() -> Self {
        Self {
            current: 0,
            set: 0,
            unit: TEMPERATURE_UNIT.to_string(),
        }
    }
}

/// Live printer snapshot. Subscribers receive clones; only the connection mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub status: PrinterState,
    pub bed: Temperature,
    pub tool0: Temperature,
    /// Part-cooling fan, 0-100.
    pub fan_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    pub value: String,
    pub unit: Option<String>,
}

impl TimeValue {
    pub fn hours(value: String) -> Self {
        Self {
            value,
            unit: Some(HOURS_UNIT.to_string()),
        }
    }

    pub fn placeholder() -> Self {
        Self {
            value: TIME_LEFT_PLACEHOLDER.to_string(),
            unit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ZHeight {
    Height(f64),
    Layers { current: u32, total: i64 },
}

impl ZHeight {
    pub fn initial(layer_progress: bool) -> Self {
        if layer_progress {
            Self::Layers {
                current: 0,
                total: -1,
            }
        } else {
            Self::Height(0.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Display name without the `.gcode`/`.ufp` suffix; identity of the job.
    pub file: Option<String>,
    pub full_path: Option<String>,
    pub progress: u8,
    pub z_height: ZHeight,
    /// Grams.
    pub filament_amount: f64,
    pub time_printed: Option<TimeValue>,
    pub time_left: TimeValue,
    pub estimated_print_time: Option<TimeValue>,
    pub estimated_end_time: Option<String>,
}

impl JobStatus {
    pub fn initial(layer_progress: bool) -> Self {
        Self {
            file: None,
            full_path: None,
            progress: 0,
            z_height: ZHeight::initial(layer_progress),
            filament_amount: 0.0,
            time_printed: None,
            time_left: TimeValue::placeholder(),
            estimated_print_time: None,
            estimated_end_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrinterEvent {
    #[default]
    Unknown,
    Connected,
    Closed,
    Printing,
    Paused,
    Idle,
}

/// Operator prompt or notice pushed by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterNotification {
    pub action: String,
    pub message: String,
    pub text: String,
    pub choices: Vec<String>,
}

/// What the event channel carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventUpdate {
    Lifecycle(PrinterEvent),
    Notification(PrinterNotification),
}

impl From<PrinterEvent> for EventUpdate {
    fn from(event: PrinterEvent) -> Self {
        Self::Lifecycle(event)
    }
}

impl From<PrinterNotification> for EventUpdate {
    fn from(notification: PrinterNotification) -> Self {
        Self::Notification(notification)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    pub eeprom: Option<bool>,
    pub z_probe: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ZOffset {
    pub printer_cap: PrinterCapabilities,
    pub z_offset: f64,
}

/// Credential for one socket handshake. Consumed when the auth payload is built.
#[derive(Clone, PartialEq, Eq)]
pub struct SocketAuth {
    pub user: String,
    pub session: String,
}

impl fmt::Debug for SocketAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAuth")
            .field("user", &self.user)
            .field("session", &"<redacted>")
            .finish()
    }
}
