//! Decoding of the OctoPrint push socket.
//!
//! Every frame is a JSON object whose single top-level key says what it is.
//! Payload fields are all optional: a field that is missing, `null` or of an
//! unexpected shape decodes as `None` instead of failing the whole frame.

use crate::error::ProtocolError;
use crate::model::{PrinterNotification, SocketAuth};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const KLIPPER_PLUGIN: &str = "klipper";
pub const LAYER_PROGRESS_PLUGIN: &str = "DisplayLayerProgress-websocket-payload";
pub const ACTION_PROMPT_PLUGIN: &str = "action_command_prompt";
pub const ACTION_NOTIFICATION_PLUGIN: &str = "action_command_notification";
pub const Z_OFFSET_PLUGIN: &str = "z_probe_offset_universal";

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_payload<T: DeserializeOwned + Default>(value: Value) -> T {
    serde_json::from_value(value).unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CurrentPayload {
    #[serde(deserialize_with = "lenient")]
    pub state: Option<StateInfo>,
    #[serde(deserialize_with = "lenient")]
    pub temps: Option<Vec<TemperatureSample>>,
    #[serde(deserialize_with = "lenient")]
    pub logs: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient")]
    pub job: Option<JobInfo>,
    #[serde(deserialize_with = "lenient")]
    pub progress: Option<ProgressInfo>,
    #[serde(rename = "currentZ", deserialize_with = "lenient_number")]
    pub current_z: Option<f64>,
}

impl CurrentPayload {
    pub fn state_text(&self) -> Option<&str> {
        self.state.as_ref()?.text.as_deref()
    }

    pub fn first_temperature(&self) -> Option<&TemperatureSample> {
        self.temps.as_ref()?.first()
    }

    pub fn file(&self) -> Option<&FileInfo> {
        self.job.as_ref()?.file.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StateInfo {
    #[serde(deserialize_with = "lenient_text")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TemperatureSample {
    #[serde(deserialize_with = "lenient")]
    pub bed: Option<HeaterReading>,
    #[serde(deserialize_with = "lenient")]
    pub tool0: Option<HeaterReading>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeaterReading {
    #[serde(deserialize_with = "lenient_number")]
    pub actual: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    #[serde(deserialize_with = "lenient")]
    pub file: Option<FileInfo>,
    /// Per tool (`tool0`, `tool1`, ...); a tool entry may be `null`.
    #[serde(deserialize_with = "lenient")]
    pub filament: Option<BTreeMap<String, Option<FilamentUsage>>>,
    #[serde(rename = "estimatedPrintTime", deserialize_with = "lenient_number")]
    pub estimated_print_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileInfo {
    #[serde(deserialize_with = "lenient_text")]
    pub display: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub origin: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilamentUsage {
    /// Millimetres.
    #[serde(deserialize_with = "lenient_number")]
    pub length: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProgressInfo {
    #[serde(deserialize_with = "lenient_number")]
    pub completion: Option<f64>,
    #[serde(rename = "printTime", deserialize_with = "lenient_number")]
    pub print_time: Option<f64>,
    #[serde(rename = "printTimeLeft", deserialize_with = "lenient_number")]
    pub print_time_left: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventPayload {
    #[serde(rename = "type", deserialize_with = "lenient_text")]
    pub event_type: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PluginEnvelope {
    #[serde(deserialize_with = "lenient_text")]
    plugin: Option<String>,
    data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KlipperData {
    #[serde(deserialize_with = "lenient_text")]
    pub subtype: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LayerProgressData {
    #[serde(deserialize_with = "lenient_text")]
    pub fanspeed: Option<String>,
    #[serde(rename = "currentLayer", deserialize_with = "lenient_text")]
    pub current_layer: Option<String>,
    #[serde(rename = "totalLayer", deserialize_with = "lenient_text")]
    pub total_layer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ActionCommandData {
    #[serde(deserialize_with = "lenient_text")]
    action: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    message: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    text: Option<String>,
    #[serde(deserialize_with = "lenient")]
    choices: Option<Vec<String>>,
}

impl ActionCommandData {
    fn into_notification(self) -> PrinterNotification {
        PrinterNotification {
            action: self.action.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
            text: self.text.unwrap_or_default(),
            choices: self.choices.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ZProbeOffsetData {
    #[serde(deserialize_with = "lenient_number")]
    pub msg: Option<f64>,
}

/// Plugin-scoped payload, keyed by the plugin identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginPayload {
    Klipper(KlipperData),
    LayerProgress(LayerProgressData),
    Action(PrinterNotification),
    ZProbeOffset(ZProbeOffsetData),
    /// `data` was not an object.
    Malformed(String),
    Unknown(String),
}

impl PluginPayload {
    pub fn from_parts(plugin: &str, data: Value) -> Self {
        match plugin {
            KLIPPER_PLUGIN => decode_plugin(plugin, data, Self::Klipper),
            LAYER_PROGRESS_PLUGIN => decode_plugin(plugin, data, Self::LayerProgress),
            ACTION_PROMPT_PLUGIN | ACTION_NOTIFICATION_PLUGIN => {
                decode_plugin(plugin, data, |action: ActionCommandData| {
                    Self::Action(action.into_notification())
                })
            }
            Z_OFFSET_PLUGIN => decode_plugin(plugin, data, Self::ZProbeOffset),
            other => Self::Unknown(other.to_string()),
        }
    }
}

fn decode_plugin<T, F>(plugin: &str, data: Value, wrap: F) -> PluginPayload
where
    T: DeserializeOwned,
    F: FnOnce(T) -> PluginPayload,
{
    match serde_json::from_value(data) {
        Ok(payload) => wrap(payload),
        Err(_) => PluginPayload::Malformed(plugin.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Current(Box<CurrentPayload>),
    Event(EventPayload),
    Plugin(PluginPayload),
    Reauth,
    Connected,
    /// Carries the first key seen, if any.
    Unrecognized(Option<String>),
}

pub fn decode(text: &str) -> Result<InboundMessage, ProtocolError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => Ok(classify(object)),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Keys are tried in the order current, event, plugin, reauth, connected;
/// the first one present wins.
pub fn classify(mut object: Map<String, Value>) -> InboundMessage {
    if let Some(current) = object.remove("current") {
        return InboundMessage::Current(Box::new(lenient_payload(current)));
    }
    if let Some(event) = object.remove("event") {
        return InboundMessage::Event(lenient_payload(event));
    }
    if let Some(plugin) = object.remove("plugin") {
        let envelope: PluginEnvelope = lenient_payload(plugin);
        let id = envelope.plugin.unwrap_or_default();
        return InboundMessage::Plugin(PluginPayload::from_parts(&id, envelope.data));
    }
    if object.contains_key("reauth") {
        return InboundMessage::Reauth;
    }
    if object.contains_key("connected") {
        return InboundMessage::Connected;
    }
    InboundMessage::Unrecognized(object.keys().next().cloned())
}

#[derive(Debug, Serialize)]
struct AuthPayload {
    auth: String,
}

/// Handshake frame `{"auth": "<user>:<session>"}`. Takes the credential by value.
pub fn encode_auth(credential: SocketAuth) -> Result<String, ProtocolError> {
    let payload = AuthPayload {
        auth: format!("{}:{}", credential.user, credential.session),
    };
    Ok(serde_json::to_string(&payload)?)
}
