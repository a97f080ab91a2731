//! Per-connection state and message dispatch.
//!
//! A [`Session`] lives exactly as long as one socket connection. It owns the
//! printer and job records and the event classifier, applies every decoded
//! message to them and publishes the result. It performs no IO: messages
//! that need the connection manager to act come back as a [`Directive`].

use crate::channels::Publisher;
use crate::convert::FilamentProfile;
use crate::events::EventClassifier;
use crate::logs::{fan_speed_from_plugin, layer_from_plugin};
use crate::model::{
    JobStatus, PrinterEvent, PrinterNotification, PrinterState, PrinterStatus, ZHeight, ZOffset,
};
use crate::protocol::{
    decode, CurrentPayload, EventPayload, InboundMessage, KlipperData, LayerProgressData,
    PluginPayload, ZProbeOffsetData,
};
use crate::status::{JobContext, JobPatch, StatusPatch};
use chrono::Local;

const KLIPPER_ERROR_SUBTYPE: &str = "error";
const NOTIFICATION_SHOW: &str = "show";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionOptions {
    /// DisplayLayerProgress mode: z-height is a layer pair fed by the plugin.
    pub layer_progress: bool,
    pub filament: FilamentProfile,
}

/// Work the connection manager has to do for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Fetch a fresh credential and resend the auth frame.
    Reauthenticate,
    /// The server accepted the handshake.
    HandshakeAcknowledged,
}

pub struct Session {
    options: SessionOptions,
    printer: PrinterStatus,
    job: JobStatus,
    z_offset: Option<ZOffset>,
    classifier: EventClassifier,
    publisher: Publisher,
}

impl Session {
    /// Starts from the initial records and publishes them.
    pub fn new(options: SessionOptions, publisher: Publisher) -> Self {
        let session = Self {
            options,
            printer: PrinterStatus::default(),
            job: JobStatus::initial(options.layer_progress),
            z_offset: None,
            classifier: EventClassifier::new(),
            publisher,
        };
        session.publish_status();
        session.publish_job();
        session
    }

    /// Replaces all per-connection state, as on a reconnect.
    pub fn reset(&mut self) {
        self.printer = PrinterStatus::default();
        self.job = JobStatus::initial(self.options.layer_progress);
        self.classifier.reset();
        self.publish_status();
        self.publish_job();
    }

    pub fn printer(&self) -> &PrinterStatus {
        &self.printer
    }

    pub fn job(&self) -> &JobStatus {
        &self.job
    }

    pub fn last_state(&self) -> PrinterEvent {
        self.classifier.last_state()
    }

    /// Decodes and handles one text frame. Undecodable frames are dropped.
    pub fn handle_text(&mut self, text: &str) -> Option<Directive> {
        match decode(text) {
            Ok(message) => self.handle(message),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring undecodable frame");
                None
            }
        }
    }

    pub fn handle(&mut self, message: InboundMessage) -> Option<Directive> {
        match message {
            InboundMessage::Current(current) => {
                tracing::trace!("snapshot");
                self.apply_snapshot(&current);
                None
            }
            InboundMessage::Event(event) => {
                self.apply_event(&event);
                None
            }
            InboundMessage::Plugin(payload) => {
                self.apply_plugin(payload);
                None
            }
            InboundMessage::Reauth => Some(Directive::Reauthenticate),
            InboundMessage::Connected => Some(Directive::HandshakeAcknowledged),
            InboundMessage::Unrecognized(key) => {
                tracing::debug!(key = ?key, "ignoring unrecognized message");
                None
            }
        }
    }

    fn apply_snapshot(&mut self, current: &CurrentPayload) {
        let patch = StatusPatch::from_current(current);
        patch.apply(&mut self.printer);
        if let Some(event) = self.classifier.synthesize_from_status(self.printer.status) {
            tracing::debug!(event = ?event, "synthesized lifecycle event from status");
            self.publisher.event(event);
        }
        self.publish_status();

        let ctx = JobContext {
            layer_progress: self.options.layer_progress,
            filament: self.options.filament,
            now: Local::now().naive_local(),
        };
        JobPatch::from_current(current, &ctx).apply(&mut self.job, self.options.layer_progress);
        self.publish_job();
    }

    fn apply_event(&mut self, event: &EventPayload) {
        let Some(event_type) = event.event_type.as_deref() else {
            tracing::debug!("ignoring event without type");
            return;
        };
        match self.classifier.observe(event_type) {
            Some(lifecycle) => {
                tracing::debug!(event_type, lifecycle = ?lifecycle, "lifecycle event");
                self.publisher.event(lifecycle);
            }
            None => tracing::debug!(event_type, "ignoring untracked event"),
        }
    }

    fn apply_plugin(&mut self, payload: PluginPayload) {
        match payload {
            PluginPayload::Klipper(data) => self.apply_klipper(data),
            PluginPayload::LayerProgress(data) => {
                if self.options.layer_progress {
                    self.apply_layer_progress(&data);
                }
            }
            PluginPayload::Action(notification) => {
                self.publisher.event(notification);
            }
            PluginPayload::ZProbeOffset(data) => self.apply_plugin_z_offset(data),
            PluginPayload::Malformed(plugin) => {
                tracing::debug!(plugin = %plugin, "ignoring malformed plugin payload");
            }
            PluginPayload::Unknown(plugin) => {
                tracing::debug!(plugin = %plugin, "ignoring plugin message");
            }
        }
    }

    fn apply_klipper(&mut self, data: KlipperData) {
        let Some(subtype) = data.subtype else {
            return;
        };
        if subtype != KLIPPER_ERROR_SUBTYPE {
            return;
        }
        self.publisher.event(PrinterNotification {
            action: NOTIFICATION_SHOW.to_string(),
            message: subtype,
            text: data.payload.unwrap_or_default(),
            choices: Vec::new(),
        });
    }

    fn apply_layer_progress(&mut self, data: &LayerProgressData) {
        if let Some(fan_speed) = data.fanspeed.as_deref().and_then(fan_speed_from_plugin) {
            self.printer.fan_speed = fan_speed;
        }
        self.job.z_height = ZHeight::Layers {
            current: layer_from_plugin(data.current_layer.as_deref()),
            total: i64::from(layer_from_plugin(data.total_layer.as_deref())),
        };
        self.publish_status();
        self.publish_job();
    }

    fn apply_plugin_z_offset(&mut self, data: ZProbeOffsetData) {
        let Some(z_offset) = data.msg else {
            tracing::debug!("z-offset push without a numeric value");
            return;
        };
        let offset = ZOffset {
            printer_cap: self.z_offset.map(|o| o.printer_cap).unwrap_or_default(),
            z_offset,
        };
        self.set_z_offset(offset);
    }

    /// Result of the one-shot z-offset read at connection start.
    pub fn apply_fetched_z_offset(&mut self, offset: ZOffset) {
        self.set_z_offset(offset);
    }

    fn set_z_offset(&mut self, offset: ZOffset) {
        self.z_offset = Some(offset);
        self.publisher.z_offset(offset);
    }

    /// Result of the post-handshake connection check. A backend that is up
    /// but detached from the printer reads as closed.
    pub fn apply_connection_state(&mut self, state: &str) {
        match PrinterState::from_state_text(state) {
            PrinterState::Closed | PrinterState::Error => {
                tracing::info!(state, "backend reports printer detached");
                self.publisher.event(PrinterEvent::Closed);
            }
            _ => tracing::debug!(state, "backend connection state"),
        }
    }

    /// The socket is gone; consumers see CLOSED.
    pub fn socket_closed(&mut self) {
        self.publisher.event(PrinterEvent::Closed);
    }

    fn publish_status(&self) {
        self.publisher.printer_status(&self.printer);
    }

    fn publish_job(&self) {
        self.publisher.job_status(&self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channels;
    use crate::model::{EventUpdate, PrinterCapabilities};

    fn session(layer_progress: bool) -> (Session, Channels) {
        let channels = Channels::new();
        let options = SessionOptions {
            layer_progress,
            ..SessionOptions::default()
        };
        (Session::new(options, channels.publisher()), channels)
    }

    const FAN_SNAPSHOT: &str =
        r#"{"current":{"state":{"text":"Operational"},"logs":["Send: N11111 M106 S25*88"]}}"#;

    #[tokio::test]
    async fn fan_speed_sequence_replays_default_then_update() {
        let (mut session, channels) = session(false);
        let mut sub = channels.printer_status.subscribe();
        assert_eq!(sub.recv().await.map(|s| s.fan_speed), Some(0));

        session.handle_text(FAN_SNAPSHOT);
        assert_eq!(sub.recv().await.map(|s| s.fan_speed), Some(10));

        session.handle_text(r#"{"current":{"state":{"text":"Operational"},"logs":[]}}"#);
        assert_eq!(sub.recv().await.map(|s| s.fan_speed), Some(10));
    }

    #[test]
    fn printing_snapshot_synthesizes_one_event() {
        let (mut session, channels) = session(false);
        let mut events = channels.events.subscribe();
        let printing = r#"{"current":{"state":{"text":"printing"}}}"#;

        session.handle_text(printing);
        session.handle_text(printing);

        assert_eq!(
            events.try_recv(),
            Some(EventUpdate::Lifecycle(PrinterEvent::Printing))
        );
        assert_eq!(events.try_recv(), None);
        assert_eq!(session.last_state(), PrinterEvent::Printing);
    }

    #[test]
    fn paused_snapshot_synthesizes_paused() {
        let (mut session, channels) = session(false);
        session.handle_text(r#"{"current":{"state":{"text":"Paused"}}}"#);
        assert_eq!(
            channels.events.latest(),
            Some(EventUpdate::Lifecycle(PrinterEvent::Paused))
        );
    }

    #[test]
    fn explicit_event_blocks_later_synthesis() {
        let (mut session, channels) = session(false);
        session.handle_text(r#"{"event":{"type":"PrintDone","payload":{}}}"#);
        let mut events = channels.events.subscribe();
        assert_eq!(
            events.try_recv(),
            Some(EventUpdate::Lifecycle(PrinterEvent::Idle))
        );

        session.handle_text(r#"{"current":{"state":{"text":"Printing"}}}"#);
        assert_eq!(events.try_recv(), None);
        assert_eq!(session.printer().status, PrinterState::Printing);
    }

    #[test]
    fn unknown_event_publishes_nothing() {
        let (mut session, channels) = session(false);
        session.handle_text(r#"{"event":{"type":"ZChange","payload":{}}}"#);
        assert_eq!(channels.events.latest(), None);
        assert_eq!(session.last_state(), PrinterEvent::Unknown);
    }

    #[test]
    fn klipper_errors_become_notifications() {
        let (mut session, channels) = session(false);
        session.handle_text(
            r#"{"plugin":{"plugin":"klipper","data":{"subtype":"info","payload":"ready"}}}"#,
        );
        assert_eq!(channels.events.latest(), None);

        session.handle_text(
            r#"{"plugin":{"plugin":"klipper","data":{"subtype":"error","payload":"MCU shutdown"}}}"#,
        );
        assert_eq!(
            channels.events.latest(),
            Some(EventUpdate::Notification(PrinterNotification {
                action: "show".to_string(),
                message: "error".to_string(),
                text: "MCU shutdown".to_string(),
                choices: Vec::new(),
            }))
        );
    }

    const LAYER_PUSH: &str = r#"{"plugin":{"plugin":"DisplayLayerProgress-websocket-payload","data":{"fanspeed":"45%","currentLayer":"12","totalLayer":"-"}}}"#;

    #[test]
    fn layer_progress_ignored_without_flag() {
        let (mut session, _channels) = session(false);
        session.handle_text(LAYER_PUSH);
        assert_eq!(session.printer().fan_speed, 0);
        assert_eq!(session.job().z_height, ZHeight::Height(0.0));
    }

    #[test]
    fn layer_progress_updates_both_records() {
        let (mut session, channels) = session(true);
        session.handle_text(LAYER_PUSH);
        assert_eq!(channels.printer_status.latest().map(|s| s.fan_speed), Some(45));
        assert_eq!(
            channels.job_status.latest().map(|j| j.z_height),
            Some(ZHeight::Layers {
                current: 12,
                total: 0
            })
        );

        // Snapshots no longer write z-height in this mode.
        session.handle_text(r#"{"current":{"currentZ":7.5}}"#);
        assert_eq!(
            session.job().z_height,
            ZHeight::Layers {
                current: 12,
                total: 0
            }
        );
    }

    #[test]
    fn plugin_z_offset_keeps_capabilities() {
        let (mut session, channels) = session(false);
        let caps = PrinterCapabilities {
            eeprom: Some(true),
            z_probe: Some(false),
        };
        session.apply_fetched_z_offset(ZOffset {
            printer_cap: caps,
            z_offset: -0.8,
        });
        session.handle_text(r#"{"plugin":{"plugin":"z_probe_offset_universal","data":{"msg":"-1.1"}}}"#);
        assert_eq!(
            channels.z_offset.latest(),
            Some(ZOffset {
                printer_cap: caps,
                z_offset: -1.1
            })
        );
    }

    #[test]
    fn detached_backend_reads_as_closed() {
        let (mut session, channels) = session(false);
        session.apply_connection_state("Operational");
        assert_eq!(channels.events.latest(), None);
        session.apply_connection_state("Closed");
        assert_eq!(
            channels.events.latest(),
            Some(EventUpdate::Lifecycle(PrinterEvent::Closed))
        );
        assert_eq!(session.last_state(), PrinterEvent::Unknown);
    }

    #[test]
    fn control_messages_return_directives() {
        let (mut session, _channels) = session(false);
        assert_eq!(
            session.handle_text(r#"{"reauth":{}}"#),
            Some(Directive::Reauthenticate)
        );
        assert_eq!(
            session.handle_text(r#"{"connected":{"version":"1.9"}}"#),
            Some(Directive::HandshakeAcknowledged)
        );
        assert_eq!(session.handle_text("garbage"), None);
    }

    #[test]
    fn new_file_resets_job_record() {
        let (mut session, _channels) = session(false);
        session.handle_text(
            r#"{"current":{"job":{"file":{"display":"a.gcode"}},"progress":{"completion":50}}}"#,
        );
        assert_eq!(session.job().progress, 50);
        session.handle_text(r#"{"current":{"job":{"file":{"display":"b.gcode"}}}}"#);
        assert_eq!(session.job().progress, 0);
        assert_eq!(session.job().file.as_deref(), Some("b"));
    }

    #[test]
    fn deselected_file_resets_job_record() {
        let (mut session, channels) = session(false);
        session.handle_text(
            r#"{"current":{"job":{"file":{"display":"benchy.gcode","origin":"local","path":"benchy.gcode"}},"progress":{"completion":100}}}"#,
        );
        assert_eq!(session.job().file.as_deref(), Some("benchy"));
        assert_eq!(session.job().progress, 100);

        session.handle_text(
            r#"{"current":{"job":{"file":{"display":null,"origin":null,"path":null}},"progress":{"completion":null,"printTime":null,"printTimeLeft":null}}}"#,
        );
        assert_eq!(session.job(), &JobStatus::initial(false));
        assert_eq!(channels.job_status.latest(), Some(JobStatus::initial(false)));
    }

    #[test]
    fn snapshot_without_job_keeps_job_record() {
        let (mut session, _channels) = session(false);
        session.handle_text(
            r#"{"current":{"job":{"file":{"display":"benchy.gcode"}},"progress":{"completion":30}}}"#,
        );
        session.handle_text(r#"{"current":{"state":{"text":"Printing"}}}"#);
        assert_eq!(session.job().file.as_deref(), Some("benchy"));
        assert_eq!(session.job().progress, 30);
    }

    #[test]
    fn reset_republishes_initial_records() {
        let (mut session, channels) = session(false);
        session.handle_text(FAN_SNAPSHOT);
        session.handle_text(r#"{"current":{"state":{"text":"printing"}}}"#);
        session.reset();
        assert_eq!(channels.printer_status.latest(), Some(PrinterStatus::default()));
        assert_eq!(session.last_state(), PrinterEvent::Unknown);
    }
}
