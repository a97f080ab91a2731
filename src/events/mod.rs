use crate::model::{PrinterEvent, PrinterState};

pub const PRINT_STARTED: &str = "PrintStarted";
pub const PRINT_PAUSED: &str = "PrintPaused";

/// Lifecycle event for a protocol event name; `None` for names we do not track.
pub fn classify(event_type: &str) -> Option<PrinterEvent> {
    match event_type {
        "PrintStarted" | "PrintResumed" => Some(PrinterEvent::Printing),
        "PrintPaused" => Some(PrinterEvent::Paused),
        "PrintFailed" | "PrintDone" | "PrintCancelled" => Some(PrinterEvent::Idle),
        "Connected" => Some(PrinterEvent::Connected),
        "Disconnected" | "Error" => Some(PrinterEvent::Closed),
        _ => None,
    }
}

/// Remembers the last lifecycle event of one connection.
#[derive(Debug, Clone, Default)]
pub struct EventClassifier {
    last_state: PrinterEvent,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> PrinterEvent {
        self.last_state
    }

    /// Records a recognized event and returns it for publishing.
    pub fn observe(&mut self, event_type: &str) -> Option<PrinterEvent> {
        let event = classify(event_type)?;
        self.last_state = event;
        Some(event)
    }

    /// A snapshot may report printing or paused before any event arrived.
    /// Until one is known, turn that into the missing transition, once.
    pub fn synthesize_from_status(&mut self, status: PrinterState) -> Option<PrinterEvent> {
        if self.last_state != PrinterEvent::Unknown {
            return None;
        }
        match status {
            PrinterState::Printing => self.observe(PRINT_STARTED),
            PrinterState::Paused => self.observe(PRINT_PAUSED),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.last_state = PrinterEvent::Unknown;
    }
}
