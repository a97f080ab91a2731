//! Sparse patches derived from a `current` snapshot.
//!
//! A patch carries only what the snapshot actually contained; applying it
//! leaves every other field of the owned record as it was.

use crate::convert::{end_time_after, filament_length_to_weight, seconds_to_hours, FilamentProfile};
use crate::logs::fan_speed_from_logs;
use crate::model::{JobStatus, PrinterState, PrinterStatus, Temperature, TimeValue, ZHeight};
use crate::protocol::{CurrentPayload, FileInfo, HeaterReading};
use chrono::NaiveDateTime;

const FILE_SUFFIXES: [&str; 2] = [".gcode", ".ufp"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaterPatch {
    pub current: Option<i32>,
    pub set: Option<i32>,
}

impl HeaterPatch {
    fn from_reading(reading: &HeaterReading) -> Self {
        Self {
            current: reading.actual.map(round_temperature),
            set: reading.target.map(round_temperature),
        }
    }

    fn apply(&self, temperature: &mut Temperature) {
        if let Some(current) = self.current {
            temperature.current = current;
        }
        if let Some(set) = self.set {
            temperature.set = set;
        }
    }
}

fn round_temperature(value: f64) -> i32 {
    value.round() as i32
}

/// Printer-side fields present in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub status: Option<PrinterState>,
    pub bed: Option<HeaterPatch>,
    pub tool0: Option<HeaterPatch>,
    pub fan_speed: Option<u8>,
}

impl StatusPatch {
    pub fn from_current(current: &CurrentPayload) -> Self {
        let sample = current.first_temperature();
        Self {
            status: current.state_text().map(PrinterState::from_state_text),
            bed: sample
                .and_then(|s| s.bed.as_ref())
                .map(HeaterPatch::from_reading),
            tool0: sample
                .and_then(|s| s.tool0.as_ref())
                .map(HeaterPatch::from_reading),
            fan_speed: fan_speed_from_logs(current.logs.as_deref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, status: &mut PrinterStatus) {
        if let Some(state) = self.status {
            status.status = state;
        }
        if let Some(bed) = &self.bed {
            bed.apply(&mut status.bed);
        }
        if let Some(tool0) = &self.tool0 {
            tool0.apply(&mut status.tool0);
        }
        if let Some(fan_speed) = self.fan_speed {
            status.fan_speed = fan_speed;
        }
    }
}

/// Inputs a job patch needs besides the snapshot itself.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub layer_progress: bool,
    pub filament: FilamentProfile,
    /// Local wall clock used for the end-of-print estimate.
    pub now: NaiveDateTime,
}

/// Job-side fields present in one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    /// Outer `Some` when the snapshot carried a file descriptor; inner `None`
    /// when that descriptor names no file.
    pub file: Option<Option<String>>,
    pub full_path: Option<String>,
    pub progress: Option<u8>,
    pub time_printed: Option<TimeValue>,
    pub filament_amount: Option<f64>,
    pub time_left: Option<TimeValue>,
    pub estimated_end_time: Option<String>,
    pub estimated_print_time: Option<TimeValue>,
    pub z_height: Option<ZHeight>,
}

impl JobPatch {
    pub fn from_current(current: &CurrentPayload, ctx: &JobContext) -> Self {
        let file = current.file();
        let progress = current.progress.as_ref();
        let remaining = progress.and_then(|p| p.print_time_left);

        Self {
            file: file.map(display_name),
            full_path: file.and_then(full_path),
            progress: progress
                .and_then(|p| p.completion)
                .map(|completion| completion.round().clamp(0.0, 100.0) as u8),
            time_printed: progress
                .and_then(|p| p.print_time)
                .map(|seconds| TimeValue::hours(seconds_to_hours(seconds))),
            filament_amount: filament_weight(current, ctx.filament),
            time_left: remaining.map(|seconds| TimeValue::hours(seconds_to_hours(seconds))),
            estimated_end_time: remaining.map(|seconds| end_time_after(ctx.now, seconds)),
            estimated_print_time: current
                .job
                .as_ref()
                .and_then(|job| job.estimated_print_time)
                .map(|seconds| TimeValue::hours(seconds_to_hours(seconds))),
            // With layer progress on, the plugin owns z-height.
            z_height: if ctx.layer_progress {
                None
            } else {
                current.current_z.map(ZHeight::Height)
            },
        }
    }

    /// Whether applying this patch starts a new job record.
    pub fn changes_file(&self, job: &JobStatus) -> bool {
        match &self.file {
            Some(file) => job.file != *file,
            None => false,
        }
    }

    /// Applies the patch, resetting `job` first when the file changed.
    pub fn apply(self, job: &mut JobStatus, layer_progress: bool) {
        if self.changes_file(job) {
            *job = JobStatus::initial(layer_progress);
        }
        if let Some(file) = self.file {
            job.file = file;
        }
        if let Some(full_path) = self.full_path {
            job.full_path = Some(full_path);
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(time_printed) = self.time_printed {
            job.time_printed = Some(time_printed);
        }
        if let Some(amount) = self.filament_amount {
            job.filament_amount = amount;
        }
        if let Some(time_left) = self.time_left {
            job.time_left = time_left;
        }
        if let Some(end) = self.estimated_end_time {
            job.estimated_end_time = Some(end);
        }
        if let Some(estimate) = self.estimated_print_time {
            job.estimated_print_time = Some(estimate);
        }
        if let Some(z_height) = self.z_height {
            job.z_height = z_height;
        }
    }
}

fn display_name(file: &FileInfo) -> Option<String> {
    let display = file.display.as_deref()?;
    let name = FILE_SUFFIXES
        .iter()
        .fold(display, |name, suffix| name.strip_suffix(suffix).unwrap_or(name));
    Some(name.to_string())
}

fn full_path(file: &FileInfo) -> Option<String> {
    match (&file.origin, &file.path) {
        (Some(origin), Some(path)) => Some(format!("/{origin}/{path}")),
        _ => None,
    }
}

/// Sum over tools of the extruded length, as grams. `None` without length data.
fn filament_weight(current: &CurrentPayload, profile: FilamentProfile) -> Option<f64> {
    let tools = current.job.as_ref()?.filament.as_ref()?;
    let lengths: Vec<f64> = tools
        .values()
        .filter_map(|usage| usage.as_ref()?.length)
        .collect();
    if lengths.is_empty() {
        return None;
    }
    Some(filament_length_to_weight(lengths.iter().sum(), profile))
}
