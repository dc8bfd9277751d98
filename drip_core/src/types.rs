//! Plain data shared across the pipeline and its consumers.
use std::fmt;

use crate::bus::{Event, Payload};
use crate::flow::FlowData;
use crate::safety::SafetyEvent;
use crate::state::DeviceState;

/// One conversion from the load cell.
///
/// A reading with `valid == false` must never reach filter state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightReading {
    pub weight_g: f32,
    /// Device milliseconds; wraps after ~49.7 days.
    pub timestamp_ms: u32,
    pub valid: bool,
}

impl WeightReading {
    pub fn new(weight_g: f32, timestamp_ms: u32) -> Self {
        Self {
            weight_g,
            timestamp_ms,
            valid: weight_g.is_finite(),
        }
    }

    pub fn invalid(timestamp_ms: u32) -> Self {
        Self {
            weight_g: f32::NAN,
            timestamp_ms,
            valid: false,
        }
    }

    /// Valid flag set and a finite weight.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.valid && self.weight_g.is_finite()
    }
}

/// What the operator is alerted about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlarmKind {
    #[default]
    None,
    LowFluid,
    FreeFlow,
    FlowStall,
    AirDetect,
    SensorFail,
}

impl AlarmKind {
    pub const fn name(self) -> &'static str {
        match self {
            AlarmKind::None => "none",
            AlarmKind::LowFluid => "low_fluid",
            AlarmKind::FreeFlow => "free_flow",
            AlarmKind::FlowStall => "flow_stall",
            AlarmKind::AirDetect => "air_detect",
            AlarmKind::SensorFail => "sensor_fail",
        }
    }

    pub const fn buzzer_pattern(self) -> BuzzerPattern {
        match self {
            AlarmKind::None => BuzzerPattern::Off,
            AlarmKind::LowFluid => BuzzerPattern::Double,
            AlarmKind::FlowStall | AlarmKind::SensorFail => BuzzerPattern::Intermittent,
            AlarmKind::FreeFlow | AlarmKind::AirDetect => BuzzerPattern::Continuous,
        }
    }
}

impl From<SafetyEvent> for AlarmKind {
    fn from(e: SafetyEvent) -> Self {
        match e {
            SafetyEvent::None => AlarmKind::None,
            SafetyEvent::LowFluid => AlarmKind::LowFluid,
            SafetyEvent::FreeFlow => AlarmKind::FreeFlow,
            SafetyEvent::FlowStall => AlarmKind::FlowStall,
            SafetyEvent::AirDetect => AlarmKind::AirDetect,
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerPattern {
    /// Acknowledge a button press.
    Single,
    Double,
    Intermittent,
    Continuous,
    Off,
}

/// Button gesture carried on the `ButtonPress` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    Short,
    Long,
}

/// Snapshot a display or telemetry consumer builds from bus traffic.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceStatus {
    pub weight_g: Option<f32>,
    pub flow: Option<FlowData>,
    pub state: DeviceState,
    pub alarm: AlarmKind,
    pub wifi_connected: bool,
    pub uptime_s: u64,
}

impl DeviceStatus {
    /// Fold one bus event into the snapshot.
    pub fn apply(&mut self, event: &Event) {
        match event.payload {
            Payload::Weight(w) => self.weight_g = Some(w),
            Payload::Flow(f) => self.flow = Some(f),
            Payload::Alarm(a) => self.alarm = a,
            Payload::State(s) => self.state = s,
            Payload::Wifi(up) => self.wifi_connected = up,
            Payload::Button(_) => {}
        }
    }

    /// Minutes until empty, when a finite estimate exists.
    pub fn eta_min(&self) -> Option<f32> {
        self.flow
            .map(|f| f.time_to_empty_min)
            .filter(|t| t.is_finite())
    }
}
