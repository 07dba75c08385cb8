//! Unit and sense conversion.
//!
//! Pure arithmetic between what the controller reports or accepts and what a
//! user sees or types. Two frames are involved:
//!
//! - the **device frame**: the value exactly as the controller reports it,
//!   either raw pulses or a physical value in the axis's unit;
//! - the **display frame**: the device value with the axis's sense applied,
//!   shown either in pulses or in a physical unit depending on
//!   [`DisplayMode`].
//!
//! Pulse axes have their physical value derived through `scale`. Physical
//! axes report the physical value directly, and their pulse value is derived
//! for presentation only; moves on those axes are always sent back in the
//! physical unit.

use crate::axis::{AxisDefinition, Unit};
use crate::error::{AppResult, AxisError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Motion state reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MotionState {
    /// Axis at rest.
    Inactive,
    /// Axis moving. Carries the controller's state token verbatim.
    Moving(String),
    /// Axis could not be read.
    Error,
}

impl MotionState {
    /// Map a state token from a reply, ignoring case. `ok` is an alias for
    /// `inactive`.
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("inactive") || token.eq_ignore_ascii_case("ok") {
            MotionState::Inactive
        } else {
            MotionState::Moving(token.to_string())
        }
    }

    /// True for [`MotionState::Inactive`].
    pub fn is_inactive(&self) -> bool {
        matches!(self, MotionState::Inactive)
    }

    /// True for [`MotionState::Moving`].
    pub fn is_moving(&self) -> bool {
        matches!(self, MotionState::Moving(_))
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Inactive => f.write_str("inactive"),
            MotionState::Moving(token) => f.write_str(token),
            MotionState::Error => f.write_str("error"),
        }
    }
}

/// A position exactly as the controller reported it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceReading {
    /// Reported value.
    pub value: f64,
    /// Unit the value was reported in.
    pub unit: Unit,
}

impl DeviceReading {
    /// Reading in raw pulses.
    pub fn pulses(value: f64) -> Self {
        Self {
            value,
            unit: Unit::Pulse,
        }
    }

    /// Reading in a physical unit.
    pub fn physical(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }
}

/// Result of one polling round for one axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    /// Reported or inferred state.
    pub state: MotionState,
    /// Device-frame raw position in pulses (derived for physical axes).
    pub raw_position: f64,
    /// Display-frame physical position (sense applied).
    pub physical_position: f64,
    /// Set when the round failed to talk to the controller.
    pub communication_failed: bool,
}

impl PollOutcome {
    /// Outcome of a successful read.
    pub fn from_reading(definition: &AxisDefinition, state: MotionState, reading: DeviceReading) -> Self {
        let sense = definition.sense.factor();
        let (raw_position, physical_position) = if reading.unit.is_physical() {
            (reading.value * definition.scale, reading.value * sense)
        } else {
            (reading.value, raw_to_physical(definition, reading.value))
        };
        Self {
            state,
            raw_position,
            physical_position,
            communication_failed: false,
        }
    }

    /// Outcome of a round that could not reach or understand the controller.
    pub fn communication_failure() -> Self {
        Self {
            state: MotionState::Error,
            raw_position: 0.0,
            physical_position: 0.0,
            communication_failed: true,
        }
    }
}

/// Pulses to display-frame physical value for a pulse axis.
pub fn raw_to_physical(definition: &AxisDefinition, raw: f64) -> f64 {
    raw * definition.sense.factor() / definition.scale
}

/// Display-frame physical value back to pulses for a pulse axis.
pub fn physical_to_raw(definition: &AxisDefinition, physical: f64) -> f64 {
    physical * definition.scale * definition.sense.factor()
}

/// Which unit a caller reads and types values in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DisplayMode {
    /// Everything shown and entered in pulses.
    #[default]
    Pulse,
    /// Physical units: the axis's own unit, or mm for pulse axes.
    Physical,
}

impl FromStr for DisplayMode {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pulse" => Ok(DisplayMode::Pulse),
            "physical" | "mm" => Ok(DisplayMode::Physical),
            other => Err(AxisError::Configuration(format!(
                "unknown display mode '{other}' (expected pulse or physical)"
            ))),
        }
    }
}

/// Direction of a relative move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Add the delta.
    Plus,
    /// Subtract the delta.
    Minus,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Plus => 1.0,
            Direction::Minus => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plus" | "+" => Ok(Direction::Plus),
            "minus" | "-" => Ok(Direction::Minus),
            other => Err(AxisError::Configuration(format!(
                "unknown direction '{other}' (expected plus or minus)"
            ))),
        }
    }
}

/// Value carried by a move command, already in the device frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CommandValue {
    /// Integer pulse target.
    Pulses(i64),
    /// Physical target in the axis's unit.
    Physical {
        /// Target value.
        value: f64,
        /// Unit suffix sent with the value.
        unit: Unit,
    },
}

impl CommandValue {
    /// Equivalent device-frame raw position, used for move confirmation.
    pub fn raw_equivalent(&self, scale: f64) -> f64 {
        match *self {
            CommandValue::Pulses(pulses) => pulses as f64,
            CommandValue::Physical { value, .. } => value * scale,
        }
    }

    /// Wire rendering: integer pulses, or a decimal followed by the unit token.
    pub fn wire_value(&self) -> String {
        match *self {
            CommandValue::Pulses(pulses) => format!("{pulses}pulse"),
            CommandValue::Physical { value, unit } => format!("{}{}", format_decimal(value), unit),
        }
    }
}

/// A resolved move: what to send, and where the axis should end up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MoveTarget {
    /// Command value for the controller.
    pub command: CommandValue,
    /// Expected device-frame raw position after the move.
    pub expected_raw: f64,
}

impl MoveTarget {
    fn new(command: CommandValue, scale: f64) -> Self {
        Self {
            expected_raw: command.raw_equivalent(scale),
            command,
        }
    }
}

/// Resolve an absolute move.
///
/// `unit` is the unit the controller currently reports for the axis, which
/// may differ from the configured one once a physical unit was learned.
pub fn resolve_absolute(definition: &AxisDefinition, unit: Unit, value: f64, mode: DisplayMode) -> MoveTarget {
    let sense = definition.sense.factor();
    let scale = definition.scale;
    let command = match (mode, unit.is_physical()) {
        (DisplayMode::Pulse, true) => CommandValue::Physical {
            value: value / scale * sense,
            unit,
        },
        (DisplayMode::Pulse, false) => CommandValue::Pulses(round_pulses(value * sense)),
        (DisplayMode::Physical, true) => CommandValue::Physical {
            value: value * sense,
            unit,
        },
        (DisplayMode::Physical, false) => CommandValue::Pulses(round_pulses(value * scale * sense)),
    };
    MoveTarget::new(command, scale)
}

/// Resolve a relative move from the current device reading.
pub fn resolve_relative(
    definition: &AxisDefinition,
    unit: Unit,
    current: DeviceReading,
    delta: f64,
    mode: DisplayMode,
    direction: Direction,
) -> MoveTarget {
    let sense = definition.sense.factor();
    let scale = definition.scale;
    let sign = direction.sign();
    let command = if unit.is_physical() {
        let current = if current.unit.is_physical() {
            current.value
        } else {
            current.value / scale
        };
        let step = match mode {
            DisplayMode::Pulse => delta / scale,
            DisplayMode::Physical => delta,
        };
        CommandValue::Physical {
            value: current + sign * step * sense,
            unit,
        }
    } else {
        let current = if current.unit.is_physical() {
            current.value * scale
        } else {
            current.value
        };
        let step = match mode {
            DisplayMode::Pulse => round_pulses(delta * sense),
            DisplayMode::Physical => round_pulses(delta * scale * sense),
        };
        CommandValue::Pulses((current + sign * step as f64).trunc() as i64)
    };
    MoveTarget::new(command, scale)
}

/// Render an outcome the way the position column shows it.
pub fn format_position(definition: &AxisDefinition, unit: Unit, outcome: &PollOutcome, mode: DisplayMode) -> String {
    if outcome.communication_failed {
        return "ERROR".to_string();
    }
    let sense = definition.sense.factor();
    match (mode, unit.is_physical()) {
        (DisplayMode::Pulse, _) => format!("{} pulse", (outcome.raw_position * sense).trunc() as i64),
        (DisplayMode::Physical, true) => format!("{} {}", format_decimal(outcome.physical_position), unit),
        (DisplayMode::Physical, false) => format!("{:.3} mm", outcome.physical_position),
    }
}

/// Shortest decimal rendering that always carries a fractional part
/// (`2.0`, `1.25`, `-0.5`).
pub fn format_decimal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn round_pulses(value: f64) -> i64 {
    value.round_ties_even() as i64
}
