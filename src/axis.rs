//! Axis definitions and per-axis runtime state.
//!
//! An [`AxisDefinition`] is produced by configuration loading (bss.config,
//! inline `[[axes]]` tables or group files) and never changes once built.
//! [`AxisState`] is owned by the polling engine and tracks what has been
//! learned from the controller: the unit the device actually reports in,
//! the last status bits and the decoded limit flags.

use crate::error::{AppResult, AxisError};
use crate::status::LimitFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position unit of an axis.
///
/// `Pulse` is the controller's native raw unit. Every other variant is a
/// physical unit that the controller can report and accept directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Raw controller pulses.
    #[default]
    Pulse,
    /// Millimetres.
    Mm,
    /// Degrees.
    Deg,
    /// Milliradians.
    Mrad,
    /// Angstrom-equivalent (wavelength axes).
    #[serde(alias = "angstroam")]
    Angstrom,
    /// Kilo-electron-volts (energy axes).
    Kev,
}

impl Unit {
    /// Physical units in the order the reply decoder probes for them.
    pub const PHYSICAL: [Unit; 5] = [Unit::Mm, Unit::Deg, Unit::Mrad, Unit::Angstrom, Unit::Kev];

    /// Wire token used in requests and replies.
    pub fn token(self) -> &'static str {
        match self {
            Unit::Pulse => "pulse",
            Unit::Mm => "mm",
            Unit::Deg => "deg",
            Unit::Mrad => "mrad",
            Unit::Angstrom => "angstrom",
            Unit::Kev => "kev",
        }
    }

    /// Tokens accepted on input for this unit, canonical spelling first.
    ///
    /// Older controller configurations spell angstrom as `angstroam`.
    pub fn accepted_tokens(self) -> &'static [&'static str] {
        match self {
            Unit::Angstrom => &["angstrom", "angstroam"],
            Unit::Pulse => &["pulse"],
            Unit::Mm => &["mm"],
            Unit::Deg => &["deg"],
            Unit::Mrad => &["mrad"],
            Unit::Kev => &["kev"],
        }
    }

    /// True for every unit except [`Unit::Pulse`].
    pub fn is_physical(self) -> bool {
        !matches!(self, Unit::Pulse)
    }

    /// True for angular units, which select the `/angle` position endpoint.
    pub fn is_angular(self) -> bool {
        matches!(self, Unit::Deg | Unit::Mrad)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Unit {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        [Unit::Pulse]
            .into_iter()
            .chain(Unit::PHYSICAL)
            .find(|unit| unit.accepted_tokens().contains(&token.as_str()))
            .ok_or_else(|| AxisError::Configuration(format!("unknown unit '{s}'")))
    }
}

/// Direction convention between raw pulses and the displayed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sense {
    /// Raw and displayed values share a sign.
    #[default]
    Positive,
    /// Displayed values are the negated raw values.
    Negative,
}

impl Sense {
    /// Normalises a configured sense. Anything other than `-1` becomes `+1`.
    pub fn from_config(value: i64) -> Self {
        if value == -1 {
            Sense::Negative
        } else {
            Sense::Positive
        }
    }

    /// Sign as a multiplier.
    pub fn factor(self) -> f64 {
        match self {
            Sense::Positive => 1.0,
            Sense::Negative => -1.0,
        }
    }
}

impl Serialize for Sense {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.factor() as i64)
    }
}

impl<'de> Deserialize<'de> for Sense {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(Sense::from_config(value))
    }
}

/// Immutable description of one controllable axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDefinition {
    /// Protocol identifier, unique per controller.
    pub name: String,
    /// Human-readable label.
    #[serde(default)]
    pub display: String,
    /// Raw pulses per physical unit. Always positive.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Sign convention.
    #[serde(default)]
    pub sense: Sense,
    /// Unit configured for this axis.
    #[serde(default)]
    pub unit: Unit,
}

fn default_scale() -> f64 {
    AxisDefinition::DEFAULT_SCALE
}

impl AxisDefinition {
    /// Scale applied to axes that are not described anywhere.
    pub const DEFAULT_SCALE: f64 = 1000.0;

    /// Build a validated definition.
    ///
    /// # Errors
    /// Returns [`AxisError::Configuration`] for an empty name or a scale that
    /// is not a positive finite number.
    pub fn new(
        name: impl Into<String>,
        display: impl Into<String>,
        scale: f64,
        sense: Sense,
        unit: Unit,
    ) -> AppResult<Self> {
        let definition = Self {
            name: name.into(),
            display: display.into(),
            scale,
            sense,
            unit,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Pulse axis with the default scale and positive sense.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display: name.clone(),
            name,
            scale: Self::DEFAULT_SCALE,
            sense: Sense::Positive,
            unit: Unit::Pulse,
        }
    }

    /// Check the invariants a definition must satisfy before the engine uses it.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AxisError::Configuration("axis name cannot be empty".into()));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(AxisError::Configuration(format!(
                "axis '{}' has invalid scale {} (must be > 0)",
                self.name, self.scale
            )));
        }
        Ok(())
    }

    /// Display label, falling back to the protocol name.
    pub fn label(&self) -> &str {
        if self.display.is_empty() {
            &self.name
        } else {
            &self.display
        }
    }
}

/// Mutable engine-side state for one axis.
///
/// Created lazily the first time an axis is polled or moved.
#[derive(Debug, Clone)]
pub struct AxisState {
    /// The axis this state belongs to.
    pub definition: AxisDefinition,
    /// Unit the controller reports in. Starts as the configured unit and is
    /// replaced once the device reports a physical unit.
    pub unit: Unit,
    /// Last raw status value (0-31).
    pub status_bits: u8,
    /// Decoded limit flags.
    pub limits: LimitFlags,
}

impl AxisState {
    /// Fresh state for a definition.
    pub fn new(definition: AxisDefinition) -> Self {
        Self {
            unit: definition.unit,
            definition,
            status_bits: 0,
            limits: LimitFlags::CLEAR,
        }
    }

    /// Record a unit learned from a reply. Pulse replies never overwrite a
    /// physical unit.
    pub fn learn_unit(&mut self, unit: Unit) -> bool {
        if unit.is_physical() && unit != self.unit {
            self.unit = unit;
            return true;
        }
        false
    }

    /// Apply a decoded status value.
    pub fn apply_status(&mut self, bits: u8, limits: LimitFlags) {
        self.status_bits = bits;
        self.limits = limits;
    }

    /// Zero the limit flags (status unavailable or disabled).
    pub fn clear_status(&mut self) {
        self.status_bits = 0;
        self.limits = LimitFlags::CLEAR;
    }
}
