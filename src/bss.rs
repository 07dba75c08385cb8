//! Beamline `bss.config` reader.
//!
//! Only two things are taken from the file: the controller's network
//! settings and the axis blocks.
//!
//! ```text
//! Ms_IP:      10.178.215.3
//! Ms_Port:    10101
//! BL_Object:  41in
//!
//! _axis_begin
//!   _axis_name:     st2_coll_1_x
//!   _axis_comment:  Collimator X, stage 2
//!   _val2pulse:     1000
//!   _sense:         -1
//!   _cunit:         mm
//! _axis_end
//! ```
//!
//! Everything else in the file is ignored.

use crate::axis::{AxisDefinition, Sense, Unit};
use crate::error::AppResult;
use std::path::Path;
use tracing::{info, warn};

/// Network settings found in the file. Absent keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    /// `Ms_IP`
    pub host: Option<String>,
    /// `Ms_Port`
    pub port: Option<u16>,
    /// `BL_Object`, already prefixed with `bl_`
    pub device_object: Option<String>,
}

/// Parsed bss.config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BssConfig {
    /// Controller network settings
    pub network: NetworkSettings,
    /// Axis catalog in file order
    pub axes: Vec<AxisDefinition>,
}

impl BssConfig {
    /// Definition for an axis name.
    pub fn axis(&self, name: &str) -> Option<&AxisDefinition> {
        self.axes.iter().find(|axis| axis.name == name)
    }
}

fn value_of<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

#[derive(Default)]
struct AxisBlock {
    name: Option<String>,
    comment: String,
    scale: i64,
    sense: Sense,
    unit: Unit,
}

impl AxisBlock {
    fn new() -> Self {
        Self {
            scale: 1000,
            ..Self::default()
        }
    }

    fn apply(&mut self, line: &str) {
        if let Some(name) = value_of(line, "_axis_name") {
            self.name = Some(name.to_string());
        } else if let Some(comment) = value_of(line, "_axis_comment") {
            self.comment = comment.to_string();
        } else if let Some(scale) = value_of(line, "_val2pulse") {
            if let Ok(scale) = scale.parse() {
                self.scale = scale;
            }
        } else if let Some(sense) = value_of(line, "_sense") {
            if let Ok(sense) = sense.parse() {
                self.sense = Sense::from_config(sense);
            }
        } else if let Some(unit) = value_of(line, "_cunit") {
            if let Ok(unit) = unit.parse() {
                self.unit = unit;
            }
        }
    }

    fn finish(self) -> AppResult<Option<AxisDefinition>> {
        let Some(name) = self.name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let display = match self.comment.split(',').next().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => name.clone(),
        };
        AxisDefinition::new(name, display, self.scale as f64, self.sense, self.unit).map(Some)
    }
}

/// Parse the contents of a bss.config.
///
/// Blocks without a name are skipped. A block with a non-positive
/// `_val2pulse` is skipped with a warning.
pub fn parse_bss_config(text: &str) -> AppResult<BssConfig> {
    let mut config = BssConfig::default();
    let mut block: Option<AxisBlock> = None;

    for line in text.lines().map(str::trim) {
        if line.starts_with("_axis_begin") {
            block = Some(AxisBlock::new());
            continue;
        }
        if line.starts_with("_axis_end") {
            if let Some(done) = block.take() {
                match done.finish() {
                    Ok(Some(axis)) => config.axes.push(axis),
                    Ok(None) => {}
                    Err(err) => warn!(target: "axis_tool::config", error = %err, "skipping axis block"),
                }
            }
            continue;
        }
        if let Some(current) = block.as_mut() {
            current.apply(line);
            continue;
        }

        if let Some(host) = value_of(line, "Ms_IP") {
            config.network.host = Some(host.to_string());
        } else if let Some(port) = value_of(line, "Ms_Port") {
            match port.parse() {
                Ok(port) => config.network.port = Some(port),
                Err(_) => warn!(target: "axis_tool::config", value = port, "ignoring unparseable Ms_Port"),
            }
        } else if let Some(object) = value_of(line, "BL_Object") {
            config.network.device_object = Some(format!("bl_{object}"));
        }
    }

    Ok(config)
}

/// Read and parse a bss.config. A missing file yields `None`.
pub fn load_bss_config(path: &Path) -> AppResult<Option<BssConfig>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(target: "axis_tool::config", path = %path.display(), "bss.config not found, using defaults");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let config = parse_bss_config(&text)?;
    info!(
        target: "axis_tool::config",
        path = %path.display(),
        axes = config.axes.len(),
        host = ?config.network.host,
        port = ?config.network.port,
        device_object = ?config.network.device_object,
        "loaded bss.config"
    );
    Ok(Some(config))
}
