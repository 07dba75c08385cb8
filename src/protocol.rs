//! Request encoding and reply decoding for the controller's text protocol.
//!
//! Every request is a single slash-delimited line:
//!
//! ```text
//! get/{object}_{axis}/query
//! get/{object}_{axis}/position | /aperture | /angle
//! get/{object}_{axis}/status
//! put/{object}_{axis}/{value}{unit}
//! put/{object}_{axis}/stop
//! ```
//!
//! Replies echo the request path and append fields. The fourth field carries
//! the payload; when that field is the bare return code `0`, the payload sits
//! in the third field instead.

use crate::axis::Unit;
use crate::conversion::{CommandValue, DeviceReading, MotionState};
use crate::error::{AppResult, AxisError};
use crate::status::LimitFlags;

/// Endpoint used to read a position when a query reply carried none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEndpoint {
    /// `/position`, the default.
    Position,
    /// `/aperture`, for slit width and height axes.
    Aperture,
    /// `/angle`, for angular axes.
    Angle,
}

impl PositionEndpoint {
    /// Pick the endpoint for an axis from its name and current unit.
    pub fn for_axis(name: &str, unit: Unit) -> Self {
        if unit.is_angular() || name.ends_with("angle") {
            PositionEndpoint::Angle
        } else if name.ends_with("width") || name.ends_with("height") {
            PositionEndpoint::Aperture
        } else {
            PositionEndpoint::Position
        }
    }

    /// Path segment.
    pub fn path(self) -> &'static str {
        match self {
            PositionEndpoint::Position => "position",
            PositionEndpoint::Aperture => "aperture",
            PositionEndpoint::Angle => "angle",
        }
    }
}

/// One request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// State and, usually, position.
    Query,
    /// Position only, from a specific endpoint.
    Position(PositionEndpoint),
    /// Limit-switch status bits.
    Status,
    /// Absolute move.
    Move(CommandValue),
    /// Stop motion.
    Stop,
}

impl Request {
    /// Encode without the trailing line feed.
    pub fn encode(&self, device_object: &str, axis: &str) -> String {
        let target = format!("{device_object}_{axis}");
        match self {
            Request::Query => format!("get/{target}/query"),
            Request::Position(endpoint) => format!("get/{target}/{}", endpoint.path()),
            Request::Status => format!("get/{target}/status"),
            Request::Move(value) => format!("put/{target}/{}", value.wire_value()),
            Request::Stop => format!("put/{target}/stop"),
        }
    }
}

/// Decoded reply to a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryReply {
    /// State and position in one reply.
    Reading {
        /// Motion state.
        state: MotionState,
        /// Reported position.
        reading: DeviceReading,
    },
    /// State only; a positional request must follow on the same connection.
    NeedsPosition {
        /// Motion state.
        state: MotionState,
    },
}

fn is_error_reply(response: &str) -> bool {
    response.is_empty() || response.to_ascii_lowercase().contains("error")
}

/// Payload field of a reply, and whether it was followed by a return code.
fn payload(response: &str) -> Option<(&str, bool)> {
    let fields: Vec<&str> = response.split('/').collect();
    match fields.get(3) {
        Some(&field) if field != "0" => Some((field, false)),
        Some(_) => fields.get(2).map(|&field| (field, true)),
        None => fields.get(2).map(|&field| (field, false)),
    }
}

/// Split `value{unit}` into its number and unit. No suffix yields `None`.
pub(crate) fn split_unit(text: &str) -> (&str, Option<Unit>) {
    for unit in Unit::PHYSICAL.into_iter().chain([Unit::Pulse]) {
        for token in unit.accepted_tokens() {
            if let Some(number) = text.strip_suffix(token) {
                return (number, Some(unit));
            }
        }
    }
    (text, None)
}

/// Decode a query reply.
pub fn parse_query(request: &str, response: &str) -> AppResult<QueryReply> {
    let response = response.trim();
    if is_error_reply(response) {
        return Err(AxisError::decode(request, response));
    }
    let Some((part, with_return_code)) = payload(response) else {
        return Err(AxisError::decode(request, response));
    };

    if let Some((state_token, value)) = part.split_once('_') {
        let (number, unit) = split_unit(value);
        let unit = unit.unwrap_or(Unit::Pulse);
        let reading = if unit.is_physical() {
            number.trim().parse::<f64>().ok().map(|v| DeviceReading::physical(v, unit))
        } else {
            number.trim().parse::<i64>().ok().map(|v| DeviceReading::pulses(v as f64))
        };
        return match reading {
            Some(reading) => Ok(QueryReply::Reading {
                state: MotionState::from_token(state_token),
                reading,
            }),
            None => Err(AxisError::decode(request, response)),
        };
    }

    // A bare physical value means the axis is at rest.
    if let (number, Some(unit)) = split_unit(part) {
        if unit.is_physical() {
            if let Ok(value) = number.trim().parse::<f64>() {
                return Ok(QueryReply::Reading {
                    state: MotionState::Inactive,
                    reading: DeviceReading::physical(value, unit),
                });
            }
        }
    }

    match (part.to_ascii_lowercase().as_str(), with_return_code) {
        ("ok", _) => Ok(QueryReply::NeedsPosition {
            state: MotionState::Inactive,
        }),
        ("active", true) => Ok(QueryReply::NeedsPosition {
            state: MotionState::Moving("active".to_string()),
        }),
        _ => Err(AxisError::decode(request, response)),
    }
}

/// Decode the reply to a positional fallback request.
///
/// A bare number is reported in `current_unit`.
pub fn parse_position(request: &str, response: &str, current_unit: Unit) -> AppResult<DeviceReading> {
    let response = response.trim();
    if is_error_reply(response) {
        return Err(AxisError::decode(request, response));
    }
    let (part, _) = payload(response).ok_or_else(|| AxisError::decode(request, response))?;
    let (number, unit) = split_unit(part);
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| AxisError::decode(request, response))?;
    Ok(DeviceReading {
        value,
        unit: unit.unwrap_or(current_unit),
    })
}

/// Decode a status reply into its raw value and limit flags.
pub fn parse_status(request: &str, response: &str) -> AppResult<(u8, LimitFlags)> {
    let response = response.trim();
    let field = response
        .split('/')
        .nth(3)
        .ok_or_else(|| AxisError::decode(request, response))?;
    let bits: u32 = field
        .trim()
        .parse()
        .map_err(|_| AxisError::decode(request, response))?;
    let flags = LimitFlags::from_bits(bits).ok_or_else(|| AxisError::StatusOutOfRange {
        request: request.to_string(),
        response: response.to_string(),
    })?;
    Ok((flags.bits(), flags))
}

/// True when a move or stop reply acknowledges the command.
pub fn is_acknowledged(response: &str) -> bool {
    let response = response.trim();
    !response.is_empty() && response.ends_with("/0")
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "get/bl_41in_x/query";

    #[test]
    fn encodes_every_request() {
        assert_eq!(Request::Query.encode("bl_41in", "x"), "get/bl_41in_x/query");
        assert_eq!(Request::Status.encode("bl_41in", "x"), "get/bl_41in_x/status");
        assert_eq!(Request::Stop.encode("bl_41in", "x"), "put/bl_41in_x/stop");
        assert_eq!(
            Request::Position(PositionEndpoint::Aperture).encode("bl_41in", "slit_width"),
            "get/bl_41in_slit_width/aperture"
        );
        assert_eq!(
            Request::Move(CommandValue::Pulses(1500)).encode("bl_41in", "x"),
            "put/bl_41in_x/1500pulse"
        );
        assert_eq!(
            Request::Move(CommandValue::Physical {
                value: 2.0,
                unit: Unit::Deg
            })
            .encode("bl_41in", "theta"),
            "put/bl_41in_theta/2.0deg"
        );
    }

    #[test]
    fn endpoint_selection() {
        assert_eq!(PositionEndpoint::for_axis("slit_width", Unit::Pulse), PositionEndpoint::Aperture);
        assert_eq!(PositionEndpoint::for_axis("slit_height", Unit::Mm), PositionEndpoint::Aperture);
        assert_eq!(PositionEndpoint::for_axis("mono_angle", Unit::Pulse), PositionEndpoint::Angle);
        assert_eq!(PositionEndpoint::for_axis("theta", Unit::Mrad), PositionEndpoint::Angle);
        assert_eq!(PositionEndpoint::for_axis("coll_x", Unit::Pulse), PositionEndpoint::Position);
    }

    #[test]
    fn combined_pulse_reply() {
        let reply = parse_query(Q, "get/bl_41in_x/query/inactive_500pulse").unwrap();
        assert_eq!(
            reply,
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::pulses(500.0)
            }
        );
    }

    #[test]
    fn payload_in_third_field_when_fourth_is_return_code() {
        let reply = parse_query(Q, "resp/x/inactive_500pulse/0").unwrap();
        assert_eq!(
            reply,
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::pulses(500.0)
            }
        );
        let reply = parse_query(Q, "ok/0/moving_12345pulse/0").unwrap();
        assert_eq!(
            reply,
            QueryReply::Reading {
                state: MotionState::Moving("moving".into()),
                reading: DeviceReading::pulses(12345.0)
            }
        );
    }

    #[test]
    fn physical_reply_normalises_ok() {
        let reply = parse_query(Q, "get/bl_41in_th/query/ok_1.000deg").unwrap();
        assert_eq!(
            reply,
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::physical(1.0, Unit::Deg)
            }
        );
        let reply = parse_query(Q, "get/bl_41in_z/query/moving_7.150mm").unwrap();
        assert!(matches!(
            reply,
            QueryReply::Reading { state: MotionState::Moving(_), reading } if reading.unit == Unit::Mm
        ));
        let reply = parse_query(Q, "get/bl_41in_w/query/inactive_1.5angstroam").unwrap();
        assert!(matches!(
            reply,
            QueryReply::Reading { reading, .. } if reading.unit == Unit::Angstrom
        ));
    }

    #[test]
    fn bare_physical_value_is_an_inactive_reading() {
        assert_eq!(
            parse_query(Q, "get/bl_41in_z/query/7.150mm").unwrap(),
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::physical(7.15, Unit::Mm)
            }
        );
        assert_eq!(
            parse_query(Q, "resp/x/-0.25kev/0").unwrap(),
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::physical(-0.25, Unit::Kev)
            }
        );
        // Bare pulses carry no state and stay undecodable.
        assert!(parse_query(Q, "get/bl_41in_z/query/500pulse").is_err());
        assert!(parse_query(Q, "get/bl_41in_z/query/abcmm").is_err());
    }

    #[test]
    fn state_tokens_ignore_case() {
        assert_eq!(
            parse_query(Q, "get/bl_41in_x/query/Inactive_500pulse").unwrap(),
            QueryReply::Reading {
                state: MotionState::Inactive,
                reading: DeviceReading::pulses(500.0)
            }
        );
        assert_eq!(
            parse_query(Q, "get/bl_41in_x/query/OK").unwrap(),
            QueryReply::NeedsPosition {
                state: MotionState::Inactive
            }
        );
    }

    #[test]
    fn deferred_position_replies() {
        assert_eq!(
            parse_query(Q, "get/bl_41in_x/query/ok").unwrap(),
            QueryReply::NeedsPosition {
                state: MotionState::Inactive
            }
        );
        assert_eq!(
            parse_query(Q, "get/bl_41in_x/ok/0").unwrap(),
            QueryReply::NeedsPosition {
                state: MotionState::Inactive
            }
        );
        assert_eq!(
            parse_query(Q, "get/bl_41in_x/active/0").unwrap(),
            QueryReply::NeedsPosition {
                state: MotionState::Moving("active".into())
            }
        );
    }

    #[test]
    fn malformed_replies_are_decode_failures() {
        for reply in [
            "",
            "   ",
            "get/bl_41in_x/query/Error",
            "get/bl_41in_x/query/inactive_abcpulse",
            "get/bl_41in_x/query/whatever",
            "garbage",
        ] {
            let err = parse_query(Q, reply).unwrap_err();
            assert!(err.is_communication_failure(), "reply {reply:?} gave {err}");
        }
    }

    #[test]
    fn position_replies() {
        let r = "get/bl_41in_x/position";
        assert_eq!(
            parse_position(r, "get/bl_41in_x/position/12.5mm", Unit::Pulse).unwrap(),
            DeviceReading::physical(12.5, Unit::Mm)
        );
        assert_eq!(
            parse_position(r, "get/bl_41in_x/position/300pulse", Unit::Mm).unwrap(),
            DeviceReading::pulses(300.0)
        );
        assert_eq!(
            parse_position(r, "get/bl_41in_x/position/4.25", Unit::Deg).unwrap(),
            DeviceReading::physical(4.25, Unit::Deg)
        );
        assert!(parse_position(r, "get/bl_41in_x/position/abc", Unit::Pulse).is_err());
        assert!(parse_position(r, "", Unit::Pulse).is_err());
    }

    #[test]
    fn status_replies() {
        let r = "get/bl_41in_x/status";
        let (bits, flags) = parse_status(r, "get/bl_41in_x/status/21").unwrap();
        assert_eq!(bits, 0b10101);
        assert!(flags.cw_hard && !flags.ccw_hard && flags.cw_soft && !flags.ccw_soft && flags.home);

        assert!(matches!(
            parse_status(r, "get/bl_41in_x/status/32"),
            Err(AxisError::StatusOutOfRange { .. })
        ));
        assert!(matches!(
            parse_status(r, "get/bl_41in_x/status/-1"),
            Err(AxisError::Decode { .. })
        ));
        assert!(parse_status(r, "get/bl_41in_x").is_err());
    }

    #[test]
    fn acknowledgement() {
        assert!(is_acknowledged("put/bl_41in_x/1500pulse/0"));
        assert!(is_acknowledged("put/bl_41in_x/stop/0\n"));
        assert!(!is_acknowledged("put/bl_41in_x/stop/1"));
        assert!(!is_acknowledged("put/bl_41in_x/stop/10"));
        assert!(!is_acknowledged(""));
    }
}
