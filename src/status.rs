//! Limit-switch status decoding.
//!
//! The controller reports a 5-bit status value per axis:
//!
//! | bit | meaning |
//! |-----|---------|
//! | 0 | CW hard limit |
//! | 1 | CCW hard limit |
//! | 2 | CW soft limit |
//! | 3 | CCW soft limit |
//! | 4 | home position |

use serde::Serialize;

/// Decoded limit flags for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LimitFlags {
    /// Clockwise hard limit switch engaged.
    pub cw_hard: bool,
    /// Counter-clockwise hard limit switch engaged.
    pub ccw_hard: bool,
    /// Clockwise soft limit reached.
    pub cw_soft: bool,
    /// Counter-clockwise soft limit reached.
    pub ccw_soft: bool,
    /// Axis sits on its home position.
    pub home: bool,
}

impl LimitFlags {
    /// All flags off.
    pub const CLEAR: LimitFlags = LimitFlags {
        cw_hard: false,
        ccw_hard: false,
        cw_soft: false,
        ccw_soft: false,
        home: false,
    };

    /// Largest status value the controller may report.
    pub const MAX_BITS: u32 = 31;

    /// Decode a status value. Returns `None` outside 0..=31.
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits > Self::MAX_BITS {
            return None;
        }
        Some(Self {
            cw_hard: bits & 0b00001 != 0,
            ccw_hard: bits & 0b00010 != 0,
            cw_soft: bits & 0b00100 != 0,
            ccw_soft: bits & 0b01000 != 0,
            home: bits & 0b10000 != 0,
        })
    }

    /// Re-encode to the 5-bit wire value.
    pub fn bits(&self) -> u8 {
        u8::from(self.cw_hard)
            | u8::from(self.ccw_hard) << 1
            | u8::from(self.cw_soft) << 2
            | u8::from(self.ccw_soft) << 3
            | u8::from(self.home) << 4
    }

    /// True when any hard or soft limit is engaged.
    pub fn any_limit(&self) -> bool {
        self.cw_hard || self.ccw_hard || self.cw_soft || self.ccw_soft
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_bit() {
        let flags = LimitFlags::from_bits(0b00001).unwrap();
        assert!(flags.cw_hard && !flags.ccw_hard && !flags.home);

        let flags = LimitFlags::from_bits(0b10100).unwrap();
        assert!(flags.cw_soft);
        assert!(flags.home);
        assert!(!flags.ccw_soft);
        assert!(flags.any_limit());

        let flags = LimitFlags::from_bits(0b10000).unwrap();
        assert!(!flags.any_limit());
    }

    #[test]
    fn rejects_values_above_five_bits() {
        assert!(LimitFlags::from_bits(31).is_some());
        assert!(LimitFlags::from_bits(32).is_none());
        assert!(LimitFlags::from_bits(255).is_none());
    }

    #[test]
    fn bits_reencode_what_was_decoded() {
        for value in [0u32, 1, 5, 10, 21, 31] {
            assert_eq!(u32::from(LimitFlags::from_bits(value).unwrap().bits()), value);
        }
        assert_eq!(LimitFlags::CLEAR.bits(), 0);
    }
}
