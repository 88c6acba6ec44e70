use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ModemError;

/// Number of S-register slots.
pub const REGISTER_COUNT: usize = 256;

pub const AUTO_ANSWER: u8 = 0;
pub const RING_COUNT: u8 = 1;
pub const ESC_CH: u8 = 2;
pub const CR_CH: u8 = 3;
pub const LF_CH: u8 = 4;
pub const BS_CH: u8 = 5;
pub const BLIND_DIAL_WAIT_S: u8 = 6;
pub const CARRIER_WAIT_S: u8 = 7;
pub const COMMA_PAUSE_S: u8 = 8;
pub const CARRIER_DETECT_RESP_100MS: u8 = 9;
pub const CARRIER_LOSS_HANGUP_100MS: u8 = 10;
pub const DTMF_MS: u8 = 11;
pub const ESC_GUARD_20MS: u8 = 12;
pub const DTR_DETECT_10MS: u8 = 25;
pub const RTS_TO_CTS_10MS: u8 = 26;
pub const INACTIVITY_TIMER_10S: u8 = 30;

/// Factory defaults for the registers that are not zero at power-on.
const FACTORY_DEFAULTS: &[(u8, u8)] = &[
    (ESC_CH, b'+'),
    (CR_CH, b'\r'),
    (LF_CH, b'\n'),
    (BS_CH, 8),
    (BLIND_DIAL_WAIT_S, 2),
    (CARRIER_WAIT_S, 50),
    (COMMA_PAUSE_S, 2),
    (CARRIER_DETECT_RESP_100MS, 6),
    (CARRIER_LOSS_HANGUP_100MS, 14),
    (DTMF_MS, 95),
    (ESC_GUARD_20MS, 50),
    (DTR_DETECT_10MS, 5),
    (RTS_TO_CTS_10MS, 1),
];

/// Human readable name of a register, used by `AT&V` and the state dump.
pub fn register_name(index: u8) -> Option<&'static str> {
    Some(match index {
        AUTO_ANSWER => "AUTO_ANSWER",
        RING_COUNT => "RING_COUNT",
        ESC_CH => "ESC_CH",
        CR_CH => "CR_CH",
        LF_CH => "LF_CH",
        BS_CH => "BS_CH",
        BLIND_DIAL_WAIT_S => "BLIND_DIAL_WAIT_S",
        CARRIER_WAIT_S => "CARRIER_WAIT_S",
        COMMA_PAUSE_S => "COMMA_PAUSE_S",
        CARRIER_DETECT_RESP_100MS => "CARRIER_DETECT_RESP_100MS",
        CARRIER_LOSS_HANGUP_100MS => "CARRIER_LOSS_HANGUP_100MS",
        DTMF_MS => "DTMF_MS",
        ESC_GUARD_20MS => "ESC_GUARD_20MS",
        DTR_DETECT_10MS => "DTR_DETECT_10MS",
        RTS_TO_CTS_10MS => "RTS_TO_CTS_10MS",
        INACTIVITY_TIMER_10S => "INACTIVITY_TIMER_10S",
        _ => return None,
    })
}

/// The S-register file.
///
/// Every slot is a byte, so reads never fail. Writes take the raw numeric
/// argument from the command line and reject anything outside 0..=255
/// without touching the register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    values: [u8; REGISTER_COUNT],
    /// Register selected by a bare `ATSn`, reported by `ATS?`.
    current: u8,
}

impl Default for Registers {
    fn default() -> Self {
        let mut regs = Self {
            values: [0; REGISTER_COUNT],
            current: 0,
        };
        regs.reset();
        regs
    }
}

impl Registers {
    /// Restore factory defaults.
    pub fn reset(&mut self) {
        self.values = [0; REGISTER_COUNT];
        for &(index, value) in FACTORY_DEFAULTS {
            self.values[index as usize] = value;
        }
        self.current = 0;
    }

    pub fn read(&self, index: u8) -> u8 {
        self.values[index as usize]
    }

    pub fn write(&mut self, index: u8, value: u32) -> Result<(), ModemError> {
        let value = u8::try_from(value).map_err(|_| ModemError::Unsupported {
            reason: format!("S{index}={value} is out of range"),
        })?;
        self.values[index as usize] = value;
        Ok(())
    }

    /// Store a value that is already known to fit, e.g. the ring counter.
    pub fn set(&mut self, index: u8, value: u8) {
        self.values[index as usize] = value;
    }

    pub fn increment(&mut self, index: u8) -> u8 {
        let slot = &mut self.values[index as usize];
        *slot = slot.saturating_add(1);
        *slot
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn select(&mut self, index: u8) {
        self.current = index;
    }

    /// Copy the values of another register file, keeping the selection.
    pub fn load_values(&mut self, other: &Registers) {
        self.values = other.values;
    }

    pub fn same_values(&self, other: &Registers) -> bool {
        self.values == other.values
    }

    /// Non-zero registers, in index order.
    pub fn non_zero(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| (i as u8, *v))
    }
}

/// On-disk form: a map of every non-zero register. Missing keys load as zero.
impl Serialize for Registers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<u8, u8> = self.non_zero().collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Registers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<u8, u8>::deserialize(deserializer)?;
        let mut values = [0u8; REGISTER_COUNT];
        for (index, value) in map {
            values[index as usize] = value;
        }
        Ok(Self { values, current: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_defaults() {
        let regs = Registers::default();
        assert_eq!(regs.read(ESC_CH), b'+');
        assert_eq!(regs.read(CR_CH), 13);
        assert_eq!(regs.read(LF_CH), 10);
        assert_eq!(regs.read(BS_CH), 8);
        assert_eq!(regs.read(CARRIER_WAIT_S), 50);
        assert_eq!(regs.read(ESC_GUARD_20MS), 50);
        assert_eq!(regs.read(AUTO_ANSWER), 0);
        assert_eq!(regs.read(INACTIVITY_TIMER_10S), 0);
    }

    #[test]
    fn out_of_range_write_is_rejected_without_mutation() {
        let mut regs = Registers::default();
        regs.write(AUTO_ANSWER, 3).unwrap();
        assert!(regs.write(AUTO_ANSWER, 999).is_err());
        assert_eq!(regs.read(AUTO_ANSWER), 3);
        assert!(regs.write(AUTO_ANSWER, 255).is_ok());
        assert_eq!(regs.read(AUTO_ANSWER), 255);
    }

    #[test]
    fn json_keeps_zeroed_defaults_zero() {
        let mut regs = Registers::default();
        regs.set(ESC_CH, 0);
        regs.set(AUTO_ANSWER, 2);
        let json = serde_json::to_string(&regs).unwrap();
        let back: Registers = serde_json::from_str(&json).unwrap();
        assert!(back.same_values(&regs));
        assert_eq!(back.read(ESC_CH), 0);
    }

    #[test]
    fn ring_counter_saturates() {
        let mut regs = Registers::default();
        regs.set(RING_COUNT, 254);
        assert_eq!(regs.increment(RING_COUNT), 255);
        assert_eq!(regs.increment(RING_COUNT), 255);
    }
}
