//! SFBUS command set as seen from the bus master.
//!
//! Opcode values, reply sentinels and the status register layout are fixed
//! by the unit firmware and must not change.

use serde::{Deserialize, Serialize};

pub const ACK: u8 = 0xAA;
pub const INVALID_COMMAND: u8 = 0xEE;
pub const PING_REPLY: u8 = 0xFF;

/// Status byte reported for a unit that could not be read.
pub const STATUS_UNREACHABLE: u8 = 0xFF;

pub const EEPROM_REPLY_LEN: usize = 6;
pub const STATUS_REPLY_LEN: usize = 7;

const ADC_STEPS: f64 = 1024.0;
const VOLTAGE_FULL_SCALE: f64 = 55.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    SetFlap = 0x10,
    SetFlapFullRotation = 0x11,
    MotorPowerOff = 0x20,
    MotorPowerOn = 0x21,
    Reset = 0x30,
    ReadEeprom = 0xF0,
    WriteEeprom = 0xF1,
    GetStatus = 0xF8,
    Ping = 0xFE,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Opcode::SetFlap),
            0x11 => Some(Opcode::SetFlapFullRotation),
            0x20 => Some(Opcode::MotorPowerOff),
            0x21 => Some(Opcode::MotorPowerOn),
            0x30 => Some(Opcode::Reset),
            0xF0 => Some(Opcode::ReadEeprom),
            0xF1 => Some(Opcode::WriteEeprom),
            0xF8 => Some(Opcode::GetStatus),
            0xFE => Some(Opcode::Ping),
            _ => None,
        }
    }

    /// Whether the unit answers this opcode with a reply frame.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            Opcode::ReadEeprom | Opcode::WriteEeprom | Opcode::GetStatus | Opcode::Ping
        )
    }
}

/// Decoded status register. Bit 7 is unused by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFlags {
    pub error_too_big: bool,
    pub no_home: bool,
    pub fuse_blown: bool,
    pub home_sense: bool,
    pub power_down: bool,
    pub fail_safe: bool,
    pub busy: bool,
}

impl StatusFlags {
    pub fn from_byte(raw: u8) -> Self {
        let bit = |n: u8| (raw >> n) & 0x01 == 1;
        Self {
            error_too_big: bit(0),
            no_home: bit(1),
            fuse_blown: bit(2),
            home_sense: bit(3),
            power_down: bit(4),
            fail_safe: bit(5),
            busy: bit(6),
        }
    }

    pub fn to_byte(self) -> u8 {
        u8::from(self.error_too_big)
            | u8::from(self.no_home) << 1
            | u8::from(self.fuse_blown) << 2
            | u8::from(self.home_sense) << 3
            | u8::from(self.power_down) << 4
            | u8::from(self.fail_safe) << 5
            | u8::from(self.busy) << 6
    }
}

/// The four configuration bytes held in unit EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EepromConfig {
    pub address: u16,
    pub calibration: u16,
}

impl EepromConfig {
    pub fn to_bytes(self) -> [u8; 4] {
        let [addr_lo, addr_hi] = self.address.to_le_bytes();
        let [cal_lo, cal_hi] = self.calibration.to_le_bytes();
        [addr_lo, addr_hi, cal_lo, cal_hi]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            address: u16::from_le_bytes([bytes[0], bytes[1]]),
            calibration: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Parses a ReadEEPROM/WriteEEPROM reply: `ACK, config[4], ACK`.
    pub fn from_reply(payload: &[u8]) -> Option<Self> {
        match payload {
            [ACK, a, b, c, d, ACK] => Some(Self::from_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    pub fn to_reply(self) -> [u8; EEPROM_REPLY_LEN] {
        let [a, b, c, d] = self.to_bytes();
        [ACK, a, b, c, d, ACK]
    }
}

/// Reply to GetStatus. Voltage and counter are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub raw: u8,
    pub voltage_raw: u16,
    pub rotations: u32,
}

impl StatusReport {
    pub fn from_reply(payload: &[u8]) -> Option<Self> {
        match payload {
            [raw, v_hi, v_lo, c3, c2, c1, c0] => Some(Self {
                raw: *raw,
                voltage_raw: u16::from_be_bytes([*v_hi, *v_lo]),
                rotations: u32::from_be_bytes([*c3, *c2, *c1, *c0]),
            }),
            _ => None,
        }
    }

    pub fn to_reply(self) -> [u8; STATUS_REPLY_LEN] {
        let [v_hi, v_lo] = self.voltage_raw.to_be_bytes();
        let [c3, c2, c1, c0] = self.rotations.to_be_bytes();
        [self.raw, v_hi, v_lo, c3, c2, c1, c0]
    }

    /// Driver supply voltage in volts.
    pub fn voltage(&self) -> f64 {
        f64::from(self.voltage_raw) / ADC_STEPS * VOLTAGE_FULL_SCALE
    }

    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_byte(self.raw)
    }

    pub fn is_unreachable(&self) -> bool {
        self.raw == STATUS_UNREACHABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_flags_bit_layout() {
        let flags = StatusFlags::from_byte(0b0110_0101);
        assert!(flags.error_too_big);
        assert!(!flags.no_home);
        assert!(flags.fuse_blown);
        assert!(!flags.home_sense);
        assert!(!flags.power_down);
        assert!(flags.fail_safe);
        assert!(flags.busy);
    }

    #[test]
    fn test_status_flags_to_byte_ignores_bit7() {
        assert_eq!(StatusFlags::from_byte(0xFF).to_byte(), 0x7F);
        assert_eq!(StatusFlags::from_byte(0b0010_0101).to_byte(), 0b0010_0101);
    }

    #[test]
    fn test_eeprom_reply_requires_both_acks() {
        let reply = [ACK, 0x0A, 0x00, 0x34, 0x12, ACK];
        assert_eq!(
            EepromConfig::from_reply(&reply),
            Some(EepromConfig { address: 10, calibration: 0x1234 })
        );
        assert_eq!(EepromConfig::from_reply(&[ACK, 0x0A, 0x00, 0x34, 0x12, 0xFF]), None);
        assert_eq!(EepromConfig::from_reply(&[ACK, 0x0A, 0x00, 0x34, 0x12]), None);
    }

    #[test]
    fn test_status_report_big_endian_fields() {
        let report = StatusReport::from_reply(&[0x10, 0x01, 0x00, 0x00, 0x00, 0x01, 0x02]).unwrap();
        assert_eq!(report.voltage_raw, 256);
        assert_eq!(report.rotations, 258);
        assert!((report.voltage() - 13.75).abs() < 1e-9);
        assert!(report.flags().power_down);
        assert_eq!(report.to_reply(), [0x10, 0x01, 0x00, 0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_opcode_table() {
        assert_eq!(Opcode::SetFlap.code(), 0x10);
        assert_eq!(Opcode::Ping.code(), 0xFE);
        assert_eq!(Opcode::from_u8(0xF8), Some(Opcode::GetStatus));
        assert_eq!(Opcode::from_u8(0x42), None);
        assert!(!Opcode::Reset.expects_reply());
        assert!(Opcode::WriteEeprom.expects_reply());
    }
}
