//! In-process stand-in for a bus full of display units.
//!
//! Each unit answers requests the way the firmware does, so the registry
//! and the command server can run without hardware attached.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, trace};

use crate::frame::{Frame, FrameCodec, SliceSource, WireVariant, REPLY_ADDRESS};
use crate::protocol::{
    EepromConfig, Opcode, StatusFlags, StatusReport, INVALID_COMMAND, PING_REPLY,
};
use crate::symbols::FLAP_COUNT;
use crate::transport::Transport;

/// ADC reading for a 12 V supply.
const NOMINAL_VOLTAGE_RAW: u16 = 223;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedUnit {
    pub eeprom: EepromConfig,
    pub flap: u8,
    pub powered: bool,
    pub online: bool,
    /// Fault bits reported on top of the power state.
    pub faults: StatusFlags,
    pub voltage_raw: u16,
    pub rotations: u32,
    pub resets: u32,
}

impl SimulatedUnit {
    pub fn new(address: u16) -> Self {
        Self {
            eeprom: EepromConfig {
                address,
                calibration: 0,
            },
            flap: 0,
            powered: true,
            online: true,
            faults: StatusFlags::default(),
            voltage_raw: NOMINAL_VOLTAGE_RAW,
            rotations: 0,
            resets: 0,
        }
    }

    pub fn address(&self) -> u16 {
        self.eeprom.address
    }

    fn status(&self) -> StatusReport {
        let flags = StatusFlags {
            power_down: !self.powered,
            ..self.faults
        };
        StatusReport {
            raw: flags.to_byte(),
            voltage_raw: self.voltage_raw,
            rotations: self.rotations,
        }
    }

    fn move_to(&mut self, target: u8, full_rotation: bool) {
        let target = target % FLAP_COUNT as u8;
        if full_rotation || target < self.flap {
            self.rotations = self.rotations.wrapping_add(1);
        }
        self.flap = target;
    }

    /// Applies one request and returns the reply payload, if any.
    fn execute(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let (&code, args) = payload.split_first()?;
        let Some(opcode) = Opcode::from_u8(code) else {
            return Some(vec![INVALID_COMMAND]);
        };

        match opcode {
            Opcode::SetFlap | Opcode::SetFlapFullRotation => {
                if let Some(&target) = args.first() {
                    self.move_to(target, opcode == Opcode::SetFlapFullRotation);
                }
                None
            }
            Opcode::MotorPowerOff => {
                self.powered = false;
                None
            }
            Opcode::MotorPowerOn => {
                self.powered = true;
                None
            }
            Opcode::Reset => {
                self.resets += 1;
                self.flap = 0;
                None
            }
            Opcode::ReadEeprom => Some(self.eeprom.to_reply().to_vec()),
            Opcode::WriteEeprom => {
                let bytes: [u8; 4] = args.try_into().ok()?;
                let written = EepromConfig::from_bytes(bytes);
                let reply = written.to_reply().to_vec();
                // the unit keeps listening on the old address until the reply is out
                self.eeprom = written;
                Some(reply)
            }
            Opcode::GetStatus => Some(self.status().to_reply().to_vec()),
            Opcode::Ping => Some(vec![PING_REPLY]),
        }
    }
}

pub struct SimulatedBus {
    codec: FrameCodec,
    units: Vec<SimulatedUnit>,
    rx: VecDeque<u8>,
    requests: Vec<Frame>,
    echo: bool,
}

impl SimulatedBus {
    pub fn new(variant: WireVariant) -> Self {
        Self {
            codec: FrameCodec::new(variant),
            units: Vec::new(),
            rx: VecDeque::new(),
            requests: Vec::new(),
            echo: false,
        }
    }

    /// A bus with one healthy unit per address.
    pub fn with_units<I: IntoIterator<Item = u16>>(variant: WireVariant, addresses: I) -> Self {
        let mut bus = Self::new(variant);
        for address in addresses {
            bus.add_unit(SimulatedUnit::new(address));
        }
        bus
    }

    /// Loops every transmitted byte back into the receive buffer, like
    /// adapters without echo suppression.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn add_unit(&mut self, unit: SimulatedUnit) {
        self.units.push(unit);
    }

    pub fn units(&self) -> &[SimulatedUnit] {
        &self.units
    }

    pub fn unit(&self, address: u16) -> Option<&SimulatedUnit> {
        self.units.iter().find(|u| u.address() == address)
    }

    pub fn unit_mut(&mut self, address: u16) -> Option<&mut SimulatedUnit> {
        self.units.iter_mut().find(|u| u.address() == address)
    }

    pub fn set_online(&mut self, address: u16, online: bool) -> bool {
        self.unit_mut(address).map(|u| u.online = online).is_some()
    }

    pub fn set_faults(&mut self, address: u16, faults: StatusFlags) -> bool {
        self.unit_mut(address).map(|u| u.faults = faults).is_some()
    }

    /// Every well-formed request seen on the line, in order.
    pub fn requests(&self) -> &[Frame] {
        &self.requests
    }

    fn handle(&mut self, frame: &Frame) {
        let mut replies = Vec::new();
        for unit in self
            .units
            .iter_mut()
            .filter(|u| u.online && u.address() == frame.address)
        {
            if let Some(reply) = unit.execute(&frame.payload) {
                replies.push(reply);
            }
        }

        for reply in replies {
            match self.codec.encode(REPLY_ADDRESS, &reply) {
                Ok(bytes) => self.rx.extend(bytes),
                Err(e) => debug!("sim: cannot encode reply: {}", e),
            }
        }
    }
}

impl Transport for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.echo {
            self.rx.extend(bytes.iter().copied());
        }
        // units on a different wire generation ignore the frame
        match self.codec.decode_any(&mut SliceSource::new(bytes)) {
            Ok(frame) => {
                trace!("sim: request for 0x{:04X}", frame.address);
                self.handle(&frame);
                self.requests.push(frame);
            }
            Err(e) => debug!("sim: dropped request: {}", e),
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BusClient;
    use crate::config::BusConfig;

    fn client(bus: SimulatedBus) -> BusClient<SimulatedBus> {
        BusClient::new(bus, &BusConfig::default())
    }

    fn client_v2(bus: SimulatedBus) -> BusClient<SimulatedBus> {
        let config = BusConfig {
            wire: WireVariant::V2,
            ..BusConfig::default()
        };
        BusClient::new(bus, &config)
    }

    #[test]
    fn test_unit_answers_ping_and_status() {
        let mut bus = client(SimulatedBus::with_units(WireVariant::V1, [10]));
        bus.ping(10).unwrap();
        let status = bus.read_status(10).unwrap();
        assert!(!status.flags().power_down);
        assert!((status.voltage() - 11.978).abs() < 0.01);
    }

    #[test]
    fn test_offline_unit_is_unreachable() {
        let mut sim = SimulatedBus::with_units(WireVariant::V1, [10]);
        assert!(sim.set_online(10, false));
        let mut bus = client(sim);
        assert!(bus.ping(10).is_err());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut sim = SimulatedBus::with_units(WireVariant::V1, [10]);
        let unit = sim.unit_mut(10).unwrap();
        assert_eq!(unit.execute(&[0x42]), Some(vec![INVALID_COMMAND]));
    }

    #[test]
    fn test_address_change_after_write_back() {
        let mut bus = client(SimulatedBus::with_units(WireVariant::V1, [10]));
        let written = bus.set_address(10, 20).unwrap();
        assert_eq!(written.address, 20);
        assert!(bus.transport().unit(10).is_none());
        bus.ping(20).unwrap();
    }

    #[test]
    fn test_motor_power_reflected_in_status() {
        let mut bus = client_v2(SimulatedBus::with_units(WireVariant::V2, [3]));
        bus.motor_power(3, false).unwrap();
        assert!(bus.read_status(3).unwrap().flags().power_down);
        bus.motor_power(3, true).unwrap();
        assert!(!bus.read_status(3).unwrap().flags().power_down);
    }

    #[test]
    fn test_flap_moves_count_rotations() {
        let mut bus = client(SimulatedBus::with_units(WireVariant::V1, [3]));
        bus.set_flap(3, 10, false).unwrap();
        bus.set_flap(3, 4, false).unwrap();
        bus.set_flap(3, 4, true).unwrap();
        let unit = bus.transport().unit(3).unwrap();
        assert_eq!(unit.flap, 4);
        assert_eq!(unit.rotations, 2);
    }

    #[test]
    fn test_echo_is_skipped_by_client() {
        let sim = SimulatedBus::with_units(WireVariant::V1, [10]).with_echo(true);
        let mut bus = client(sim);
        bus.ping(10).unwrap();
    }

    #[test]
    fn test_variant_mismatch_goes_unanswered() {
        let sim = SimulatedBus::with_units(WireVariant::V1, [10]);
        let config = BusConfig {
            wire: WireVariant::V2,
            ..BusConfig::default()
        };
        let mut bus = BusClient::new(sim, &config);
        assert!(bus.ping(10).is_err());
        assert!(bus.transport().requests().is_empty());
    }
}
