//! Request/response transactions against individual units.

use arrayvec::ArrayVec;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::BusConfig;
use crate::frame::{Decoded, FrameCodec, FrameError, Payload, REPLY_ADDRESS};
use crate::protocol::{EepromConfig, Opcode, StatusReport, INVALID_COMMAND, PING_REPLY};
use crate::transport::{Transport, TransportSource};

/// Highest address a unit may be given. `0xFFFF` is the reply address.
pub const MAX_UNIT_ADDRESS: u16 = 0xFFFE;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unit 0x{address:04X} did not answer after {attempts} attempts")]
    Unreachable { address: u16, attempts: u8 },
    #[error("unit 0x{address:04X} sent an invalid {opcode:?} reply: {detail}")]
    InvalidReply {
        address: u16,
        opcode: Opcode,
        detail: String,
    },
    #[error("unit 0x{address:04X} rejected {opcode:?}")]
    Rejected { address: u16, opcode: Opcode },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Bus master for one shared line.
///
/// Every exchange runs to completion before the next one starts; callers
/// that share a client must serialize access themselves.
pub struct BusClient<T> {
    transport: T,
    codec: FrameCodec,
    retry_count: u8,
}

impl<T: Transport> BusClient<T> {
    pub fn new(transport: T, config: &BusConfig) -> Self {
        Self {
            transport,
            codec: config.codec(),
            retry_count: config.retry_count.max(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn ping(&mut self, address: u16) -> Result<(), BusError> {
        let reply = self.request(address, Opcode::Ping, &[])?;
        if reply.as_slice() == [PING_REPLY] {
            Ok(())
        } else {
            Err(invalid_reply(address, Opcode::Ping, &reply))
        }
    }

    pub fn read_eeprom(&mut self, address: u16) -> Result<EepromConfig, BusError> {
        let reply = self.request(address, Opcode::ReadEeprom, &[])?;
        EepromConfig::from_reply(&reply)
            .ok_or_else(|| invalid_reply(address, Opcode::ReadEeprom, &reply))
    }

    /// Writes the configuration block and returns the unit's read-back.
    pub fn write_eeprom(
        &mut self,
        address: u16,
        config: EepromConfig,
    ) -> Result<EepromConfig, BusError> {
        let reply = self.request(address, Opcode::WriteEeprom, &config.to_bytes())?;
        EepromConfig::from_reply(&reply)
            .ok_or_else(|| invalid_reply(address, Opcode::WriteEeprom, &reply))
    }

    pub fn read_status(&mut self, address: u16) -> Result<StatusReport, BusError> {
        let reply = self.request(address, Opcode::GetStatus, &[])?;
        StatusReport::from_reply(&reply)
            .ok_or_else(|| invalid_reply(address, Opcode::GetStatus, &reply))
    }

    pub fn read_calibration(&mut self, address: u16) -> Result<u16, BusError> {
        self.read_eeprom(address).map(|config| config.calibration)
    }

    /// Moves a unit to `new_address`, keeping its calibration.
    pub fn set_address(&mut self, address: u16, new_address: u16) -> Result<EepromConfig, BusError> {
        if new_address == 0 || new_address > MAX_UNIT_ADDRESS {
            return Err(BusError::InvalidArgument(format!(
                "new address {new_address} outside 1..={MAX_UNIT_ADDRESS}"
            )));
        }
        let mut config = self.read_eeprom(address)?;
        config.address = new_address;
        let written = self.write_eeprom(address, config)?;
        if written != config {
            warn!(
                "⚠️ Unit 0x{:04X} read back {:?} after address change",
                address, written
            );
        }
        Ok(written)
    }

    pub fn set_calibration(
        &mut self,
        address: u16,
        calibration: u16,
    ) -> Result<EepromConfig, BusError> {
        let mut config = self.read_eeprom(address)?;
        config.calibration = calibration;
        self.write_eeprom(address, config)
    }

    pub fn set_flap(&mut self, address: u16, flap: u8, full_rotation: bool) -> Result<(), BusError> {
        let opcode = if full_rotation {
            Opcode::SetFlapFullRotation
        } else {
            Opcode::SetFlap
        };
        self.request(address, opcode, &[flap]).map(drop)
    }

    pub fn motor_power(&mut self, address: u16, on: bool) -> Result<(), BusError> {
        let opcode = if on {
            Opcode::MotorPowerOn
        } else {
            Opcode::MotorPowerOff
        };
        self.request(address, opcode, &[]).map(drop)
    }

    pub fn reset(&mut self, address: u16) -> Result<(), BusError> {
        self.request(address, Opcode::Reset, &[]).map(drop)
    }

    fn send(&mut self, address: u16, opcode: Opcode, args: &[u8]) -> Result<(), BusError> {
        let mut payload: ArrayVec<u8, 8> = ArrayVec::new();
        payload.push(opcode.code());
        payload
            .try_extend_from_slice(args)
            .map_err(|_| BusError::InvalidArgument(format!("{} argument bytes", args.len())))?;

        let frame = self.codec.encode(address, &payload).map_err(|e| match e {
            FrameError::PayloadTooLarge { .. } => BusError::InvalidArgument(e.to_string()),
            _ => BusError::Unreachable { address, attempts: 0 },
        })?;

        if let Err(e) = self.transport.discard_input() {
            warn!("⚠️ Could not flush receive buffer: {}", e);
        }

        debug!("Tx (0x{:04X}): {}", address, hex::encode_upper(&payload));
        trace!("Tx frame: {}", hex::encode_upper(&frame));
        self.transport.write_all(&frame).map_err(|e| {
            warn!("⚠️ Write to 0x{:04X} failed: {}", address, e);
            BusError::Unreachable { address, attempts: 0 }
        })
    }

    /// Sends a command and, for opcodes that are answered, waits for the
    /// reply addressed to the master. Fire-and-forget opcodes return an
    /// empty payload without touching the receive side.
    ///
    /// Each decode counts against the retry budget, including frames that
    /// turn out to be addressed elsewhere.
    fn request(&mut self, address: u16, opcode: Opcode, args: &[u8]) -> Result<Payload, BusError> {
        self.send(address, opcode, args)?;
        if !opcode.expects_reply() {
            return Ok(Payload::new());
        }

        for attempt in 1..=self.retry_count {
            let mut source = TransportSource::new(&mut self.transport);
            match self.codec.decode(&mut source, REPLY_ADDRESS) {
                Ok(Decoded::Frame(frame)) => {
                    debug!("Rx (0x{:04X}): {}", address, hex::encode_upper(&frame.payload));
                    if frame.payload.as_slice() == [INVALID_COMMAND] {
                        return Err(BusError::Rejected { address, opcode });
                    }
                    return Ok(frame.payload);
                }
                Ok(Decoded::NotForUs { address: other }) => {
                    trace!(
                        "attempt {}/{}: skipped frame for 0x{:04X}",
                        attempt,
                        self.retry_count,
                        other
                    );
                }
                Err(e) => {
                    warn!(
                        "🔁 attempt {}/{} for 0x{:04X}: {}",
                        attempt, self.retry_count, address, e
                    );
                }
            }
        }

        warn!("📡 Unit 0x{:04X} unreachable ({:?})", address, opcode);
        Err(BusError::Unreachable {
            address,
            attempts: self.retry_count,
        })
    }
}

fn invalid_reply(address: u16, opcode: Opcode, payload: &[u8]) -> BusError {
    BusError::InvalidReply {
        address,
        opcode,
        detail: format!("{} bytes: {}", payload.len(), hex::encode_upper(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WireVariant;
    use crate::protocol::ACK;
    use crate::transport::MemoryTransport;

    fn client() -> BusClient<MemoryTransport> {
        BusClient::new(MemoryTransport::new(), &BusConfig::default())
    }

    fn reply(payload: &[u8]) -> Vec<u8> {
        FrameCodec::new(WireVariant::V1)
            .encode(REPLY_ADDRESS, payload)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_ping_request_bytes() {
        let mut bus = client();
        bus.transport_mut().queue_reply(&reply(&[PING_REPLY]));
        bus.ping(10).unwrap();
        assert_eq!(
            bus.transport().written(),
            &[vec![b'+', 0x00, 0x04, 0x0A, 0x00, 0xFE, b'$']]
        );
    }

    #[test]
    fn test_silent_unit_uses_exact_retry_budget() {
        let mut bus = client();
        let err = bus.read_status(7).unwrap_err();
        assert!(matches!(
            err,
            BusError::Unreachable { address: 7, attempts: 2 }
        ));
        // two decode attempts, each giving up after three empty reads
        assert_eq!(bus.transport().read_calls(), 6);
    }

    #[test]
    fn test_foreign_frame_consumes_an_attempt() {
        let mut bus = client();
        let mut line = FrameCodec::new(WireVariant::V1)
            .encode(0x0042, &[0xF8])
            .unwrap()
            .to_vec();
        line.extend(reply(&[PING_REPLY]));
        bus.transport_mut().queue_reply(&line);
        assert!(bus.ping(0x42).is_ok());
    }

    #[test]
    fn test_retry_budget_exhausted_by_foreign_frames() {
        let mut bus = client();
        let codec = FrameCodec::new(WireVariant::V1);
        let mut line = codec.encode(0x0042, &[0xF8]).unwrap().to_vec();
        line.extend(codec.encode(0x0042, &[0xF8]).unwrap());
        line.extend(reply(&[PING_REPLY]));
        bus.transport_mut().queue_reply(&line);
        assert!(matches!(bus.ping(0x42), Err(BusError::Unreachable { .. })));
    }

    #[test]
    fn test_rejected_command() {
        let mut bus = client();
        bus.transport_mut().queue_reply(&reply(&[INVALID_COMMAND]));
        assert!(matches!(
            bus.read_eeprom(3),
            Err(BusError::Rejected { address: 3, opcode: Opcode::ReadEeprom })
        ));
    }

    #[test]
    fn test_short_status_reply_is_invalid() {
        let mut bus = client();
        bus.transport_mut().queue_reply(&reply(&[0x00, 0x01]));
        assert!(matches!(
            bus.read_status(3),
            Err(BusError::InvalidReply { .. })
        ));
    }

    #[test]
    fn test_set_address_rewrites_eeprom() {
        let mut bus = client();
        bus.transport_mut()
            .queue_reply(&reply(&[ACK, 0x05, 0x00, 0x10, 0x00, ACK]));
        bus.transport_mut()
            .queue_reply(&reply(&[ACK, 0x09, 0x00, 0x10, 0x00, ACK]));

        let written = bus.set_address(5, 9).unwrap();
        assert_eq!(written, EepromConfig { address: 9, calibration: 16 });
        assert_eq!(
            bus.transport().written()[1],
            vec![b'+', 0x00, 0x08, 0x05, 0x00, 0xF1, 0x09, 0x00, 0x10, 0x00, b'$']
        );
    }

    #[test]
    fn test_set_address_rejects_reserved_targets() {
        let mut bus = client();
        assert!(matches!(bus.set_address(5, 0), Err(BusError::InvalidArgument(_))));
        assert!(matches!(
            bus.set_address(5, 0xFFFF),
            Err(BusError::InvalidArgument(_))
        ));
        assert!(bus.transport().written().is_empty());
    }

    #[test]
    fn test_fire_and_forget_commands_do_not_read() {
        let mut bus = client();
        bus.set_flap(4, 12, true).unwrap();
        bus.motor_power(4, false).unwrap();
        bus.reset(4).unwrap();
        assert_eq!(bus.transport().read_calls(), 0);
        let opcodes: Vec<u8> = bus.transport().written().iter().map(|f| f[5]).collect();
        assert_eq!(opcodes, vec![0x11, 0x20, 0x30]);
    }

    #[test]
    fn test_write_failure_reports_unreachable() {
        let mut bus = client();
        bus.transport_mut().set_fail_writes(true);
        assert!(matches!(
            bus.ping(1),
            Err(BusError::Unreachable { attempts: 0, .. })
        ));
    }
}
