//! SFBUS frame codec.
//!
//! Both wire generations share a five byte header:
//!
//! ```text
//! v1: '+' | 0x00 | len | addrLo | addrHi | payload (len - 3) | '$'
//! v2: '+' | 0x01 | len | addrLo | addrHi | payload (len - 4) | crcLo | crcHi
//! ```
//!
//! The codec does no I/O of its own. Decoding pulls bytes from a
//! [`ByteSource`], which the bus client backs with the serial transport and
//! tests back with a plain slice.

use arrayvec::ArrayVec;
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const SOF_BYTE: u8 = b'+';
pub const EOF_BYTE: u8 = b'$';

/// Destination address used by every unit when replying to the bus master.
pub const REPLY_ADDRESS: u16 = 0xFFFF;

/// Largest payload a unit can buffer.
pub const MAX_PAYLOAD_LEN: usize = 64;

// start byte, version, length
const PREAMBLE_LEN: usize = 3;
const MAX_OVERHEAD: usize = 4;

pub const MAX_FRAME_LEN: usize = PREAMBLE_LEN + MAX_OVERHEAD + MAX_PAYLOAD_LEN;

pub const DEFAULT_SOF_SEARCH_LIMIT: usize = 3;

const_assert!(MAX_PAYLOAD_LEN + MAX_OVERHEAD <= u8::MAX as usize);

const SFBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub type Payload = ArrayVec<u8, MAX_PAYLOAD_LEN>;
pub type FrameBytes = ArrayVec<u8, MAX_FRAME_LEN>;

/// CRC16 with reflected polynomial 0xA001 and initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    SFBUS_CRC.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVariant {
    /// End-of-frame marker, no checksum.
    #[default]
    V1,
    /// CRC16 over the payload instead of an end marker.
    V2,
}

impl WireVariant {
    pub fn version(self) -> u8 {
        match self {
            WireVariant::V1 => 0,
            WireVariant::V2 => 1,
        }
    }

    /// Bytes counted by the length field in addition to the payload.
    pub fn overhead(self) -> usize {
        match self {
            WireVariant::V1 => 3,
            WireVariant::V2 => 4,
        }
    }

    fn trailer_len(self) -> usize {
        self.overhead() - 2
    }
}

impl core::fmt::Display for WireVariant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WireVariant::V1 => write!(f, "v1"),
            WireVariant::V2 => write!(f, "v2"),
        }
    }
}

impl core::str::FromStr for WireVariant {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" | "eof" => Ok(WireVariant::V1),
            "v2" | "2" | "crc" => Ok(WireVariant::V2),
            _ => Err(FrameError::UnknownVariant(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub address: u16,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A complete frame addressed to someone else. Its bytes were consumed.
    NotForUs { address: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityFault {
    #[error("expected end marker, found 0x{found:02X}")]
    EndMarker { found: u8 },
    #[error("crc mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Crc { computed: u16, received: u16 },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("no start marker within {attempts} bytes")]
    FramingTimeout { attempts: usize },
    #[error("integrity error: {0}")]
    Integrity(IntegrityFault),
    #[error("frame truncated after {received} bytes")]
    Truncated { received: usize },
    #[error("length field {length} out of range")]
    BadLength { length: u8 },
    #[error("protocol version {found}, bus expects {expected}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("payload of {len} bytes exceeds {max}", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },
    #[error("unknown wire variant '{0}'")]
    UnknownVariant(String),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull-based byte stream the decoder reads from.
pub trait ByteSource {
    /// Next byte, or `None` if nothing arrived within the byte timeout.
    fn next_byte(&mut self) -> std::io::Result<Option<u8>>;
}

/// Byte source over an in-memory buffer. Reports a timeout once exhausted.
#[derive(Debug)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        let byte = self.bytes.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        Ok(byte)
    }
}

struct Header {
    address: u16,
    payload_len: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    variant: WireVariant,
    sof_search_limit: usize,
}

impl FrameCodec {
    pub fn new(variant: WireVariant) -> Self {
        Self {
            variant,
            sof_search_limit: DEFAULT_SOF_SEARCH_LIMIT,
        }
    }

    pub fn with_sof_search_limit(mut self, limit: usize) -> Self {
        self.sof_search_limit = limit.max(1);
        self
    }

    pub fn variant(&self) -> WireVariant {
        self.variant
    }

    pub fn encode(&self, address: u16, payload: &[u8]) -> Result<FrameBytes, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { len: payload.len() });
        }

        let [addr_lo, addr_hi] = address.to_le_bytes();
        let mut out = FrameBytes::new();
        out.push(SOF_BYTE);
        out.push(self.variant.version());
        out.push((payload.len() + self.variant.overhead()) as u8);
        out.push(addr_lo);
        out.push(addr_hi);
        out.try_extend_from_slice(payload)
            .map_err(|_| FrameError::PayloadTooLarge { len: payload.len() })?;

        match self.variant {
            WireVariant::V1 => out.push(EOF_BYTE),
            WireVariant::V2 => {
                let [crc_lo, crc_hi] = crc16(payload).to_le_bytes();
                out.push(crc_lo);
                out.push(crc_hi);
            }
        }

        Ok(out)
    }

    /// Reads one frame and checks it against `listen`.
    ///
    /// Frames for other addresses are consumed up to their last byte and
    /// reported as [`Decoded::NotForUs`] without an integrity check.
    pub fn decode<S: ByteSource + ?Sized>(
        &self,
        src: &mut S,
        listen: u16,
    ) -> Result<Decoded, FrameError> {
        let header = self.read_header(src)?;
        if header.address != listen {
            self.skip_body(src, &header)?;
            return Ok(Decoded::NotForUs {
                address: header.address,
            });
        }
        self.read_body(src, &header).map(Decoded::Frame)
    }

    /// Reads one frame regardless of its destination.
    pub fn decode_any<S: ByteSource + ?Sized>(&self, src: &mut S) -> Result<Frame, FrameError> {
        let header = self.read_header(src)?;
        self.read_body(src, &header)
    }

    fn read_header<S: ByteSource + ?Sized>(&self, src: &mut S) -> Result<Header, FrameError> {
        let mut found = false;
        for _ in 0..self.sof_search_limit {
            if src.next_byte()? == Some(SOF_BYTE) {
                found = true;
                break;
            }
        }
        if !found {
            return Err(FrameError::FramingTimeout {
                attempts: self.sof_search_limit,
            });
        }

        let version = expect_byte(src, 1)?;
        if version != self.variant.version() {
            return Err(FrameError::VersionMismatch {
                expected: self.variant.version(),
                found: version,
            });
        }

        let length = expect_byte(src, 2)?;
        let addr_lo = expect_byte(src, 3)?;
        let addr_hi = expect_byte(src, 4)?;

        let payload_len = (length as usize)
            .checked_sub(self.variant.overhead())
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or(FrameError::BadLength { length })?;

        Ok(Header {
            address: u16::from_le_bytes([addr_lo, addr_hi]),
            payload_len,
        })
    }

    fn read_body<S: ByteSource + ?Sized>(
        &self,
        src: &mut S,
        header: &Header,
    ) -> Result<Frame, FrameError> {
        let mut payload = Payload::new();
        for i in 0..header.payload_len {
            payload.push(expect_byte(src, PREAMBLE_LEN + 2 + i)?);
        }

        let received = PREAMBLE_LEN + 2 + header.payload_len;
        match self.variant {
            WireVariant::V1 => {
                let marker = expect_byte(src, received)?;
                if marker != EOF_BYTE {
                    return Err(FrameError::Integrity(IntegrityFault::EndMarker {
                        found: marker,
                    }));
                }
            }
            WireVariant::V2 => {
                let lo = expect_byte(src, received)?;
                let hi = expect_byte(src, received + 1)?;
                let received_crc = u16::from_le_bytes([lo, hi]);
                let computed = crc16(&payload);
                if received_crc != computed {
                    return Err(FrameError::Integrity(IntegrityFault::Crc {
                        computed,
                        received: received_crc,
                    }));
                }
            }
        }

        Ok(Frame {
            version: self.variant.version(),
            address: header.address,
            payload,
        })
    }

    fn skip_body<S: ByteSource + ?Sized>(
        &self,
        src: &mut S,
        header: &Header,
    ) -> Result<(), FrameError> {
        let body_len = header.payload_len + self.variant.trailer_len();
        for i in 0..body_len {
            expect_byte(src, PREAMBLE_LEN + 2 + i)?;
        }
        Ok(())
    }
}

fn expect_byte<S: ByteSource + ?Sized>(src: &mut S, received: usize) -> Result<u8, FrameError> {
    src.next_byte()?.ok_or(FrameError::Truncated { received })
}
