//! Byte transports the bus client talks through.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::ByteSource;

pub const DEFAULT_BAUD: u32 = 19_200;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot open serial device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial device error: {0}")]
    Io(#[from] io::Error),
}

/// Half-duplex byte link to the bus.
///
/// `read` blocks for at most one byte timeout and returns `Ok(0)` when
/// nothing arrived in that window.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drops anything already sitting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Switches an external RS-485 driver between transmit and receive.
    fn set_transmit(&mut self, _enabled: bool) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }

    fn set_transmit(&mut self, enabled: bool) -> io::Result<()> {
        (**self).set_transmit(enabled)
    }
}

/// Adapts a transport into the decoder's one-byte-at-a-time view.
pub struct TransportSource<'a, T: ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> TransportSource<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }
}

impl<T: Transport + ?Sized> ByteSource for TransportSource<'_, T> {
    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.transport.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }
}

/// RS-485 adapter on a serial port, 8N1 without flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    direction_control: bool,
}

impl SerialTransport {
    pub fn open(
        path: &str,
        baud: u32,
        byte_timeout: Duration,
        direction_control: bool,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(byte_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })?;

        let mut transport = Self {
            port,
            direction_control,
        };
        transport.port.clear(ClearBuffer::All).map_err(io::Error::from)?;
        if direction_control {
            transport.set_transmit(false)?;
        }

        info!("🔌 Opened {} at {} baud", path, baud);
        Ok(transport)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.direction_control {
            self.set_transmit(true)?;
        }
        let result = Write::write_all(&mut self.port, bytes).and_then(|()| self.port.flush());
        if self.direction_control {
            self.set_transmit(false)?;
        }
        result
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    // DTR low drives the transceiver, DTR high listens.
    fn set_transmit(&mut self, enabled: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(!enabled)
            .map_err(io::Error::from)
    }
}

/// Scripted transport for tests.
///
/// Replies queued with [`MemoryTransport::queue_reply`] become readable one
/// per write, so they survive the input flush before each request.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    read_calls: usize,
    fail_writes: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes bytes readable immediately.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Makes bytes readable after the next write.
    pub fn queue_reply(&mut self, bytes: &[u8]) {
        self.replies.push_back(bytes.to_vec());
    }

    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        self.written.push(bytes.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        if !self.rx.is_empty() {
            debug!("discarding {} stale bytes", self.rx.len());
        }
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_reply_released_by_write() {
        let mut link = MemoryTransport::new();
        link.queue_reply(&[1, 2, 3]);
        link.discard_input().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(link.read(&mut buf).unwrap(), 0);

        link.write_all(&[0xAB]).unwrap();
        assert_eq!(link.written(), &[vec![0xAB]]);
        assert_eq!(link.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_discard_drops_stale_bytes() {
        let mut link = MemoryTransport::new();
        link.push_rx(&[9, 9, 9]);
        link.discard_input().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(link.read(&mut buf).unwrap(), 0);
        assert_eq!(link.read_calls(), 1);
    }

    #[test]
    fn test_transport_source_reports_timeout_as_none() {
        let mut link = MemoryTransport::new();
        link.push_rx(&[0x2B]);
        let mut source = TransportSource::new(&mut link);
        assert_eq!(source.next_byte().unwrap(), Some(0x2B));
        assert_eq!(source.next_byte().unwrap(), None);
    }

    #[test]
    fn test_boxed_transport_delegates() {
        let mut link: Box<dyn Transport> = Box::new(MemoryTransport::new());
        link.write_all(&[1]).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(link.read(&mut buf).unwrap(), 0);
    }
}
