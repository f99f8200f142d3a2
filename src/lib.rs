//! # flapbus
//!
//! Bus master for split-flap display units sharing one half-duplex RS-485
//! line, plus the registry that tracks where each unit sits on the display.
//!
//! ## Features
//!
//! - **SFBUS framing**: both wire generations (end marker and CRC16)
//! - **Bounded retries**: every exchange gives up after a fixed number of decode attempts
//! - **Device registry**: slot ids, grid placement, liveness and calibration per unit
//! - **Persistence**: JSON registry document with validated replay
//! - **Command surface**: named JSON commands that never fail by panicking
//! - **Simulation**: an in-process bus of emulated units for tests and demos
//!
//! ## Quick Start
//!
//! ```rust
//! use flapbus::{BusClient, BusConfig, DeviceRegistry, GridPos, SimulatedBus, WireVariant};
//!
//! let bus = SimulatedBus::with_units(WireVariant::V1, [10, 11]);
//! let client = BusClient::new(bus, &BusConfig::default());
//! let mut registry = DeviceRegistry::new(client);
//!
//! registry.register(10, GridPos::new(0, 0)?, None)?;
//! registry.register(11, GridPos::new(1, 0)?, None)?;
//! assert_eq!(registry.render_text("HI", GridPos::new(0, 0)?), 2);
//! # Ok::<(), flapbus::RegistryError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] - frame encode/decode and CRC16
//! - [`transport`] - serial and in-memory byte links
//! - [`protocol`] - opcodes and reply payloads
//! - [`client`] - request/response engine with retry budget
//! - [`registry`] - device records, spatial map, persistence
//! - [`dispatcher`] - named JSON commands
//! - [`config`] - bus and server settings
//! - [`sim`] - simulated units

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod frame;
pub mod protocol;
pub mod registry;
pub mod sim;
pub mod symbols;
pub mod transport;

// Re-export main public types for convenience
pub use client::{BusClient, BusError};
pub use config::{BusConfig, ConfigError, ServerConfig};
pub use dispatcher::{DispatchError, Dispatcher};
pub use frame::{Frame, FrameCodec, FrameError, WireVariant};
pub use protocol::{EepromConfig, Opcode, StatusFlags, StatusReport};
pub use registry::{DeviceRegistry, DeviceState, GridPos, PowerState, RegistryError, SlotId};
pub use sim::SimulatedBus;
pub use transport::{MemoryTransport, SerialTransport, Transport};
