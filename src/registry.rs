//! Device registry: every known unit, where it sits on the display grid and
//! what it last reported.
//!
//! The registry owns the bus client. All unit traffic from the command
//! surface goes through it, so a single lock around the registry is enough
//! to keep bus exchanges from overlapping.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{BusClient, BusError, MAX_UNIT_ADDRESS};
use crate::protocol::{StatusFlags, StatusReport};
use crate::symbols;
use crate::transport::Transport;

pub const GRID_WIDTH: usize = 20;
pub const GRID_HEIGHT: usize = 4;
pub const MAX_DEVICES: usize = 128;

const_assert!(MAX_DEVICES >= GRID_WIDTH * GRID_HEIGHT);

pub type SlotId = u32;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry full ({capacity} slots)")]
    RegistryFull { capacity: usize },
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("position ({x}, {y}) is outside the display grid")]
    OutOfBounds { x: i64, y: i64 },
    #[error("address 0x{0:04X} is reserved")]
    ReservedAddress(u16),
    #[error("no device at ({x}, {y})")]
    NoDeviceAt { x: u8, y: u8 },
    #[error("corrupt registry document: {0}")]
    Corrupt(String),
    #[error("registry file error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: u8,
    pub y: u8,
}

impl GridPos {
    /// Bounds-checked constructor for coordinates coming from outside.
    pub fn new(x: i64, y: i64) -> Result<Self, RegistryError> {
        let in_grid = |v: i64, limit: usize| usize::try_from(v).map_or(false, |v| v < limit);
        if !in_grid(x, GRID_WIDTH) || !in_grid(y, GRID_HEIGHT) {
            return Err(RegistryError::OutOfBounds { x, y });
        }
        // both fit in u8 after the range check
        Ok(Self {
            x: x as u8,
            y: y as u8,
        })
    }

    fn in_grid(self) -> bool {
        usize::from(self.x) < GRID_WIDTH && usize::from(self.y) < GRID_HEIGHT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    #[default]
    Unallocated,
    New,
    Online,
    Offline,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    #[default]
    Disabled,
    Enabled,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub slot_id: SlotId,
    /// Bus address; 0 for removed and unallocated slots.
    pub address: u16,
    pub calibration: u16,
    pub position: Option<GridPos>,
    pub state: DeviceState,
    pub power: PowerState,
    pub last_voltage: f64,
    pub last_rotation_count: u32,
    pub last_status_byte: u8,
    pub current_flap: u8,
}

impl DeviceRecord {
    fn new(slot_id: SlotId, address: u16, position: Option<GridPos>) -> Self {
        Self {
            slot_id,
            address,
            calibration: 0,
            position,
            state: DeviceState::New,
            power: PowerState::Disabled,
            last_voltage: 0.0,
            last_rotation_count: 0,
            last_status_byte: 0,
            current_flap: 0,
        }
    }

    fn unallocated(slot_id: SlotId) -> Self {
        Self {
            address: 0,
            state: DeviceState::Unallocated,
            ..Self::new(slot_id, 0, None)
        }
    }

    pub fn is_live(&self) -> bool {
        self.address != 0
    }

    fn apply_status(&mut self, report: &StatusReport) {
        let flags = report.flags();
        self.last_status_byte = report.raw;
        self.last_voltage = report.voltage();
        self.last_rotation_count = report.rotations;
        self.power = if flags.power_down {
            PowerState::Disabled
        } else {
            PowerState::Enabled
        };
        self.state = if flags.fail_safe {
            DeviceState::Failed
        } else {
            DeviceState::Online
        };
    }

    /// Readings from the last good status stay as they were.
    fn mark_unreachable(&mut self) {
        self.state = DeviceState::Offline;
        self.power = PowerState::Unknown;
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.slot_id,
            address: self.address,
            calibration: self.calibration,
            position: self.position,
            flap_id: self.current_flap,
            flap_char: symbols::symbol_for_flap(self.current_flap)
                .map(String::from)
                .unwrap_or_default(),
            status: StatusSnapshot {
                device: self.state,
                power: self.power,
                voltage: self.last_voltage,
                rotations: self.last_rotation_count,
                raw: self.last_status_byte,
                flags: StatusFlags::from_byte(self.last_status_byte),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub device: DeviceState,
    pub power: PowerState,
    pub voltage: f64,
    pub rotations: u32,
    pub raw: u8,
    pub flags: StatusFlags,
}

/// Serialized form of one record, shared by describe output and the
/// persisted registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: SlotId,
    pub address: u16,
    #[serde(default)]
    pub calibration: u16,
    #[serde(deserialize_with = "required_position")]
    pub position: Option<GridPos>,
    #[serde(rename = "flapID", default)]
    pub flap_id: u8,
    #[serde(rename = "flapChar", default)]
    pub flap_char: String,
    #[serde(default)]
    pub status: StatusSnapshot,
}

// The key must be present; `null` marks a unit without a grid cell.
fn required_position<'de, D>(deserializer: D) -> Result<Option<GridPos>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<GridPos>::deserialize(deserializer)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(rename = "nextFreeSlot")]
    pub next_free_slot: SlotId,
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryOverview {
    pub devices_all: usize,
    pub devices_online: usize,
    pub devices: Vec<DeviceSnapshot>,
    /// `map[y][x]`, -1 for an empty cell.
    pub map: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialMap {
    cells: [[Option<SlotId>; GRID_HEIGHT]; GRID_WIDTH],
}

impl Default for SpatialMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialMap {
    pub fn new() -> Self {
        Self {
            cells: [[None; GRID_HEIGHT]; GRID_WIDTH],
        }
    }

    pub fn get(&self, pos: GridPos) -> Option<SlotId> {
        self.cells[usize::from(pos.x)][usize::from(pos.y)]
    }

    /// Puts `id` at `pos` and returns the slot that was there before.
    fn place(&mut self, pos: GridPos, id: SlotId) -> Option<SlotId> {
        self.cells[usize::from(pos.x)][usize::from(pos.y)].replace(id)
    }

    /// Empties `pos` if it still holds `id`.
    fn vacate(&mut self, pos: GridPos, id: SlotId) {
        let cell = &mut self.cells[usize::from(pos.x)][usize::from(pos.y)];
        if *cell == Some(id) {
            *cell = None;
        }
    }

    fn clear(&mut self) {
        self.cells = [[None; GRID_HEIGHT]; GRID_WIDTH];
    }

    pub fn rows(&self) -> Vec<Vec<i64>> {
        (0..GRID_HEIGHT)
            .map(|y| {
                (0..GRID_WIDTH)
                    .map(|x| self.cells[x][y].map_or(-1, i64::from))
                    .collect()
            })
            .collect()
    }
}

pub struct DeviceRegistry<T> {
    bus: BusClient<T>,

    // Records in allocation order, never more than MAX_DEVICES
    devices: heapless::Vec<DeviceRecord, MAX_DEVICES>,
    map: SpatialMap,
    next_slot: SlotId,

    inter_command_delay: Duration,
}

impl<T: Transport> DeviceRegistry<T> {
    pub fn new(bus: BusClient<T>) -> Self {
        Self {
            bus,
            devices: heapless::Vec::new(),
            map: SpatialMap::new(),
            next_slot: 0,
            inter_command_delay: Duration::ZERO,
        }
    }

    pub fn with_inter_command_delay(mut self, delay: Duration) -> Self {
        self.inter_command_delay = delay;
        self
    }

    pub fn bus(&self) -> &BusClient<T> {
        &self.bus
    }

    /// Direct unit access for commands that are not tied to a slot.
    pub fn bus_mut(&mut self) -> &mut BusClient<T> {
        &mut self.bus
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn device(&self, id: SlotId) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.slot_id == id)
    }

    pub fn map(&self) -> &SpatialMap {
        &self.map
    }

    pub fn slot_at(&self, pos: GridPos) -> Option<SlotId> {
        self.map.get(pos)
    }

    pub fn next_slot(&self) -> SlotId {
        self.next_slot
    }

    pub fn online_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state == DeviceState::Online)
            .count()
    }

    /// Drops every record and empties the grid.
    pub fn reset(&mut self) {
        self.devices.clear();
        self.map.clear();
        self.next_slot = 0;
    }

    /// Adds a unit at `pos`, polling it once for status and calibration.
    ///
    /// Passing `existing` reuses that slot id instead of allocating one.
    pub fn register(
        &mut self,
        address: u16,
        pos: GridPos,
        existing: Option<SlotId>,
    ) -> Result<SlotId, RegistryError> {
        self.insert(address, Some(pos), existing, 0)
    }

    fn insert(
        &mut self,
        address: u16,
        pos: Option<GridPos>,
        existing: Option<SlotId>,
        calibration: u16,
    ) -> Result<SlotId, RegistryError> {
        if address == 0 || address > MAX_UNIT_ADDRESS {
            return Err(RegistryError::ReservedAddress(address));
        }
        if let Some(p) = pos {
            if !p.in_grid() {
                return Err(RegistryError::OutOfBounds {
                    x: i64::from(p.x),
                    y: i64::from(p.y),
                });
            }
        }

        // The counter never wraps, so the last id stays unallocated.
        if existing.is_none() && self.next_slot == SlotId::MAX {
            return Err(RegistryError::RegistryFull {
                capacity: MAX_DEVICES,
            });
        }
        let id = existing.unwrap_or(self.next_slot);
        let mut record = DeviceRecord::new(id, address, pos);
        record.calibration = calibration;

        let index = match self.index_of(id) {
            Some(index) => {
                if let Some(old) = self.devices[index].position {
                    self.map.vacate(old, id);
                }
                self.devices[index] = record;
                index
            }
            None => {
                self.devices
                    .push(record)
                    .map_err(|_| RegistryError::RegistryFull {
                        capacity: MAX_DEVICES,
                    })?;
                self.devices.len() - 1
            }
        };
        self.next_slot = self.next_slot.max(id.saturating_add(1));

        if let Some(p) = pos {
            if let Some(evicted) = self.map.place(p, id).filter(|&other| other != id) {
                if let Some(other) = self.devices.iter_mut().find(|d| d.slot_id == evicted) {
                    other.position = None;
                }
                info!(
                    "📍 Slot {} evicted from ({}, {}) by slot {}",
                    evicted, p.x, p.y, id
                );
            }
        }

        if self.poll_status(index) {
            self.poll_calibration(index);
        }

        info!("➕ Registered slot {} at address 0x{:04X}", id, address);
        Ok(id)
    }

    /// Soft-deletes a slot. The record stays visible by id.
    pub fn remove(&mut self, id: SlotId) -> Result<(), RegistryError> {
        let index = self.index_of(id).ok_or(RegistryError::UnknownSlot(id))?;
        let record = &mut self.devices[index];
        if let Some(pos) = record.position.take() {
            self.map.vacate(pos, id);
        }
        record.address = 0;
        record.state = DeviceState::Removed;
        info!("➖ Removed slot {}", id);
        Ok(())
    }

    /// Polls every live slot and returns how many came back online.
    pub fn refresh(&mut self) -> usize {
        let mut online = 0;
        for index in 0..self.devices.len() {
            if self.devices[index].is_live()
                && self.poll_status(index)
                && self.devices[index].state == DeviceState::Online
            {
                online += 1;
            }
        }
        debug!("refresh: {} of {} slots online", online, self.devices.len());
        online
    }

    pub fn describe(&self, id: SlotId) -> Result<DeviceSnapshot, RegistryError> {
        match self.device(id) {
            Some(record) => Ok(record.snapshot()),
            None if id < self.next_slot => Ok(DeviceRecord::unallocated(id).snapshot()),
            None => Err(RegistryError::UnknownSlot(id)),
        }
    }

    /// Refreshes all live slots, then snapshots the whole registry.
    pub fn describe_all(&mut self) -> RegistryOverview {
        self.refresh();
        let mut devices: Vec<DeviceSnapshot> =
            self.devices.iter().map(DeviceRecord::snapshot).collect();
        devices.sort_by_key(|d| d.id);
        RegistryOverview {
            devices_all: self.devices.len(),
            devices_online: self.online_count(),
            devices,
            map: self.map.rows(),
        }
    }

    /// Spells `text` along the row starting at `origin`.
    ///
    /// Returns the number of units that were sent a flap command.
    pub fn render_text(&mut self, text: &str, origin: GridPos) -> usize {
        let mut commanded = 0;
        for (offset, c) in text.chars().enumerate() {
            let x = usize::from(origin.x) + offset;
            if x >= GRID_WIDTH {
                break;
            }
            let pos = GridPos {
                x: x as u8,
                y: origin.y,
            };
            let Some(index) = self.map.get(pos).and_then(|id| self.index_of(id)) else {
                continue;
            };
            if !self.devices[index].is_live() {
                continue;
            }
            let Some(flap) = symbols::flap_for_char(c) else {
                debug!("no flap for {:?}, skipping ({}, {})", c, pos.x, pos.y);
                continue;
            };

            if commanded > 0 && !self.inter_command_delay.is_zero() {
                thread::sleep(self.inter_command_delay);
            }
            self.command_flap(index, flap);
            commanded += 1;
        }
        commanded
    }

    pub fn render_flap_index(&mut self, flap: u8, pos: GridPos) -> Result<SlotId, RegistryError> {
        let index = self
            .map
            .get(pos)
            .and_then(|id| self.index_of(id))
            .filter(|&index| self.devices[index].is_live())
            .ok_or(RegistryError::NoDeviceAt { x: pos.x, y: pos.y })?;
        self.command_flap(index, flap);
        Ok(self.devices[index].slot_id)
    }

    pub fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            next_free_slot: self.next_slot,
            devices: self
                .devices
                .iter()
                .filter(|d| d.is_live())
                .map(DeviceRecord::snapshot)
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let document = self.to_document();
        let text = serde_json::to_string_pretty(&document)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        fs::write(path, text)?;
        info!(
            "💾 Saved {} devices to {}",
            document.devices.len(),
            path.display()
        );
        Ok(())
    }

    /// Replaces the registry with the document at `path`.
    ///
    /// The registry is emptied first and stays empty if the file cannot be
    /// read or fails validation.
    pub fn load(&mut self, path: &Path) -> Result<usize, RegistryError> {
        self.reset();
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => RegistryError::Corrupt(e.to_string()),
            _ => RegistryError::Io(e),
        })?;
        let document: RegistryDocument =
            serde_json::from_str(&text).map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let restored = self.load_document(&document)?;
        info!("📂 Loaded {} devices from {}", restored, path.display());
        Ok(restored)
    }

    pub fn load_document(&mut self, document: &RegistryDocument) -> Result<usize, RegistryError> {
        self.reset();
        validate_document(document)?;

        for device in &document.devices {
            if let Err(e) = self.insert(
                device.address,
                device.position,
                Some(device.id),
                device.calibration,
            ) {
                self.reset();
                return Err(RegistryError::Corrupt(format!("slot {}: {}", device.id, e)));
            }
            if let Some(index) = self.index_of(device.id) {
                self.devices[index].current_flap = device.flap_id;
            }
        }

        let max_id = document.devices.iter().map(|d| d.id.saturating_add(1)).max();
        self.next_slot = max_id
            .unwrap_or(0)
            .max(document.next_free_slot)
            .max(self.next_slot);
        Ok(document.devices.len())
    }

    /// Follows a unit whose bus address was changed.
    pub fn readdress(&mut self, old: u16, new: u16) -> Option<SlotId> {
        if new == 0 || old == new {
            return None;
        }
        let record = self.live_by_address_mut(old)?;
        record.address = new;
        info!(
            "🔀 Slot {} moved from 0x{:04X} to 0x{:04X}",
            record.slot_id, old, new
        );
        Some(record.slot_id)
    }

    pub fn record_calibration(&mut self, address: u16, calibration: u16) -> Option<SlotId> {
        let record = self.live_by_address_mut(address)?;
        record.calibration = calibration;
        Some(record.slot_id)
    }

    /// Notes a flap commanded outside the registry, e.g. a raw display call.
    pub fn record_flap(&mut self, address: u16, flap: u8) -> Option<SlotId> {
        let record = self.live_by_address_mut(address)?;
        record.current_flap = flap;
        Some(record.slot_id)
    }

    fn index_of(&self, id: SlotId) -> Option<usize> {
        self.devices.iter().position(|d| d.slot_id == id)
    }

    fn live_by_address_mut(&mut self, address: u16) -> Option<&mut DeviceRecord> {
        self.devices
            .iter_mut()
            .find(|d| d.is_live() && d.address == address)
    }

    fn command_flap(&mut self, index: usize, flap: u8) {
        let address = self.devices[index].address;
        match self.bus.set_flap(address, flap, false) {
            Ok(()) => self.devices[index].current_flap = flap,
            Err(e) => {
                warn!("⚠️ Flap command to slot {} failed: {}", self.devices[index].slot_id, e);
                self.devices[index].mark_unreachable();
            }
        }
    }

    /// Reads status into the record. Returns whether the unit answered.
    fn poll_status(&mut self, index: usize) -> bool {
        let address = self.devices[index].address;
        let result = self.bus.read_status(address);
        let record = &mut self.devices[index];
        match result {
            Ok(report) if !report.is_unreachable() => {
                record.apply_status(&report);
                true
            }
            Ok(_) => {
                record.mark_unreachable();
                false
            }
            Err(e) => {
                log_unreachable(record.slot_id, &e);
                record.mark_unreachable();
                false
            }
        }
    }

    fn poll_calibration(&mut self, index: usize) {
        let address = self.devices[index].address;
        let result = self.bus.read_calibration(address);
        let record = &mut self.devices[index];
        match result {
            Ok(calibration) => record.calibration = calibration,
            Err(e) => {
                log_unreachable(record.slot_id, &e);
                record.mark_unreachable();
            }
        }
    }
}

fn log_unreachable(slot: SlotId, error: &BusError) {
    warn!("📡 Slot {} offline: {}", slot, error);
}

fn validate_document(document: &RegistryDocument) -> Result<(), RegistryError> {
    if document.devices.len() > MAX_DEVICES {
        return Err(RegistryError::Corrupt(format!(
            "{} devices exceed capacity {}",
            document.devices.len(),
            MAX_DEVICES
        )));
    }

    if document.next_free_slot == SlotId::MAX {
        return Err(RegistryError::Corrupt(format!(
            "slot counter {} leaves no id to allocate",
            document.next_free_slot
        )));
    }

    let mut ids: Vec<SlotId> = document.devices.iter().map(|d| d.id).collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(RegistryError::Corrupt(format!("duplicate slot id {}", pair[0])));
    }

    for device in &document.devices {
        if device.address == 0 || device.address > MAX_UNIT_ADDRESS {
            return Err(RegistryError::Corrupt(format!(
                "slot {} has reserved address 0x{:04X}",
                device.id, device.address
            )));
        }
        if device.id == SlotId::MAX {
            return Err(RegistryError::Corrupt(format!(
                "slot id {} leaves no id to allocate",
                device.id
            )));
        }
        if let Some(pos) = device.position.filter(|p| !p.in_grid()) {
            return Err(RegistryError::Corrupt(format!(
                "slot {} placed outside the grid at ({}, {})",
                device.id, pos.x, pos.y
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::frame::{FrameCodec, WireVariant, REPLY_ADDRESS};
    use crate::protocol::{EepromConfig, STATUS_UNREACHABLE};
    use crate::transport::MemoryTransport;

    fn registry() -> DeviceRegistry<MemoryTransport> {
        DeviceRegistry::new(BusClient::new(MemoryTransport::new(), &BusConfig::default()))
    }

    fn queue(registry: &mut DeviceRegistry<MemoryTransport>, payload: &[u8]) {
        let frame = FrameCodec::new(WireVariant::V1)
            .encode(REPLY_ADDRESS, payload)
            .unwrap();
        registry.bus_mut().transport_mut().queue_reply(&frame);
    }

    fn queue_healthy(registry: &mut DeviceRegistry<MemoryTransport>, address: u16, calibration: u16) {
        let status = StatusReport {
            raw: 0x00,
            voltage_raw: 512,
            rotations: 7,
        };
        queue(registry, &status.to_reply());
        queue(registry, &EepromConfig { address, calibration }.to_reply());
    }

    fn pos(x: i64, y: i64) -> GridPos {
        GridPos::new(x, y).unwrap()
    }

    #[test]
    fn test_register_polls_status_and_calibration() {
        let mut reg = registry();
        queue_healthy(&mut reg, 10, 321);
        let id = reg.register(10, pos(0, 0), None).unwrap();

        let record = reg.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Online);
        assert_eq!(record.power, PowerState::Enabled);
        assert_eq!(record.calibration, 321);
        assert!((record.last_voltage - 27.5).abs() < 1e-9);
        assert_eq!(record.last_rotation_count, 7);
    }

    #[test]
    fn test_silent_unit_registers_offline() {
        let mut reg = registry();
        let id = reg.register(10, pos(3, 1), None).unwrap();
        let record = reg.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Offline);
        assert_eq!(record.power, PowerState::Unknown);
        assert_eq!(reg.slot_at(pos(3, 1)), Some(id));
        // no calibration read after a failed status read
        assert_eq!(reg.bus().transport().written().len(), 1);
    }

    #[test]
    fn test_unreachable_sentinel_keeps_last_readings() {
        let mut reg = registry();
        let status = StatusReport {
            raw: 0b0000_1000,
            voltage_raw: 512,
            rotations: 7,
        };
        queue(&mut reg, &status.to_reply());
        queue(&mut reg, &EepromConfig { address: 10, calibration: 0 }.to_reply());
        let id = reg.register(10, pos(0, 0), None).unwrap();
        let before = reg.describe(id).unwrap().status;

        queue(&mut reg, &[STATUS_UNREACHABLE, 0x03, 0xFF, 0, 0, 0, 99]);
        assert_eq!(reg.refresh(), 0);

        let record = reg.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Offline);
        assert_eq!(record.power, PowerState::Unknown);
        assert!((record.last_voltage - 27.5).abs() < 1e-9);
        assert_eq!(record.last_rotation_count, 7);
        assert_eq!(record.last_status_byte, 0b0000_1000);

        let after = reg.describe(id).unwrap().status;
        assert_eq!(after.raw, before.raw);
        assert_eq!(after.flags, before.flags);
        assert!(after.flags.home_sense);
        assert!(!after.flags.fail_safe);
    }

    #[test]
    fn test_fail_safe_and_power_down_flags() {
        let mut reg = registry();
        let status = StatusReport {
            raw: 0b0011_0000,
            voltage_raw: 0,
            rotations: 0,
        };
        queue(&mut reg, &status.to_reply());
        queue(&mut reg, &EepromConfig { address: 4, calibration: 0 }.to_reply());
        let id = reg.register(4, pos(0, 0), None).unwrap();

        let record = reg.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Failed);
        assert_eq!(record.power, PowerState::Disabled);
        assert_eq!(reg.online_count(), 0);
    }

    #[test]
    fn test_reserved_addresses_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register(0, pos(0, 0), None),
            Err(RegistryError::ReservedAddress(0))
        ));
        assert!(matches!(
            reg.register(0xFFFF, pos(0, 0), None),
            Err(RegistryError::ReservedAddress(0xFFFF))
        ));
        assert_eq!(reg.next_slot(), 0);
    }

    #[test]
    fn test_grid_bounds() {
        assert!(GridPos::new(19, 3).is_ok());
        assert!(matches!(
            GridPos::new(20, 0),
            Err(RegistryError::OutOfBounds { x: 20, y: 0 })
        ));
        assert!(GridPos::new(0, 4).is_err());
        assert!(GridPos::new(-1, 0).is_err());
    }

    #[test]
    fn test_remove_clears_cell_and_address() {
        let mut reg = registry();
        let id = reg.register(10, pos(2, 2), None).unwrap();
        reg.remove(id).unwrap();

        let record = reg.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Removed);
        assert_eq!(record.address, 0);
        assert_eq!(record.position, None);
        assert_eq!(reg.slot_at(pos(2, 2)), None);

        let writes = reg.bus().transport().written().len();
        reg.refresh();
        assert_eq!(reg.bus().transport().written().len(), writes);
        assert!(matches!(reg.remove(99), Err(RegistryError::UnknownSlot(99))));
    }

    #[test]
    fn test_slot_ids_not_reused_after_remove() {
        let mut reg = registry();
        let a = reg.register(10, pos(0, 0), None).unwrap();
        reg.remove(a).unwrap();
        let b = reg.register(11, pos(0, 0), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_describe_gaps_and_unknown_ids() {
        let mut reg = registry();
        reg.register(10, pos(0, 0), Some(3)).unwrap();
        assert_eq!(reg.describe(1).unwrap().status.device, DeviceState::Unallocated);
        assert!(matches!(reg.describe(4), Err(RegistryError::UnknownSlot(4))));
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = registry();
        for i in 0..MAX_DEVICES {
            reg.insert(u16::try_from(i + 1).unwrap(), None, None, 0).unwrap();
        }
        assert!(matches!(
            reg.register(500, pos(0, 0), None),
            Err(RegistryError::RegistryFull { capacity: 128 })
        ));
    }

    #[test]
    fn test_render_text_skips_gaps_and_unknown_symbols() {
        let mut reg = registry();
        let a = reg.register(10, pos(0, 0), None).unwrap();
        reg.register(12, pos(2, 0), None).unwrap();
        let d = reg.register(13, pos(3, 0), None).unwrap();
        let before = reg.bus().transport().written().len();

        // '#' at (3,0) has no flap, (1,0) is empty
        let commanded = reg.render_text("hi!#", pos(0, 0));
        assert_eq!(commanded, 2);

        let sent = &reg.bus().transport().written()[before..];
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][3..7], &[10, 0, 0x10, 8]);
        assert_eq!(&sent[1][3..7], &[12, 0, 0x10, 44]);
        assert_eq!(reg.device(a).unwrap().current_flap, 8);
        assert_eq!(reg.device(d).unwrap().current_flap, 0);
    }

    #[test]
    fn test_render_text_stops_at_grid_edge() {
        let mut reg = registry();
        reg.register(10, pos(19, 1), None).unwrap();
        assert_eq!(reg.render_text("ABC", pos(19, 1)), 1);
    }

    #[test]
    fn test_render_flap_index_on_empty_cell() {
        let mut reg = registry();
        assert!(matches!(
            reg.render_flap_index(5, pos(4, 0)),
            Err(RegistryError::NoDeviceAt { x: 4, y: 0 })
        ));
        let id = reg.register(10, pos(4, 0), None).unwrap();
        assert_eq!(reg.render_flap_index(5, pos(4, 0)).unwrap(), id);
        assert_eq!(reg.describe(id).unwrap().flap_char, "E");
    }

    #[test]
    fn test_readdress_follows_unit() {
        let mut reg = registry();
        let id = reg.register(10, pos(0, 0), None).unwrap();
        assert_eq!(reg.readdress(10, 20), Some(id));
        assert_eq!(reg.device(id).unwrap().address, 20);
        assert_eq!(reg.readdress(10, 30), None);
        assert_eq!(reg.record_calibration(20, 77), Some(id));
        assert_eq!(reg.device(id).unwrap().calibration, 77);
    }

    #[test]
    fn test_map_rows_layout() {
        let mut reg = registry();
        let id = reg.register(10, pos(5, 2), None).unwrap();
        let rows = reg.map().rows();
        assert_eq!(rows.len(), GRID_HEIGHT);
        assert_eq!(rows[0].len(), GRID_WIDTH);
        assert_eq!(rows[2][5], i64::from(id));
        assert_eq!(rows[0][0], -1);
    }

    #[test]
    fn test_exhausted_slot_counter_refuses_allocation() {
        let mut reg = registry();
        let document: RegistryDocument = serde_json::from_str(
            r#"{"nextFreeSlot": 0, "devices": [
                {"id": 4294967294, "address": 10, "position": {"x": 0, "y": 0}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(reg.load_document(&document).unwrap(), 1);
        assert_eq!(reg.next_slot(), SlotId::MAX);

        assert!(matches!(
            reg.register(11, pos(1, 0), None),
            Err(RegistryError::RegistryFull { .. })
        ));
        assert_eq!(reg.devices().len(), 1);
        assert_eq!(reg.device(SlotId::MAX - 1).unwrap().address, 10);
    }

    #[test]
    fn test_document_with_last_slot_id_is_corrupt() {
        let cases = [
            RegistryDocument {
                next_free_slot: SlotId::MAX,
                devices: Vec::new(),
            },
            serde_json::from_str(
                r#"{"nextFreeSlot": 0, "devices": [
                    {"id": 4294967295, "address": 10, "position": null}
                ]}"#,
            )
            .unwrap(),
        ];
        for document in cases {
            let mut reg = registry();
            assert!(matches!(
                reg.load_document(&document),
                Err(RegistryError::Corrupt(_))
            ));
            assert!(reg.devices().is_empty());
            assert_eq!(reg.next_slot(), 0);
        }
    }
}
