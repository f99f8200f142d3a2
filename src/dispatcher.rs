//! Named-command front door to the registry and the bus client.
//!
//! Requests are JSON objects; every outcome, failures included, comes back
//! as a JSON value. Nothing here panics on bad input.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::BusError;
use crate::registry::{DeviceRegistry, GridPos, RegistryError, SlotId};
use crate::transport::Transport;

pub const MAX_REQUEST_SIZE: usize = 4096;

pub type Args = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Format(String),
    #[error("unknown command '{0}'")]
    InvalidCommand(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Internal(String),
}

impl DispatchError {
    pub fn tag(&self) -> &'static str {
        match self {
            DispatchError::Format(_) => "format error",
            DispatchError::InvalidCommand(_) => "invalid command",
            DispatchError::Bus(BusError::Unreachable { .. }) => "unreachable",
            DispatchError::Bus(BusError::InvalidReply { .. } | BusError::Rejected { .. }) => {
                "invalid reply"
            }
            DispatchError::Bus(BusError::InvalidArgument(_)) => "format error",
            DispatchError::Registry(RegistryError::Corrupt(_)) => "corrupt",
            DispatchError::Registry(_) => "registry error",
            DispatchError::Internal(_) => "internal error",
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "error": self.tag(), "detail": self.to_string() })
    }
}

fn missing(key: &str) -> DispatchError {
    DispatchError::Format(format!("missing key: {key}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Register,
    Remove,
    Refresh,
    Describe,
    DescribeAll,
    Save,
    Load,
    RenderText,
    RenderFlapIndex,
    Ping,
    SetAddress,
    SetCalibration,
    Reset,
    Display,
    Power,
}

impl CommandName {
    pub const ALL: [CommandName; 15] = [
        CommandName::Register,
        CommandName::Remove,
        CommandName::Refresh,
        CommandName::Describe,
        CommandName::DescribeAll,
        CommandName::Save,
        CommandName::Load,
        CommandName::RenderText,
        CommandName::RenderFlapIndex,
        CommandName::Ping,
        CommandName::SetAddress,
        CommandName::SetCalibration,
        CommandName::Reset,
        CommandName::Display,
        CommandName::Power,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Register => "register",
            CommandName::Remove => "remove",
            CommandName::Refresh => "refresh",
            CommandName::Describe => "describe",
            CommandName::DescribeAll => "describeAll",
            CommandName::Save => "save",
            CommandName::Load => "load",
            CommandName::RenderText => "renderText",
            CommandName::RenderFlapIndex => "renderFlapIndex",
            CommandName::Ping => "ping",
            CommandName::SetAddress => "setAddress",
            CommandName::SetCalibration => "setCalibration",
            CommandName::Reset => "reset",
            CommandName::Display => "display",
            CommandName::Power => "power",
        }
    }

    /// Older `dm_*` (registry) and `dr_*` (raw device) names.
    pub fn legacy_name(self) -> &'static str {
        match self {
            CommandName::Register => "dm_register",
            CommandName::Remove => "dm_remove",
            CommandName::Refresh => "dm_refresh",
            CommandName::Describe => "dm_describe",
            CommandName::DescribeAll => "dm_dump",
            CommandName::Save => "dm_save",
            CommandName::Load => "dm_load",
            CommandName::RenderText => "dm_print",
            CommandName::RenderFlapIndex => "dm_print_single",
            CommandName::Ping => "dr_ping",
            CommandName::SetAddress => "dr_setaddress",
            CommandName::SetCalibration => "dr_setcalibration",
            CommandName::Reset => "dr_reset",
            CommandName::Display => "dr_display",
            CommandName::Power => "dr_power",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == name || c.legacy_name() == name)
    }
}

/// Routes named commands to a registry and the bus it owns.
pub struct Dispatcher<T> {
    registry: DeviceRegistry<T>,
    registry_file: PathBuf,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(registry: DeviceRegistry<T>, registry_file: PathBuf) -> Self {
        Self {
            registry,
            registry_file,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry<T> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry<T> {
        &mut self.registry
    }

    /// Parses one request line and returns the serialized reply.
    pub fn handle_line(&mut self, line: &str) -> String {
        let reply = if line.len() > MAX_REQUEST_SIZE {
            DispatchError::Format(format!(
                "request of {} bytes exceeds {}",
                line.len(),
                MAX_REQUEST_SIZE
            ))
            .to_json()
        } else {
            match serde_json::from_str::<Value>(line) {
                Ok(request) => self.handle_request(&request),
                Err(e) => json!({ "error": "parsing error", "detail": e.to_string() }),
            }
        };
        reply.to_string()
    }

    /// Handles `{"command": name, ...args}`.
    pub fn handle_request(&mut self, request: &Value) -> Value {
        let Some(args) = request.as_object() else {
            return DispatchError::Format("request must be a JSON object".into()).to_json();
        };
        match args.get("command").and_then(Value::as_str) {
            Some(name) => self.handle(name, args),
            None => missing("command").to_json(),
        }
    }

    pub fn handle(&mut self, name: &str, args: &Args) -> Value {
        debug!("command {} {:?}", name, args);
        match self.execute(name, args) {
            Ok(result) => result,
            Err(e) => {
                warn!("⚠️ {} failed: {}", name, e);
                e.to_json()
            }
        }
    }

    fn execute(&mut self, name: &str, args: &Args) -> Result<Value, DispatchError> {
        let command =
            CommandName::parse(name).ok_or_else(|| DispatchError::InvalidCommand(name.into()))?;

        match command {
            CommandName::Register => {
                let address = u16_arg(args, &["address"])?;
                let pos = grid_arg(args)?;
                let id = self.registry.register(address, pos, None)?;
                Ok(json!({ "id": id }))
            }
            CommandName::Remove => {
                let id = slot_arg(args)?;
                self.registry.remove(id)?;
                Ok(ack())
            }
            CommandName::Refresh => {
                let online = self.registry.refresh();
                Ok(json!({ "devices_online": online }))
            }
            CommandName::Describe => {
                let id = slot_arg(args)?;
                to_json(&self.registry.describe(id)?)
            }
            CommandName::DescribeAll => to_json(&self.registry.describe_all()),
            CommandName::Save => {
                let path = self.path_arg(args)?;
                self.registry.save(&path)?;
                Ok(json!({ "ack": true, "path": path.display().to_string() }))
            }
            CommandName::Load => {
                let path = self.path_arg(args)?;
                let devices = self.registry.load(&path)?;
                Ok(json!({ "ack": true, "devices": devices }))
            }
            CommandName::RenderText => {
                let text = str_arg(args, &["string"])?;
                let pos = grid_arg(args)?;
                let flaps = self.registry.render_text(text, pos);
                Ok(json!({ "ack": true, "flaps": flaps }))
            }
            CommandName::RenderFlapIndex => {
                let flap = u8_arg(args, &["flap"])?;
                let pos = grid_arg(args)?;
                let id = self.registry.render_flap_index(flap, pos)?;
                Ok(json!({ "ack": true, "id": id }))
            }
            CommandName::Ping => {
                let address = u16_arg(args, &["address"])?;
                match self.registry.bus_mut().ping(address) {
                    Ok(()) => Ok(json!({ "success": true })),
                    Err(BusError::InvalidArgument(detail)) => Err(DispatchError::Format(detail)),
                    Err(e) => Ok(json!({ "success": false, "detail": e.to_string() })),
                }
            }
            CommandName::SetAddress => {
                let address = u16_arg(args, &["address"])?;
                let new_address = u16_arg(args, &["newaddress", "newAddress"])?;
                let written = self.registry.bus_mut().set_address(address, new_address)?;
                let slot = self.registry.readdress(address, written.address);
                Ok(json!({
                    "success": true,
                    "address": written.address,
                    "calibration": written.calibration,
                    "id": slot,
                }))
            }
            CommandName::SetCalibration => {
                let address = u16_arg(args, &["address"])?;
                let calibration = u16_arg(args, &["calibration", "value"])?;
                let written = self.registry.bus_mut().set_calibration(address, calibration)?;
                let slot = self.registry.record_calibration(written.address, written.calibration);
                Ok(json!({
                    "success": true,
                    "address": written.address,
                    "calibration": written.calibration,
                    "id": slot,
                }))
            }
            CommandName::Reset => {
                let address = u16_arg(args, &["address"])?;
                self.registry.bus_mut().reset(address)?;
                Ok(ack())
            }
            CommandName::Display => {
                let address = u16_arg(args, &["address"])?;
                let flap = u8_arg(args, &["flap"])?;
                let full = bool_arg(args, &["full"])?.unwrap_or(false);
                self.registry.bus_mut().set_flap(address, flap, full)?;
                self.registry.record_flap(address, flap);
                Ok(ack())
            }
            CommandName::Power => {
                let address = u16_arg(args, &["address"])?;
                let on = bool_arg(args, &["power", "on"])?.ok_or_else(|| missing("power"))?;
                self.registry.bus_mut().motor_power(address, on)?;
                Ok(ack())
            }
        }
    }

    fn path_arg(&self, args: &Args) -> Result<PathBuf, DispatchError> {
        match lookup(args, &["path"]) {
            Some(_) => str_arg(args, &["path"]).map(PathBuf::from),
            None => Ok(self.registry_file.clone()),
        }
    }
}

fn ack() -> Value {
    json!({ "ack": true })
}

fn to_json<S: Serialize>(value: &S) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Internal(e.to_string()))
}

fn lookup<'a>(args: &'a Args, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| args.get(*key))
}

fn int_arg(args: &Args, keys: &[&str]) -> Result<i64, DispatchError> {
    let value = lookup(args, keys).ok_or_else(|| missing(keys[0]))?;
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| DispatchError::Format(format!("invalid value for key: {}", keys[0])))
}

fn ranged<N: TryFrom<i64>>(args: &Args, keys: &[&str]) -> Result<N, DispatchError> {
    let value = int_arg(args, keys)?;
    N::try_from(value)
        .map_err(|_| DispatchError::Format(format!("value out of range for key: {}", keys[0])))
}

fn u16_arg(args: &Args, keys: &[&str]) -> Result<u16, DispatchError> {
    ranged(args, keys)
}

fn u8_arg(args: &Args, keys: &[&str]) -> Result<u8, DispatchError> {
    ranged(args, keys)
}

fn slot_arg(args: &Args) -> Result<SlotId, DispatchError> {
    ranged(args, &["id"])
}

fn grid_arg(args: &Args) -> Result<GridPos, DispatchError> {
    let x = int_arg(args, &["x"])?;
    let y = int_arg(args, &["y"])?;
    Ok(GridPos::new(x, y)?)
}

fn str_arg<'a>(args: &'a Args, keys: &[&str]) -> Result<&'a str, DispatchError> {
    lookup(args, keys)
        .ok_or_else(|| missing(keys[0]))?
        .as_str()
        .ok_or_else(|| DispatchError::Format(format!("invalid value for key: {}", keys[0])))
}

/// Accepts JSON booleans and 0/1. `Ok(None)` when absent.
fn bool_arg(args: &Args, keys: &[&str]) -> Result<Option<bool>, DispatchError> {
    match lookup(args, keys) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) if n.as_i64() == Some(0) => Ok(Some(false)),
        Some(Value::Number(n)) if n.as_i64() == Some(1) => Ok(Some(true)),
        Some(_) => Err(DispatchError::Format(format!(
            "invalid value for key: {}",
            keys[0]
        ))),
    }
}
