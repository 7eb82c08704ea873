//! Channel model: turns raw connection parameters and the channel JSON into
//! validated, immutable configuration.

use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::{env, fmt, str::FromStr};

/// Number of current-sensing inputs on the transducer.
pub const CHANNEL_COUNT: usize = 16;
pub const DEFAULT_VOLTAGE: f64 = 230.0;
pub const DEFAULT_POWER_FACTOR: f64 = 0.75;
pub const DEFAULT_PORT: &str = "8887";
pub const DEFAULT_UNIT_ID: &str = "14";
pub const DEFAULT_QUERY_URL: &str = "http://127.0.0.1:8080";

/// Identifier of a device in the home-automation store that carries a live
/// voltage or power-factor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIdx(pub u32);

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection parameters exactly as they arrive from the host, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConnectionParams {
    pub host: String,
    pub port: String,
    pub unit_id: String,
    pub interval: String,
}

impl RawConnectionParams {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("HPM_ADDRESS").map_err(|_| ConfigError::MissingParameter("HPM_ADDRESS"))?,
            port: env::var("HPM_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string()),
            unit_id: env::var("HPM_UNIT_ID").unwrap_or_else(|_| DEFAULT_UNIT_ID.to_string()),
            interval: env::var("HPM_INTERVAL").unwrap_or_else(|_| "1".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Number of heartbeats between two polls, at least 1.
    pub poll_interval_ticks: u32,
}

/// One physical current-sensing channel.
///
/// A static value is only kept when it passed validation, so every channel
/// has either a usable static value or a dynamic source for each quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub voltage: Option<f64>,
    pub voltage_source: Option<DeviceIdx>,
    pub power_factor: Option<f64>,
    pub power_factor_source: Option<DeviceIdx>,
}

impl ChannelConfig {
    /// Convenience constructor for a channel with static values only.
    pub fn fixed(name: impl Into<String>, voltage: f64, power_factor: f64) -> Self {
        Self {
            name: name.into(),
            voltage: Some(voltage),
            voltage_source: None,
            power_factor: Some(power_factor),
            power_factor_source: None,
        }
    }
}

impl fmt::Display for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.name)?;
        match (self.voltage_source, self.voltage) {
            (Some(idx), _) => write!(f, ", Voltage from IDX {idx}")?,
            (None, Some(v)) => write!(f, ", Voltage {v}V")?,
            (None, None) => {}
        }
        match (self.power_factor_source, self.power_factor) {
            (Some(idx), _) => write!(f, ", PF from IDX {idx}"),
            (None, Some(pf)) => write!(f, ", PF {pf}"),
            (None, None) => Ok(()),
        }
    }
}

/// How derived power is grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationMode {
    /// Channels sharing a voltage source form a phase; phases and a grand
    /// total are summed.
    #[default]
    Phase,
    /// Every channel resolves its own voltage and power factor; no sums.
    PerChannel,
}

impl FromStr for AggregationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phase" => Ok(Self::Phase),
            "channel" => Ok(Self::PerChannel),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Everything the host binary needs to build a monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub connection: ConnectionParams,
    pub channels: Vec<ChannelConfig>,
    pub mode: AggregationMode,
    pub debug: bool,
    pub query_url: String,
}

impl MonitorConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = RawConnectionParams::from_env()?;
        let channel_json = match env::var("HPM_CHANNELS") {
            Ok(json) => json,
            Err(_) => {
                let path = env::var("HPM_CHANNELS_FILE")
                    .map_err(|_| ConfigError::MissingParameter("HPM_CHANNELS"))?;
                std::fs::read_to_string(&path).map_err(|e| ConfigError::ChannelFile {
                    path,
                    reason: e.to_string(),
                })?
            }
        };
        let (connection, channels) = parse_and_validate(&raw, &channel_json)?;
        let mode = match env::var("HPM_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => AggregationMode::default(),
        };

        Ok(Self {
            connection,
            channels,
            mode,
            debug: parse_bool_safe(env::var("HPM_DEBUG").ok()),
            query_url: env::var("HPM_QUERY_URL").unwrap_or_else(|_| DEFAULT_QUERY_URL.to_string()),
        })
    }
}

/// Validates connection parameters and the channel list. Stops at the first
/// violation.
pub fn parse_and_validate(
    raw: &RawConnectionParams,
    channel_json: &str,
) -> Result<(ConnectionParams, Vec<ChannelConfig>), ConfigError> {
    let connection = validate_connection_params(raw)?;
    let channels = parse_channel_config(channel_json)?;
    Ok((connection, channels))
}

fn validate_connection_params(raw: &RawConnectionParams) -> Result<ConnectionParams, ConfigError> {
    let host = raw.host.trim();
    if host.is_empty() {
        return Err(ConfigError::EmptyHost);
    }

    let port = parse_integer("port", &raw.port)?;
    let unit_id = parse_integer("unit id", &raw.unit_id)?;
    let interval = parse_integer("interval", &raw.interval)?;

    if !(1..=65535).contains(&port) {
        return Err(ConfigError::PortOutOfRange(port));
    }
    if !(1..=247).contains(&unit_id) {
        return Err(ConfigError::UnitIdOutOfRange(unit_id));
    }

    Ok(ConnectionParams {
        host: host.to_string(),
        port: port as u16,
        unit_id: unit_id as u8,
        poll_interval_ticks: interval.clamp(1, u32::MAX as i64) as u32,
    })
}

fn parse_integer(name: &'static str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn parse_channel_config(channel_json: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
    let config: Value =
        serde_json::from_str(channel_json).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
    let entries = config.as_array().ok_or(ConfigError::NotAList)?;

    if entries.len() != CHANNEL_COUNT {
        return Err(ConfigError::WrongChannelCount {
            expected: CHANNEL_COUNT,
            actual: entries.len(),
        });
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let fields = entry.as_object().ok_or(ConfigError::ChannelNotObject(i + 1))?;
            parse_channel(i + 1, fields)
        })
        .collect()
}

fn parse_channel(number: usize, fields: &Map<String, Value>) -> Result<ChannelConfig, ConfigError> {
    let name = match fields.get("name") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(name)) => name.trim().to_string(),
        Some(_) => return Err(ConfigError::InvalidName(number)),
    };
    let name = if name.is_empty() {
        format!("Channel {number}")
    } else {
        name
    };

    let voltage_source = parse_source(number, fields, &["voltageSource", "voltage_idx"])?;
    let power_factor_source = parse_source(number, fields, &["powerFactorSource", "pf_idx"])?;

    let voltage = match static_field(fields, &["voltage"]) {
        None => Some(DEFAULT_VOLTAGE),
        Some(value) => value.as_f64().filter(|v| *v > 0.0),
    };
    if voltage.is_none() && voltage_source.is_none() {
        return Err(ConfigError::InvalidVoltage(number));
    }

    let power_factor = match static_field(fields, &["powerFactor", "pf"]) {
        None => Some(DEFAULT_POWER_FACTOR),
        Some(value) => value.as_f64().filter(|pf| *pf > 0.0 && *pf <= 1.0),
    };
    if power_factor.is_none() && power_factor_source.is_none() {
        return Err(ConfigError::InvalidPowerFactor(number));
    }

    Ok(ChannelConfig {
        name,
        voltage,
        voltage_source,
        power_factor,
        power_factor_source,
    })
}

/// First non-null value among `keys`; later keys are accepted aliases.
fn field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

/// First key present among `keys`, explicit nulls included.
fn static_field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn parse_source(
    number: usize,
    fields: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<DeviceIdx>, ConfigError> {
    let invalid = || ConfigError::InvalidSource {
        channel: number,
        field: keys[0],
    };
    match field(fields, keys) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(|n| Some(DeviceIdx(n)))
            .ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(|n| Some(DeviceIdx(n)))
            .map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
pub fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
