//! Error taxonomy for the acquisition pipeline.
//!
//! Only [`ConfigError`] is allowed to stop the system. Everything else is
//! contained at the cycle boundary and turned into a log entry plus a
//! skip or fallback decision.

use thiserror::Error;

/// Invalid startup configuration. Fatal: the pipeline never runs with it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Missing required parameter {0}")]
    MissingParameter(&'static str),
    #[error("Host address must not be empty")]
    EmptyHost,
    #[error("Invalid numeric parameter {name}: '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("Port must be between 1 and 65535, got {0}")]
    PortOutOfRange(i64),
    #[error("Modbus ID must be between 1 and 247, got {0}")]
    UnitIdOutOfRange(i64),
    #[error("Unknown aggregation mode '{0}', expected 'phase' or 'channel'")]
    UnknownMode(String),
    #[error("Cannot read channel file {path}: {reason}")]
    ChannelFile { path: String, reason: String },
    #[error("Invalid JSON format: {0}")]
    InvalidJson(String),
    #[error("Configuration must be a list")]
    NotAList,
    #[error("Configuration must contain exactly {expected} channels, got {actual}")]
    WrongChannelCount { expected: usize, actual: usize },
    #[error("Channel {0} must be an object")]
    ChannelNotObject(usize),
    #[error("Channel {0} name must be a string")]
    InvalidName(usize),
    #[error("Channel {0} voltage must be positive")]
    InvalidVoltage(usize),
    #[error("Channel {0} power factor must be between 0 and 1")]
    InvalidPowerFactor(usize),
    #[error("Channel {channel} {field} must be a device id")]
    InvalidSource { channel: usize, field: &'static str },
}

/// Failure on the register link. Recorded into the health monitor; the
/// current cycle is aborted.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link is not connected")]
    NotConnected,
    #[error("Cannot resolve {0}")]
    Resolve(String),
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Modbus exception: {0}")]
    Exception(String),
    #[error("Expected {expected} registers, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Failure resolving a live value. Never escapes the fetcher: callers see
/// an absent value and fall back to static configuration.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Request timed out")]
    Timeout,
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Endpoint reported status '{0}'")]
    NotOk(String),
    #[error("Response carries no device record")]
    NoResult,
    #[error("No readable value found")]
    NoValue,
    #[error("Value {value} is not a plausible {quantity}")]
    Implausible { quantity: &'static str, value: f64 },
}

/// A derived value outside its physical plausibility bounds.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{quantity} {value:.3} outside [{min}, {max}]")]
pub struct RangeError {
    pub quantity: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}
