//! Home Power Monitor Library
//!
//! Polls a 16 channel Modbus TCP current transducer, derives per-channel and
//! per-phase power using live or configured voltage and power factor, and
//! publishes the results to a home-automation device store.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod health;
pub mod phase_aggregator;
pub mod publisher;
pub mod register_link;
pub mod value_fetcher;

// Re-export commonly used types for easier access
pub use acquisition::{CycleOutcome, PowerMonitor};
pub use config::{AggregationMode, ChannelConfig, MonitorConfig};
pub use error::{ConfigError, LinkError, LookupError, RangeError};
pub use publisher::{LogPublisher, MemoryPublisher, Publisher};
pub use register_link::{ModbusLink, RegisterLink};
pub use value_fetcher::{ValueFetcher, ValueSource};
