//! Live voltage / power-factor lookups against the home-automation store.
//!
//! Every failure stays inside this module: callers get `None` and fall back
//! to the statically configured value.

use crate::config::{ChannelConfig, DeviceIdx};
use crate::error::LookupError;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    PowerFactor,
}

impl Quantity {
    pub fn name(self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::PowerFactor => "power factor",
        }
    }

    pub fn is_plausible(self, value: f64) -> bool {
        match self {
            Quantity::Voltage => value.is_finite() && value > 0.0,
            Quantity::PowerFactor => value > 0.0 && value <= 1.0,
        }
    }
}

/// Voltage and power factor used to turn a current into real power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectricalParams {
    pub voltage: f64,
    pub power_factor: f64,
}

impl ElectricalParams {
    pub fn power(&self, current: f64) -> f64 {
        self.voltage * current * self.power_factor
    }
}

/// Anything that can produce the current reading of a device by id.
#[async_trait]
pub trait ValueSource: Send + Sync {
    /// One attempt, no retry.
    async fn fetch(&self, source: DeviceIdx) -> Result<f64, LookupError>;

    /// Fetches and checks plausibility, reducing every failure to `None`.
    async fn resolve(&self, source: Option<DeviceIdx>, quantity: Quantity) -> Option<f64> {
        let source = source?;
        let checked = self.fetch(source).await.and_then(|value| {
            if quantity.is_plausible(value) {
                Ok(value)
            } else {
                Err(LookupError::Implausible {
                    quantity: quantity.name(),
                    value,
                })
            }
        });
        match checked {
            Ok(value) => {
                debug!("Device IDX {source}: {} = {value}", quantity.name());
                Some(value)
            }
            Err(e) => {
                debug!("Device IDX {source}: {e}");
                None
            }
        }
    }
}

/// Voltage for a channel: the live value when it resolves, else the static one.
pub async fn resolve_voltage<S>(values: &S, channel: &ChannelConfig) -> Option<f64>
where
    S: ValueSource + ?Sized,
{
    match values.resolve(channel.voltage_source, Quantity::Voltage).await {
        Some(voltage) => {
            debug!("Channel '{}': Using dynamic voltage {voltage}V", channel.name);
            Some(voltage)
        }
        None => channel.voltage,
    }
}

/// Power factor for a channel: the live value when it resolves, else the static one.
pub async fn resolve_power_factor<S>(values: &S, channel: &ChannelConfig) -> Option<f64>
where
    S: ValueSource + ?Sized,
{
    match values
        .resolve(channel.power_factor_source, Quantity::PowerFactor)
        .await
    {
        Some(pf) => {
            debug!("Channel '{}': Using dynamic PF {pf}", channel.name);
            Some(pf)
        }
        None => channel.power_factor,
    }
}

/// Both parameters for one channel, or `None` when either is unavailable.
pub async fn resolve_channel<S>(values: &S, channel: &ChannelConfig) -> Option<ElectricalParams>
where
    S: ValueSource + ?Sized,
{
    let voltage = resolve_voltage(values, channel).await?;
    let power_factor = resolve_power_factor(values, channel).await?;
    Some(ElectricalParams {
        voltage,
        power_factor,
    })
}

/// Queries the device endpoint of the local home-automation server.
pub struct ValueFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl ValueFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, QUERY_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn query_url(&self, source: DeviceIdx) -> String {
        format!(
            "{}/json.htm?type=command&param=getdevices&rid={}",
            self.base_url, source
        )
    }
}

#[async_trait]
impl ValueSource for ValueFetcher {
    async fn fetch(&self, source: DeviceIdx) -> Result<f64, LookupError> {
        let url = self.query_url(source);
        debug!("Fetching from URL: {url}");

        let response = self.client.get(&url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }
        let query: DeviceQuery = response.json().await.map_err(request_error)?;
        query.reading()
    }
}

fn request_error(e: reqwest::Error) -> LookupError {
    if e.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Http(e)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceQuery {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Vec<DeviceRecord>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "Voltage", default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<Value>,
    #[serde(rename = "Data", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DeviceQuery {
    /// Voltage-typed field first, then the leading number of the generic data field.
    pub fn reading(&self) -> Result<f64, LookupError> {
        if self.status != "OK" {
            return Err(LookupError::NotOk(self.status.clone()));
        }
        let record = self.result.first().ok_or(LookupError::NoResult)?;

        record
            .voltage
            .as_ref()
            .and_then(numeric)
            .or_else(|| record.data.as_ref().and_then(leading_number))
            .ok_or(LookupError::NoValue)
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn leading_number(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.split_whitespace().next()?.parse().ok(),
        other => numeric(other),
    }
}
