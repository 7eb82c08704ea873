use crate::config::{AggregationMode, ChannelConfig, ConnectionParams};
use crate::error::LinkError;
use crate::health::ConnectionHealthMonitor;
use crate::phase_aggregator::{
    check_current, check_power, derive, resolve_phases, DerivedReading, PhaseLayout,
};
use crate::publisher::{format_value, DeviceLayout, Publisher};
use crate::register_link::RegisterLink;
use crate::value_fetcher::{resolve_channel, ElectricalParams, ValueSource};
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// First holding register carrying a channel current.
pub const CURRENT_REGISTER_START: u16 = 8;
/// Period of the host scheduler tick.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// What a single heartbeat ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Forced reconnect failed; nothing was read.
    ReconnectFailed,
    /// Registers could not be read; previously published values stand.
    ReadFailed,
    Published { updated: usize },
}

/// Polls the transducer, derives power and pushes the results to the publisher.
///
/// Every entry point takes `&mut self`, so cycles can never overlap.
pub struct PowerMonitor<L, V, P> {
    endpoint: String,
    channels: Vec<ChannelConfig>,
    mode: AggregationMode,
    phases: PhaseLayout,
    devices: DeviceLayout,
    poll_interval_ticks: u32,
    countdown: u32,
    health: ConnectionHealthMonitor,
    link: L,
    values: V,
    publisher: P,
}

impl<L, V, P> PowerMonitor<L, V, P>
where
    L: RegisterLink,
    V: ValueSource,
    P: Publisher,
{
    pub fn new(
        connection: &ConnectionParams,
        channels: Vec<ChannelConfig>,
        mode: AggregationMode,
        link: L,
        values: V,
        publisher: P,
    ) -> Self {
        let (phases, devices) = match mode {
            AggregationMode::Phase => {
                let phases = PhaseLayout::from_channels(&channels);
                let devices = DeviceLayout::new(&channels, Some(&phases));
                (phases, devices)
            }
            AggregationMode::PerChannel => {
                (PhaseLayout::default(), DeviceLayout::new(&channels, None))
            }
        };

        Self {
            endpoint: format!("{}:{}", connection.host, connection.port),
            channels,
            mode,
            phases,
            devices,
            poll_interval_ticks: connection.poll_interval_ticks.max(1),
            countdown: 1,
            health: ConnectionHealthMonitor::new(),
            link,
            values,
            publisher,
        }
    }

    pub fn phases(&self) -> &PhaseLayout {
        &self.phases
    }

    pub fn devices(&self) -> &DeviceLayout {
        &self.devices
    }

    pub fn health(&self) -> &ConnectionHealthMonitor {
        &self.health
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Registers devices, reports the configuration and opens the link.
    /// A failed connect is not fatal; the health monitor takes it from there.
    pub async fn start(&mut self) {
        info!("Loaded configuration for {} channels", self.channels.len());
        for (i, channel) in self.channels.iter().enumerate() {
            debug!("Channel {}: {channel}", i + 1);
        }
        match self.mode {
            AggregationMode::Phase => self.phases.log_summary(&self.channels),
            AggregationMode::PerChannel => info!("Power is computed per channel"),
        }

        for device in self.devices.devices() {
            if self.publisher.exists(device.unit) {
                continue;
            }
            if let Err(e) = self.publisher.create(device) {
                error!("Cannot create device '{}': {e}", device.name);
            }
        }

        match self.link.connect().await {
            Ok(()) => info!("Connected to {}", self.endpoint),
            Err(e) => {
                error!("Connection failed: {e}");
                self.health.record_failure();
            }
        }
        info!("Home power monitor started");
    }

    /// Scheduler entry point. Runs a cycle once every `poll_interval_ticks`
    /// calls and returns its outcome, or `None` when this tick was skipped.
    pub async fn on_heartbeat(&mut self) -> Option<CycleOutcome> {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.poll_interval_ticks;
        Some(self.run_cycle().await)
    }

    /// One poll. Failures end here as log entries; they never reach the scheduler.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.check_connection().await {
            return CycleOutcome::ReconnectFailed;
        }

        let raw = match self.read_channels().await {
            Ok(raw) => {
                self.health.record_success();
                raw
            }
            Err(e) => {
                self.health.record_failure();
                error!(
                    failures = self.health.consecutive_failures(),
                    "Read error: {e}"
                );
                return CycleOutcome::ReadFailed;
            }
        };

        let params = self.resolve_params().await;
        let reading = derive(&self.channels, &self.phases, &raw, &params);
        let updated = self.publish(&reading);
        CycleOutcome::Published { updated }
    }

    /// Drives `on_heartbeat` every `period` until `shutdown` completes.
    /// Each tick is awaited before the next one.
    pub async fn run_until<F>(&mut self, period: Duration, shutdown: F)
    where
        F: Future,
    {
        let mut heartbeat = time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                }
                _ = &mut shutdown => break,
            }
        }
    }

    pub async fn stop(&mut self) {
        info!("Stopping home power monitor");
        self.link.close().await;
        info!("Home power monitor stopped");
    }

    /// Rebuilds the link when the health monitor asks for it. Returns false
    /// when the reconnect failed.
    async fn check_connection(&mut self) -> bool {
        if !self.health.should_reset() {
            return true;
        }
        warn!("Resetting connection to {} due to failures", self.endpoint);
        self.link.close().await;
        self.health.reset_attempted();
        match self.link.connect().await {
            Ok(()) => {
                info!("Reconnected to {}", self.endpoint);
                true
            }
            Err(e) => {
                error!("Reconnect failed: {e}");
                false
            }
        }
    }

    async fn read_channels(&mut self) -> Result<Vec<u16>, LinkError> {
        let count = self.channels.len();
        let registers = self
            .link
            .read_block(CURRENT_REGISTER_START, count as u16)
            .await?;
        if registers.len() != count {
            return Err(LinkError::ShortRead {
                expected: count,
                actual: registers.len(),
            });
        }
        debug!("Read {count} registers: {registers:?}");
        Ok(registers)
    }

    async fn resolve_params(&self) -> Vec<Option<ElectricalParams>> {
        match self.mode {
            AggregationMode::Phase => {
                resolve_phases(&self.values, &self.phases, &self.channels).await
            }
            AggregationMode::PerChannel => {
                let mut params = Vec::with_capacity(self.channels.len());
                for channel in &self.channels {
                    params.push(resolve_channel(&self.values, channel).await);
                }
                params
            }
        }
    }

    fn publish(&mut self, reading: &DerivedReading) -> usize {
        let devices = &self.devices;
        let publisher = &mut self.publisher;
        let mut updated = 0;

        for (i, channel) in reading.channels.iter().enumerate() {
            if let Some(current) = channel.published_current() {
                updated += upsert(publisher, devices.channel_current(i), current);
            }
            if let Some(power) = channel.published_power() {
                updated += upsert(publisher, devices.channel_power(i), power);
            }
        }
        for (p, phase) in reading.phases.iter().enumerate() {
            match check_current(phase.current_sum) {
                Ok(current) => updated += upsert(publisher, devices.phase_current(p), current),
                Err(e) => warn!("Phase {}: {e}", phase.label),
            }
            match check_power(phase.power_sum) {
                Ok(power) => updated += upsert(publisher, devices.phase_power(p), power),
                Err(e) => warn!("Phase {}: {e}", phase.label),
            }
        }
        if let Some(unit) = devices.total_power() {
            if is_valid_sum(reading.total_power) {
                updated += upsert(publisher, unit, reading.total_power);
            }
        }

        debug!("Updated {updated}/{} devices", devices.devices().len());
        updated
    }
}

/// Check for the grand total, which has no physical bound of its own.
fn is_valid_sum(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn upsert<P: Publisher>(publisher: &mut P, unit: u16, value: f64) -> usize {
    let formatted = format_value(value);
    match publisher.upsert(unit, &formatted) {
        Ok(()) => {
            debug!("Device {unit}: updated to {formatted}");
            1
        }
        Err(e) => {
            warn!("Device {unit}: {e}");
            0
        }
    }
}
