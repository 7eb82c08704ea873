//! Device update sink of the home-automation store.

use crate::config::ChannelConfig;
use crate::phase_aggregator::PhaseLayout;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Current,
    Power,
}

impl DeviceKind {
    pub fn type_name(self) -> &'static str {
        match self {
            DeviceKind::Current => "Custom",
            DeviceKind::Power => "Usage",
        }
    }

    /// Host-specific device options.
    pub fn options(self) -> (&'static str, &'static str) {
        match self {
            DeviceKind::Current => ("Custom", "1;A"),
            DeviceKind::Power => ("EnergyMeterMode", "1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub unit: u16,
    pub name: String,
    pub kind: DeviceKind,
}

/// Stable device numbering.
///
/// Channel currents take units `1..=N`, channel powers `N+1..=2N`, then a
/// current/power pair per phase in label order, then the grand total.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLayout {
    channel_count: u16,
    phase_count: u16,
    has_total: bool,
    devices: Vec<DeviceDescriptor>,
}

impl DeviceLayout {
    /// `phases` is `None` when power is not aggregated into phases.
    pub fn new(channels: &[ChannelConfig], phases: Option<&PhaseLayout>) -> Self {
        let mut layout = Self {
            channel_count: channels.len() as u16,
            phase_count: phases.map_or(0, |p| p.phases.len() as u16),
            has_total: phases.is_some(),
            devices: Vec::new(),
        };

        let mut devices = Vec::new();
        for (i, channel) in channels.iter().enumerate() {
            devices.push(DeviceDescriptor {
                unit: layout.channel_current(i),
                name: format!("{} Current", channel.name),
                kind: DeviceKind::Current,
            });
        }
        for (i, channel) in channels.iter().enumerate() {
            devices.push(DeviceDescriptor {
                unit: layout.channel_power(i),
                name: format!("{} Power", channel.name),
                kind: DeviceKind::Power,
            });
        }
        for (p, phase) in phases.into_iter().flat_map(|l| l.phases.iter()).enumerate() {
            devices.push(DeviceDescriptor {
                unit: layout.phase_current(p),
                name: format!("{} Current", phase.label),
                kind: DeviceKind::Current,
            });
            devices.push(DeviceDescriptor {
                unit: layout.phase_power(p),
                name: format!("{} Power", phase.label),
                kind: DeviceKind::Power,
            });
        }
        if let Some(unit) = layout.total_power() {
            devices.push(DeviceDescriptor {
                unit,
                name: "Total Power".to_string(),
                kind: DeviceKind::Power,
            });
        }

        layout.devices = devices;
        layout
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn channel_current(&self, channel: usize) -> u16 {
        channel as u16 + 1
    }

    pub fn channel_power(&self, channel: usize) -> u16 {
        self.channel_count + channel as u16 + 1
    }

    pub fn phase_current(&self, phase: usize) -> u16 {
        2 * self.channel_count + 2 * phase as u16 + 1
    }

    pub fn phase_power(&self, phase: usize) -> u16 {
        2 * self.channel_count + 2 * phase as u16 + 2
    }

    pub fn total_power(&self) -> Option<u16> {
        self.has_total
            .then(|| 2 * self.channel_count + 2 * self.phase_count + 1)
    }
}

/// Two decimals, as the store displays them.
pub fn format_value(value: f64) -> String {
    format!("{value:.2}")
}

/// Where computed values leave the pipeline.
pub trait Publisher: Send {
    fn exists(&self, unit: u16) -> bool;

    fn create(&mut self, device: &DeviceDescriptor) -> anyhow::Result<()>;

    fn upsert(&mut self, unit: u16, value: &str) -> anyhow::Result<()>;
}

/// Keeps the device table in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    devices: BTreeMap<u16, DeviceDescriptor>,
    values: BTreeMap<u16, String>,
    update_count: usize,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, unit: u16) -> Option<&DeviceDescriptor> {
        self.devices.get(&unit)
    }

    pub fn value(&self, unit: u16) -> Option<&str> {
        self.values.get(&unit).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<u16, String> {
        &self.values
    }

    /// Total number of successful upserts so far.
    pub fn update_count(&self) -> usize {
        self.update_count
    }
}

impl Publisher for MemoryPublisher {
    fn exists(&self, unit: u16) -> bool {
        self.devices.contains_key(&unit)
    }

    fn create(&mut self, device: &DeviceDescriptor) -> anyhow::Result<()> {
        if self.devices.contains_key(&device.unit) {
            anyhow::bail!("Device unit {} already exists", device.unit);
        }
        self.devices.insert(device.unit, device.clone());
        Ok(())
    }

    fn upsert(&mut self, unit: u16, value: &str) -> anyhow::Result<()> {
        if !self.devices.contains_key(&unit) {
            anyhow::bail!("Unknown device unit {unit}");
        }
        self.values.insert(unit, value.to_string());
        self.update_count += 1;
        Ok(())
    }
}

/// Emits every update as a structured log line.
#[derive(Debug, Default)]
pub struct LogPublisher {
    names: HashMap<u16, String>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Publisher for LogPublisher {
    fn exists(&self, unit: u16) -> bool {
        self.names.contains_key(&unit)
    }

    fn create(&mut self, device: &DeviceDescriptor) -> anyhow::Result<()> {
        let (option, option_value) = device.kind.options();
        info!(
            unit = device.unit,
            kind = device.kind.type_name(),
            "Created device '{}' ({option}={option_value})",
            device.name
        );
        self.names.insert(device.unit, device.name.clone());
        Ok(())
    }

    fn upsert(&mut self, unit: u16, value: &str) -> anyhow::Result<()> {
        let Some(name) = self.names.get(&unit) else {
            anyhow::bail!("Unknown device unit {unit}");
        };
        info!(unit, "{name}: {value}");
        Ok(())
    }
}
