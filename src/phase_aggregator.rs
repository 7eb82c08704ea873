use crate::config::{ChannelConfig, DeviceIdx};
use crate::error::RangeError;
use crate::value_fetcher::{ElectricalParams, Quantity, ValueSource};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Amperes per raw register count.
pub const CURRENT_MULTIPLIER: f64 = 0.01;
pub const MAX_CURRENT: f64 = 40.0;
pub const MAX_POWER: f64 = 10000.0;
/// Allowed drift between the phase sums and the grand total.
pub const SUM_TOLERANCE: f64 = 0.01;

pub fn raw_to_amperes(raw: u16) -> f64 {
    raw as f64 * CURRENT_MULTIPLIER
}

pub fn check_current(value: f64) -> Result<f64, RangeError> {
    check_bounds("current", value, MAX_CURRENT)
}

pub fn check_power(value: f64) -> Result<f64, RangeError> {
    check_bounds("power", value, MAX_POWER)
}

fn check_bounds(quantity: &'static str, value: f64, max: f64) -> Result<f64, RangeError> {
    if (0.0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(RangeError {
            quantity,
            value,
            min: 0.0,
            max,
        })
    }
}

/// Channels sharing one voltage reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub label: String,
    pub source: DeviceIdx,
    /// Channel indices in configuration order.
    pub members: Vec<usize>,
}

/// Phase grouping computed once at startup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseLayout {
    pub phases: Vec<Phase>,
    /// Channels without a voltage source; they take no part in any sum.
    pub unassigned: Vec<usize>,
}

impl PhaseLayout {
    /// Groups channels by voltage source and labels the groups L1, L2, …
    /// in ascending source order.
    pub fn from_channels(channels: &[ChannelConfig]) -> Self {
        let mut groups: BTreeMap<DeviceIdx, Vec<usize>> = BTreeMap::new();
        let mut unassigned = Vec::new();
        for (index, channel) in channels.iter().enumerate() {
            match channel.voltage_source {
                Some(source) => groups.entry(source).or_default().push(index),
                None => unassigned.push(index),
            }
        }

        let phases = groups
            .into_iter()
            .enumerate()
            .map(|(ordinal, (source, members))| Phase {
                label: format!("L{}", ordinal + 1),
                source,
                members,
            })
            .collect();

        Self { phases, unassigned }
    }

    pub fn phase_of(&self, channel: usize) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.members.contains(&channel))
    }

    pub fn log_summary(&self, channels: &[ChannelConfig]) {
        info!("Detected {} phase(s)", self.phases.len());
        for phase in &self.phases {
            let names: Vec<&str> = phase
                .members
                .iter()
                .map(|&i| channels[i].name.as_str())
                .collect();
            info!(
                "Phase {} (voltage IDX {}): {}",
                phase.label,
                phase.source,
                names.join(", ")
            );
        }
        for &index in &self.unassigned {
            warn!(
                "Channel '{}' has no voltage source and belongs to no phase; it is excluded from sums",
                channels[index].name
            );
        }
    }
}

/// Resolves the voltage and power factor shared by a whole phase.
///
/// The phase's voltage reference is fetched once; when that fails the first
/// member with a static voltage stands in. The power factor comes from the
/// first member whose live power factor resolves, else from the first member
/// with a static one.
pub async fn resolve_phase<S>(
    values: &S,
    phase: &Phase,
    channels: &[ChannelConfig],
) -> Option<ElectricalParams>
where
    S: ValueSource + ?Sized,
{
    let voltage = match values.resolve(Some(phase.source), Quantity::Voltage).await {
        Some(voltage) => Some(voltage),
        None => phase.members.iter().find_map(|&i| channels[i].voltage),
    };
    let Some(voltage) = voltage else {
        warn!("Phase {}: no usable voltage, power not computed", phase.label);
        return None;
    };

    let mut power_factor = None;
    for &index in &phase.members {
        let source = channels[index].power_factor_source;
        if let Some(pf) = values.resolve(source, Quantity::PowerFactor).await {
            debug!("Phase {}: PF from channel '{}'", phase.label, channels[index].name);
            power_factor = Some(pf);
            break;
        }
    }
    let power_factor =
        power_factor.or_else(|| phase.members.iter().find_map(|&i| channels[i].power_factor));
    let Some(power_factor) = power_factor else {
        warn!("Phase {}: no usable power factor, power not computed", phase.label);
        return None;
    };

    debug!("Phase {}: {voltage}V, PF {power_factor}", phase.label);
    Some(ElectricalParams {
        voltage,
        power_factor,
    })
}

/// Maps each channel to the parameters resolved for its phase.
pub async fn resolve_phases<S>(
    values: &S,
    layout: &PhaseLayout,
    channels: &[ChannelConfig],
) -> Vec<Option<ElectricalParams>>
where
    S: ValueSource + ?Sized,
{
    let mut per_phase = Vec::with_capacity(layout.phases.len());
    for phase in &layout.phases {
        per_phase.push(resolve_phase(values, phase, channels).await);
    }

    (0..channels.len())
        .map(|index| layout.phase_of(index).and_then(|phase| per_phase[phase]))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub current: f64,
    pub current_in_range: bool,
    /// Only present when voltage and power factor were available.
    pub power: Option<f64>,
    pub power_in_range: bool,
}

impl ChannelReading {
    pub fn published_current(&self) -> Option<f64> {
        self.current_in_range.then_some(self.current)
    }

    pub fn published_power(&self) -> Option<f64> {
        self.power.filter(|_| self.power_in_range)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReading {
    pub label: String,
    pub current_sum: f64,
    pub power_sum: f64,
}

/// Everything computed from one successful poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivedReading {
    pub channels: Vec<ChannelReading>,
    pub phases: Vec<PhaseReading>,
    pub total_power: f64,
}

/// Turns raw register values into currents, powers and sums.
///
/// `params[i]` holds the voltage / power factor for channel `i`, if any.
/// Only values inside physical bounds take part in the sums.
pub fn derive(
    channels: &[ChannelConfig],
    layout: &PhaseLayout,
    raw: &[u16],
    params: &[Option<ElectricalParams>],
) -> DerivedReading {
    let mut phases: Vec<PhaseReading> = layout
        .phases
        .iter()
        .map(|phase| PhaseReading {
            label: phase.label.clone(),
            current_sum: 0.0,
            power_sum: 0.0,
        })
        .collect();
    let mut total_power = 0.0;

    let readings: Vec<ChannelReading> = raw
        .iter()
        .zip(channels)
        .enumerate()
        .map(|(index, (&raw_current, channel))| {
            let current = raw_to_amperes(raw_current);
            let current_in_range = match check_current(current) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Channel '{}': {e}", channel.name);
                    false
                }
            };

            let power = params.get(index).copied().flatten().map(|p| {
                let power = p.power(current);
                debug!(
                    "Channel '{}': {}V × {current:.3}A × {} = {power:.1}W",
                    channel.name, p.voltage, p.power_factor
                );
                power
            });
            let power_in_range = match power.map(check_power) {
                Some(Ok(_)) => true,
                Some(Err(e)) => {
                    debug!("Channel '{}': {e}", channel.name);
                    false
                }
                None => false,
            };

            let reading = ChannelReading {
                current,
                current_in_range,
                power,
                power_in_range,
            };
            if let Some(p) = layout.phase_of(index) {
                let phase = &mut phases[p];
                if let Some(current) = reading.published_current() {
                    phase.current_sum += current;
                }
                if let Some(power) = reading.published_power() {
                    phase.power_sum += power;
                }
            }
            if let Some(power) = reading.published_power() {
                total_power += power;
            }
            reading
        })
        .collect();

    if !phases.is_empty() {
        let phase_total: f64 = phases.iter().map(|p| p.power_sum).sum();
        if (phase_total - total_power).abs() > SUM_TOLERANCE {
            warn!(
                "Phase power sums {phase_total:.2}W do not match total power {total_power:.2}W"
            );
        }
    }

    DerivedReading {
        channels: readings,
        phases,
        total_power,
    }
}
