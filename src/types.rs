use serde::{Deserialize, Serialize};
use time::{format_description::well_known, OffsetDateTime};

/// Number of power-delivery ports exposed by the hub.
pub const PORT_COUNT: usize = 5;

/// Display names for ports 0..PORT_COUNT.
pub const PORT_NAMES: [&str; PORT_COUNT] = ["A", "C1", "C2", "C3", "C4"];

/// Rated capacity of the whole hub.
pub const MAX_POWER_WATTS: f64 = 160.0;

/// Rated capacity of a single port.
pub const MAX_PORT_WATTS: f64 = 140.0;

/// Latest known values for one port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortReading {
    pub id: usize,
    pub state: i64,
    pub protocol: i64,
    pub current_milliamps: i64,
    pub voltage_millivolts: i64,
    pub power_watts: f64,
    pub name: String,
}

impl PortReading {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: 0,
            protocol: 0,
            current_milliamps: 0,
            voltage_millivolts: 0,
            power_watts: 0.0,
            name: PORT_NAMES.get(id).copied().unwrap_or("?").to_string(),
        }
    }

    /// Recompute `power_watts` from the stored current/voltage pair.
    pub fn recompute_power(&mut self) {
        self.power_watts =
            (self.current_milliamps as f64) * (self.voltage_millivolts as f64) / 1_000_000.0;
    }
}

/// Snapshot handed to UI consumers after every poll cycle.
///
/// `ports` always holds exactly [`PORT_COUNT`] entries; only field values change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PowerModel {
    pub ports: [PortReading; PORT_COUNT],
    pub total_watts: f64,
    pub data_valid: bool,
    pub updated_at: Option<String>,
}

impl PowerModel {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(PortReading::new),
            total_watts: 0.0,
            data_valid: false,
            updated_at: None,
        }
    }

    /// Recompute per-port power and the total from the stored raw readings.
    pub fn recompute(&mut self) {
        for port in self.ports.iter_mut() {
            port.recompute_power();
        }
        self.total_watts = self.ports.iter().map(|p| p.power_watts).sum();
    }

    /// Share of [`MAX_PORT_WATTS`] drawn by one port, clamped to 0..=100.
    pub fn port_load_percent(&self, id: usize) -> u8 {
        self.ports
            .get(id)
            .map(|p| load_percent(p.power_watts, MAX_PORT_WATTS))
            .unwrap_or(0)
    }

    /// Share of [`MAX_POWER_WATTS`] drawn by the whole hub, clamped to 0..=100.
    pub fn total_load_percent(&self) -> u8 {
        load_percent(self.total_watts, MAX_POWER_WATTS)
    }
}

impl Default for PowerModel {
    fn default() -> Self {
        Self::new()
    }
}

fn load_percent(watts: f64, capacity: f64) -> u8 {
    ((watts / capacity) * 100.0).clamp(0.0, 100.0) as u8
}

/// Contiguous slice of the last IPv4 octet handled by one scan worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub start_host: u8,
    pub end_host: u8,
}

impl ScanRange {
    pub const FIRST_HOST: u8 = 1;
    pub const LAST_HOST: u8 = 254;

    /// Split 1..=254 into `workers` contiguous ranges. The last range absorbs the remainder.
    pub fn partition(workers: usize) -> Vec<ScanRange> {
        let total = (Self::LAST_HOST - Self::FIRST_HOST + 1) as usize;
        let workers = workers.clamp(1, total);
        let per = total / workers;
        (0..workers)
            .map(|i| {
                let start = i * per + Self::FIRST_HOST as usize;
                let end = if i == workers - 1 {
                    Self::LAST_HOST as usize
                } else {
                    (i + 1) * per
                };
                ScanRange {
                    start_host: start as u8,
                    end_host: end as u8,
                }
            })
            .collect()
    }

    pub fn hosts(&self) -> std::ops::RangeInclusive<u8> {
        self.start_host..=self.end_host
    }

    pub fn len(&self) -> usize {
        self.hosts().count()
    }

    pub fn is_empty(&self) -> bool {
        self.start_host > self.end_host
    }
}

/// Result of probing one candidate address during discovery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub address: String,
    pub matched: bool,
    pub timestamp: String,
}

impl ScanOutcome {
    pub fn new(address: impl Into<String>, matched: bool) -> Self {
        Self {
            address: address.into(),
            matched,
            timestamp: now_rfc3339(),
        }
    }
}

/// Aggregate of one completed scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub probed: u64,
    pub matches: Vec<String>,
    pub persisted: Option<String>,
}

/// Discovery/polling lifecycle of the telemetry poller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    #[default]
    Idle,
    Discovering,
    Polling,
}

/// Poller bookkeeping published next to the [`PowerModel`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PollerStatus {
    pub state: PollerState,
    pub address: Option<String>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_three_workers_covers_all_hosts() {
        let ranges = ScanRange::partition(3);
        assert_eq!(
            ranges,
            vec![
                ScanRange { start_host: 1, end_host: 84 },
                ScanRange { start_host: 85, end_host: 168 },
                ScanRange { start_host: 169, end_host: 254 },
            ]
        );
        let covered: usize = ranges.iter().map(ScanRange::len).sum();
        assert_eq!(covered, 254);
    }

    #[test]
    fn partition_clamps_worker_count() {
        assert_eq!(ScanRange::partition(0).len(), 1);
        assert_eq!(ScanRange::partition(1000).len(), 254);
    }

    #[test]
    fn new_model_has_named_ports() {
        let m = PowerModel::new();
        let names: Vec<&str> = m.ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, PORT_NAMES.to_vec());
        assert!(!m.data_valid);
    }

    #[test]
    fn load_percent_is_clamped() {
        let mut m = PowerModel::new();
        m.ports[1].current_milliamps = 5000;
        m.ports[1].voltage_millivolts = 48000;
        m.recompute();
        assert_eq!(m.ports[1].power_watts, 240.0);
        assert_eq!(m.port_load_percent(1), 100);
        assert_eq!(m.total_load_percent(), 100);
        assert_eq!(m.port_load_percent(99), 0);
    }
}
