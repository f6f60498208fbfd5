//! Node registration payloads and metric packets.
//!
//! The monitor owns the node's metric identity: the head node pushes a node
//! UUID through the Metric command and a counter configuration through
//! MetricConfig; until the UUID arrives no packets flow.

use gridagent_messages::{MetricCounter, MetricCountersConfig, NodeRegistrationInfo};
use std::{fs, sync::Mutex as StdMutex};
use tracing::debug;
use uuid::Uuid;

pub struct Monitor {
    node_name: String,
    network_name: String,
    node_uuid: StdMutex<Option<Uuid>>,
    counters: StdMutex<Vec<MetricCounter>>,
}

impl Monitor {
    pub fn new(node_name: impl Into<String>, network_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            network_name: network_name.into(),
            node_uuid: StdMutex::new(None),
            counters: StdMutex::new(Vec::new()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Tags subsequent metric packets with the node identity extracted from
    /// the metric callback URI.
    pub fn set_node_uuid(&self, uuid: Uuid) {
        debug!(%uuid, "node metric uuid set");
        *self.node_uuid.lock().unwrap() = Some(uuid);
    }

    pub fn node_uuid(&self) -> Option<Uuid> {
        *self.node_uuid.lock().unwrap()
    }

    pub fn apply_metric_config(&self, config: MetricCountersConfig) {
        debug!(
            counters = config.metric_counters.len(),
            "applying metric counter configuration"
        );
        *self.counters.lock().unwrap() = config.metric_counters;
    }

    /// Registration payload pushed periodically to the head node.
    pub fn registration_info(&self) -> NodeRegistrationInfo {
        NodeRegistrationInfo {
            node_name: self.node_name.clone(),
            network_name: self.network_name.clone(),
            core_count: std::thread::available_parallelism()
                .map(|cores| cores.get() as u32)
                .unwrap_or(1),
            socket_count: socket_count(),
            memory_megabytes: meminfo_kb("MemTotal").unwrap_or(0) / 1024,
            distro_info: distro_info(),
        }
    }

    /// Assembles one metric datagram, or `None` until the node UUID is known.
    ///
    /// Layout: 16-byte node UUID, u16 counter count, then per counter a
    /// (metric id u16, instance id u16, value f32) record, little-endian.
    pub fn packet(&self) -> Option<Vec<u8>> {
        let uuid = (*self.node_uuid.lock().unwrap())?;
        let counters = self.counters.lock().unwrap().clone();

        let mut packet = Vec::with_capacity(18 + counters.len() * 8);
        packet.extend_from_slice(uuid.as_bytes());
        packet.extend_from_slice(&(counters.len() as u16).to_le_bytes());
        for counter in &counters {
            packet.extend_from_slice(&counter.metric_id.to_le_bytes());
            packet.extend_from_slice(&counter.instance_id.to_le_bytes());
            packet.extend_from_slice(&sample(counter).to_le_bytes());
        }
        Some(packet)
    }
}

fn sample(counter: &MetricCounter) -> f32 {
    let path = counter.path.to_ascii_lowercase();
    if path.contains("processor") || path.contains("cpu") {
        cpu_load_percent()
    } else if path.contains("memory") {
        meminfo_kb("MemAvailable").unwrap_or(0) as f32 / 1024.0
    } else {
        0.0
    }
}

fn cpu_load_percent() -> f32 {
    let cores = std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(1) as f32;
    fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|loadavg| {
            loadavg
                .split_whitespace()
                .next()
                .and_then(|load| load.parse::<f32>().ok())
        })
        .map(|load| (load / cores * 100.0).min(100.0))
        .unwrap_or(0.0)
}

fn meminfo_kb(field: &str) -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn socket_count() -> u32 {
    let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") else {
        return 1;
    };
    let mut ids: Vec<&str> = cpuinfo
        .lines()
        .filter(|line| line.starts_with("physical id"))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    (ids.len() as u32).max(1)
}

fn distro_info() -> String {
    fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|release| {
            release
                .lines()
                .find(|line| line.starts_with("PRETTY_NAME="))
                .map(|line| {
                    line.trim_start_matches("PRETTY_NAME=")
                        .trim_matches('"')
                        .to_string()
                })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_packet_until_uuid_is_set() {
        let monitor = Monitor::new("cn-01", "Enterprise");
        assert!(monitor.packet().is_none());

        monitor.set_node_uuid(Uuid::new_v4());
        assert!(monitor.packet().is_some());
    }

    #[test]
    fn packet_layout() {
        let monitor = Monitor::new("cn-01", "Enterprise");
        let uuid = Uuid::new_v4();
        monitor.set_node_uuid(uuid);
        monitor.apply_metric_config(MetricCountersConfig {
            metric_counters: Vec::from([
                MetricCounter {
                    metric_id: 1,
                    instance_id: 0,
                    instance_name: "_Total".into(),
                    path: "\\Processor\\% Processor Time".into(),
                },
                MetricCounter {
                    metric_id: 3,
                    instance_id: 0,
                    instance_name: String::new(),
                    path: "\\Memory\\Available MBytes".into(),
                },
            ]),
        });

        let packet = monitor.packet().unwrap();
        assert_eq!(packet.len(), 16 + 2 + 2 * 8);
        assert_eq!(&packet[..16], uuid.as_bytes());
        assert_eq!(u16::from_le_bytes([packet[16], packet[17]]), 2);
        assert_eq!(u16::from_le_bytes([packet[18], packet[19]]), 1);
        assert_eq!(u16::from_le_bytes([packet[26], packet[27]]), 3);
    }

    #[test]
    fn registration_info_reflects_inventory() {
        let monitor = Monitor::new("cn-01", "Enterprise");
        let info = monitor.registration_info();
        assert_eq!(info.node_name, "cn-01");
        assert_eq!(info.network_name, "Enterprise");
        assert!(info.core_count >= 1);
        assert!(info.socket_count >= 1);
    }
}
