use anyhow::Result;
use sysinfo::Networks;

use super::Family;
use crate::Metric;

/// Cumulative interface counters summed over every interface
pub struct NetworkFamily;

impl NetworkFamily {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl Family for NetworkFamily {
    fn name(&self) -> &str {
        "network"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        let networks = Networks::new_with_refreshed_list();

        let (mut bytes_sent, mut bytes_recv, mut packets_sent, mut packets_recv) = (0, 0, 0, 0);
        for data in networks.list().values() {
            bytes_sent += data.total_transmitted();
            bytes_recv += data.total_received();
            packets_sent += data.total_packets_transmitted();
            packets_recv += data.total_packets_received();
        }

        Ok(vec![
            Metric::new("network.bytes_sent", bytes_sent as f64),
            Metric::new("network.bytes_recv", bytes_recv as f64),
            Metric::new("network.packets_sent", packets_sent as f64),
            Metric::new("network.packets_recv", packets_recv as f64),
        ])
    }
}
