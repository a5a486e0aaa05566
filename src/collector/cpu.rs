use anyhow::{Result, bail};
use sysinfo::System;

use super::Family;
use crate::Metric;

pub struct CpuFamily {
    system: System,
}

impl CpuFamily {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for CpuFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl Family for CpuFamily {
    fn name(&self) -> &str {
        "cpu"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        // usage is the delta since the previous refresh, so the first sample
        // after construction may read zero
        self.system.refresh_cpu_usage();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            bail!("no cpus reported");
        }

        let cpu_usage_sum = cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>();
        let average_usage = cpu_usage_sum / cpus.len() as f32;

        Ok(vec![
            Metric::new("cpu.percent", average_usage as f64),
            Metric::new("cpu.count", cpus.len() as f64),
        ])
    }
}
