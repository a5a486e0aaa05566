use anyhow::Result;
use sysinfo::System;

use super::Family;
use crate::Metric;

pub struct MemoryFamily {
    system: System,
}

impl MemoryFamily {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl Family for MemoryFamily {
    fn name(&self) -> &str {
        "memory"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(vec![
            Metric::new("memory.total", total as f64),
            Metric::new("memory.used", used as f64),
            Metric::new("memory.available", self.system.available_memory() as f64),
            Metric::new("memory.percent", percent),
            Metric::new("memory.swap_total", self.system.total_swap() as f64),
            Metric::new("memory.swap_used", self.system.used_swap() as f64),
        ])
    }
}
