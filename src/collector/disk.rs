use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use sysinfo::Disks;

use super::Family;
use crate::Metric;

/// Usage of the filesystem holding `path`
pub struct DiskFamily {
    path: PathBuf,
}

impl DiskFamily {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Mount point with the longest prefix match for `path`
fn mount_for<'a>(mounts: impl IntoIterator<Item = &'a Path>, path: &Path) -> Option<&'a Path> {
    mounts
        .into_iter()
        .filter(|mount| path.starts_with(mount))
        .max_by_key(|mount| mount.components().count())
}

impl Family for DiskFamily {
    fn name(&self) -> &str {
        "disk"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        let path = std::fs::canonicalize(&self.path)
            .with_context(|| format!("cannot access {}", self.path.display()))?;

        // the list is rebuilt every time so newly mounted filesystems show up
        let disks = Disks::new_with_refreshed_list();
        let mount = mount_for(disks.iter().map(|disk| disk.mount_point()), &path)
            .ok_or_else(|| anyhow!("no filesystem found for {}", path.display()))?;
        let disk = disks
            .iter()
            .find(|disk| disk.mount_point() == mount)
            .ok_or_else(|| anyhow!("filesystem for {} disappeared", path.display()))?;

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        let percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let mount = mount.to_string_lossy().to_string();

        Ok(vec![
            Metric::new("disk.total", total as f64).tag("mount", mount.clone()),
            Metric::new("disk.used", used as f64).tag("mount", mount.clone()),
            Metric::new("disk.free", free as f64).tag("mount", mount.clone()),
            Metric::new("disk.percent", percent).tag("mount", mount),
        ])
    }
}
