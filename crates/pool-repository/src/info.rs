//! Human readable status report of a repository.

use std::fmt;
use std::sync::atomic::Ordering;

use pool_config::DiskSpace;
use serde::Serialize;

use crate::account::SpaceRecord;
use crate::repository::{Lifecycle, Repository};

/// Snapshot behind the `info` admin command.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    pub lifecycle: Lifecycle,
    /// Percentage of the inventory read, meaningful while loading
    pub load_progress: u32,
    pub files: usize,
    pub space: SpaceRecord,
    /// Free bytes on the file system, if it could be queried
    pub fs_free: Option<u64>,
    pub fs_total: Option<u64>,
    pub static_max: Option<u64>,
    pub runtime_max: Option<u64>,
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn limit(value: Option<u64>) -> DiskSpace {
    value.map_or(DiskSpace::Infinite, DiskSpace::Bytes)
}

fn known(value: Option<u64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

impl fmt::Display for RepositoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lifecycle == Lifecycle::Loading {
            writeln!(f, "State : {} ({}% done)", self.lifecycle, self.load_progress)?;
        } else {
            writeln!(f, "State : {}", self.lifecycle)?;
        }
        writeln!(f, "Files : {}", self.files)?;

        let space = &self.space;
        let used = space.used();
        writeln!(f, "Disk space")?;
        writeln!(f, "    Total    : {}", space.total)?;
        writeln!(f, "    Used     : {}    [{:.2}]", used, ratio(used, space.total))?;
        writeln!(f, "    Free     : {}    Gap : {}", space.free, space.gap)?;
        writeln!(
            f,
            "    Precious : {}    [{:.2}]",
            space.precious,
            ratio(space.precious, space.total)
        )?;
        writeln!(
            f,
            "    Removable: {}    [{:.2}]",
            space.removable,
            ratio(space.removable, space.total)
        )?;

        writeln!(f, "File system")?;
        writeln!(f, "    Size : {}", known(self.fs_total))?;
        match (self.fs_free, self.fs_total) {
            (Some(free), Some(total)) => {
                writeln!(f, "    Free : {}    [{:.2}]", free, ratio(free, total))?
            }
            (free, _) => writeln!(f, "    Free : {}", known(free))?,
        }

        writeln!(f, "Limits for maximum disk space")?;
        writeln!(
            f,
            "    File system          : {}",
            known(self.fs_free.map(|free| free.saturating_add(used)))
        )?;
        writeln!(f, "    Statically configured: {}", limit(self.static_max))?;
        write!(f, "    Runtime configured   : {}", limit(self.runtime_max))
    }
}

impl Repository {
    /// Collect the status report. File system probes that fail are reported
    /// as unknown.
    pub fn info(&self) -> RepositoryInfo {
        let inner = &self.inner;
        let limits = *inner.limits.lock();
        RepositoryInfo {
            lifecycle: inner.lifecycle(),
            load_progress: inner.load_progress.load(Ordering::Relaxed),
            files: inner.records.len(),
            space: inner.space_record(),
            fs_free: inner.store.free_space().ok(),
            fs_total: inner.store.total_space().ok(),
            static_max: limits.static_max,
            runtime_max: limits.runtime_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(lifecycle: Lifecycle) -> RepositoryInfo {
        RepositoryInfo {
            lifecycle,
            load_progress: 40,
            files: 3,
            space: SpaceRecord {
                total: 1000,
                free: 600,
                precious: 100,
                removable: 200,
                gap: 250,
                lru_age: Duration::ZERO,
            },
            fs_free: Some(5000),
            fs_total: Some(10000),
            static_max: Some(1000),
            runtime_max: None,
        }
    }

    #[test]
    fn test_report_layout() {
        let text = info(Lifecycle::Open).to_string();
        assert!(text.starts_with("State : OPEN\nFiles : 3\n"));
        assert!(text.contains("    Used     : 400    [0.40]"));
        assert!(text.contains("    Free     : 600    Gap : 250"));
        assert!(text.contains("    Free : 5000    [0.50]"));
        assert!(text.contains("    File system          : 5400"));
        assert!(text.contains("    Statically configured: 1000"));
        assert!(text.ends_with("    Runtime configured   : Infinity"));
    }

    #[test]
    fn test_loading_progress_and_empty_pool() {
        let mut report = info(Lifecycle::Loading);
        report.space = SpaceRecord::default();
        report.fs_total = None;
        let text = report.to_string();
        assert!(text.starts_with("State : LOADING (40% done)"));
        assert!(text.contains("    Used     : 0    [0.00]"));
        assert!(text.contains("    Size : unknown"));
        assert!(text.contains("    Free : 5000\n"));
    }
}
