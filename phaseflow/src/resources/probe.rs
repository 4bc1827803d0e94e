//! Process resource probes.
//!
//! On Linux the default probe reads:
//!
//! - `/proc/self/status`: `VmRSS:   <kB> kB`
//! - `/proc/self/stat`: fields 14 and 15 (`utime`, `stime`) in clock ticks
//!
//! CPU usage is the tick delta between two reads over the wall-clock delta,
//! so the first read after construction reports 0%.

use parking_lot::Mutex;
use std::fs;
use std::time::Instant;
use thiserror::Error;

/// Clock ticks per second assumed for `/proc/self/stat`.
pub const CLOCK_TICKS_PER_SEC: f64 = 100.0;

const PROC_STATUS: &str = "/proc/self/status";
const PROC_STAT: &str = "/proc/self/stat";

/// Probe errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// Failed to read a probe file.
    #[error("failed to read '{file}': {source}")]
    ReadFailed {
        /// The file that failed to read.
        file: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse probe file content.
    #[error("failed to parse '{file}': {reason}")]
    ParseFailed {
        /// The file that failed to parse.
        file: String,
        /// Reason for parse failure.
        reason: String,
    },
}

/// A single memory/CPU reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceReading {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
}

/// Source of memory/CPU readings.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    /// Takes one reading.
    fn read(&self) -> Result<ResourceReading, ResourceError>;
}

/// Reads the current process's usage from `/proc`.
#[derive(Debug, Default)]
pub struct ProcResourceProbe {
    last_cpu: Mutex<Option<(Instant, u64)>>,
}

impl ProcResourceProbe {
    /// Creates a new probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceProbe for ProcResourceProbe {
    fn read(&self) -> Result<ResourceReading, ResourceError> {
        let status = read_file(PROC_STATUS)?;
        let memory_mb = parse_vm_rss_kb(&status)? as f64 / 1024.0;

        let stat = read_file(PROC_STAT)?;
        let ticks = parse_cpu_ticks(&stat)?;
        let now = Instant::now();

        let mut last = self.last_cpu.lock();
        let cpu_percent = match *last {
            Some((at, prev)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    (ticks.saturating_sub(prev) as f64 / CLOCK_TICKS_PER_SEC) / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, ticks));

        Ok(ResourceReading {
            memory_mb,
            cpu_percent,
        })
    }
}

/// Probe returning a settable reading. Useful for deterministic sizing.
#[derive(Debug, Default)]
pub struct FixedResourceProbe {
    reading: Mutex<ResourceReading>,
}

impl FixedResourceProbe {
    /// Creates a probe with the given values.
    #[must_use]
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        Self {
            reading: Mutex::new(ResourceReading {
                memory_mb,
                cpu_percent,
            }),
        }
    }

    /// Replaces the reading.
    pub fn set(&self, memory_mb: f64, cpu_percent: f64) {
        *self.reading.lock() = ResourceReading {
            memory_mb,
            cpu_percent,
        };
    }
}

impl ResourceProbe for FixedResourceProbe {
    fn read(&self) -> Result<ResourceReading, ResourceError> {
        Ok(*self.reading.lock())
    }
}

fn read_file(path: &str) -> Result<String, ResourceError> {
    fs::read_to_string(path).map_err(|source| ResourceError::ReadFailed {
        file: path.to_string(),
        source,
    })
}

fn parse_vm_rss_kb(status: &str) -> Result<u64, ResourceError> {
    let line = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .ok_or_else(|| ResourceError::ParseFailed {
            file: PROC_STATUS.to_string(),
            reason: "no VmRSS line".to_string(),
        })?;

    line.split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ResourceError::ParseFailed {
            file: PROC_STATUS.to_string(),
            reason: format!("malformed line '{line}'"),
        })
}

fn parse_cpu_ticks(stat: &str) -> Result<u64, ResourceError> {
    let parse_err = |reason: &str| ResourceError::ParseFailed {
        file: PROC_STAT.to_string(),
        reason: reason.to_string(),
    };

    // comm (field 2) may contain spaces; fields resume after the last ')'
    let rest = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or_else(|| parse_err("missing comm terminator"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // rest starts at field 3 (state); utime is 14, stime is 15
    let utime: u64 = fields
        .get(11)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_err("missing utime"))?;
    let stime: u64 = fields
        .get(12)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_err("missing stime"))?;

    Ok(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tphaseflow\nVmPeak:\t  20000 kB\nVmRSS:\t   10240 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status).unwrap(), 10240);
    }

    #[test]
    fn test_parse_vm_rss_missing() {
        assert!(parse_vm_rss_kb("Name:\tx\n").is_err());
    }

    #[test]
    fn test_parse_cpu_ticks_with_spaces_in_comm() {
        let stat = "1234 (my worker) S 1 1234 1234 0 -1 4194560 500 0 0 0 150 25 0 0 20 0 4 0 100 0 0";
        assert_eq!(parse_cpu_ticks(stat).unwrap(), 175);
    }

    #[test]
    fn test_parse_cpu_ticks_truncated() {
        assert!(parse_cpu_ticks("1 (x) S 1 2").is_err());
    }

    #[test]
    fn test_fixed_probe_set() {
        let probe = FixedResourceProbe::new(100.0, 10.0);
        assert_eq!(probe.read().unwrap().memory_mb, 100.0);

        probe.set(900.0, 95.0);
        let reading = probe.read().unwrap();
        assert_eq!(reading.memory_mb, 900.0);
        assert_eq!(reading.cpu_percent, 95.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_probe_reads_self() {
        let probe = ProcResourceProbe::new();
        let first = probe.read().unwrap();
        assert!(first.memory_mb > 0.0);
        assert_eq!(first.cpu_percent, 0.0);

        let second = probe.read().unwrap();
        assert!(second.cpu_percent >= 0.0);
    }
}
