//! CPU and resident-memory sampling for the worker, read from `/proc`.
//!
//! CPU percent is derived from the utime+stime delta between two samples of
//! the same pid, so the first sample after a start always reports 0.
//!
//! The host-wide figures behind `GET /api/system` come from `/proc/stat`,
//! `/proc/meminfo`, `/proc/uptime` and `statvfs`. Off Linux they read as zero.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug)]
pub struct ResourceSampler {
    clock_ticks: f64,
    previous: Option<(u32, u64, Instant)>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            clock_ticks: clock_ticks_per_second(),
            previous: None,
        }
    }

    /// Forget the baseline (the worker was restarted).
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// `None` when the process is gone or `/proc` is unavailable.
    pub fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let ticks = parse_cpu_ticks(&stat)?;
        let memory_bytes = std::fs::read_to_string(format!("/proc/{pid}/status"))
            .ok()
            .and_then(|s| parse_vm_rss_bytes(&s))
            .unwrap_or(0);

        let now = Instant::now();
        let cpu_percent = match self.previous {
            Some((prev_pid, prev_ticks, at)) if prev_pid == pid => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / self.clock_ticks;
                    (cpu_secs / elapsed * 100.0) as f32
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.previous = Some((pid, ticks, now));

        Some(ResourceSample {
            cpu_percent,
            memory_bytes,
        })
    }
}

#[cfg(unix)]
fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(not(unix))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

/// utime + stime from `/proc/<pid>/stat`. The command name may contain spaces
/// and parentheses, so fields are counted from the last `)`.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // After ")" the first field is `state` (field 3); utime is field 14.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

pub fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|v| v.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    pub fn read() -> Option<Self> {
        parse_cpu_times(&std::fs::read_to_string("/proc/stat").ok()?)
    }

    /// Busy share of the interval between `self` and a later reading.
    pub fn busy_percent_until(&self, later: &CpuTimes) -> f32 {
        let total = later.total.saturating_sub(self.total);
        if total == 0 {
            return 0.0;
        }
        let busy = later.busy.saturating_sub(self.busy);
        (busy as f64 / total as f64 * 100.0) as f32
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HostSample {
    pub cpu_count: usize,
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_available: u64,
    pub memory_percent: f32,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_percent: f32,
    pub uptime_secs: u64,
}

impl HostSample {
    /// Memory, disk and uptime read now; CPU from two `/proc/stat` readings.
    pub fn collect(cpu_before: Option<CpuTimes>, cpu_after: Option<CpuTimes>) -> Self {
        let cpu_percent = match (cpu_before, cpu_after) {
            (Some(before), Some(after)) => before.busy_percent_until(&after),
            _ => 0.0,
        };
        let (memory_total, memory_available) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or((0, 0));
        let (disk_total, disk_used) = disk_usage("/").unwrap_or((0, 0));
        let uptime_secs = std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| parse_uptime_secs(&s))
            .unwrap_or(0);

        Self {
            cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            cpu_percent,
            memory_total,
            memory_available,
            memory_percent: percent(memory_total.saturating_sub(memory_available), memory_total),
            disk_total,
            disk_used,
            disk_percent: percent(disk_used, disk_total),
            uptime_secs,
        }
    }
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0) as f32
    }
}

/// `user nice system idle iowait irq softirq steal`; idle and iowait count as idle.
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total - idle,
        total,
    })
}

/// `(MemTotal, MemAvailable)` in bytes. Older kernels lack MemAvailable, so
/// MemFree stands in.
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available))
}

pub fn parse_uptime_secs(uptime: &str) -> Option<u64> {
    let secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// `(total, used)` bytes of the filesystem holding `path`.
#[cfg(unix)]
fn disk_usage(path: &str) -> Option<(u64, u64)> {
    let c_path = std::ffi::CString::new(path).ok()?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: c_path is NUL-terminated and stat points to writable memory.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so the struct is initialized.
    let stat = unsafe { stat.assume_init() };
    let block = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block;
    let free = stat.f_bfree as u64 * block;
    Some((total, total.saturating_sub(free)))
}

#[cfg(not(unix))]
fn disk_usage(_path: &str) -> Option<(u64, u64)> {
    None
}
