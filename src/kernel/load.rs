use std::sync::{Mutex, RwLock};

/// Point-in-time system load observation consumed by the adaptive
/// scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemLoad {
    /// CPU busy fraction in `[0, 1]`.
    pub cpu_utilization: f64,
    /// Memory in use as a fraction of total in `[0, 1]`.
    pub memory_utilization: f64,
    /// 1-minute load average.
    pub load_average: f64,
    /// Threads in this process.
    pub thread_count: f64,
}

pub trait LoadSampler: Send + Sync + 'static {
    fn sample(&self) -> SystemLoad;
}

/// Samples `/proc` on Linux; every field degrades to zero when a source is
/// unreadable (non-Linux targets, restricted mounts).
pub struct ProcLoadSampler {
    prev_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcLoadSampler {
    pub fn new() -> ProcLoadSampler {
        ProcLoadSampler {
            prev_cpu: Mutex::new(None),
        }
    }

    fn cpu_utilization(&self) -> f64 {
        let line = match std::fs::read_to_string("/proc/stat") {
            Ok(content) => match content.lines().next() {
                Some(l) => l.to_string(),
                None => return 0.0,
            },
            Err(_) => return 0.0,
        };
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return 0.0;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();

        let mut prev = self.prev_cpu.lock().unwrap();
        let util = match *prev {
            Some((prev_total, prev_idle)) if total > prev_total => {
                let dt = (total - prev_total) as f64;
                let di = idle.saturating_sub(prev_idle) as f64;
                ((dt - di) / dt).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };
        *prev = Some((total, idle));
        util
    }

    fn memory_utilization() -> f64 {
        let content = match std::fs::read_to_string("/proc/meminfo") {
            Ok(c) => c,
            Err(_) => return 0.0,
        };
        let field = |name: &str| -> Option<f64> {
            content
                .lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        match (field("MemTotal:"), field("MemAvailable:")) {
            (Some(total), Some(available)) if total > 0.0 => {
                ((total - available) / total).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    fn load_average() -> f64 {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|c| c.split_whitespace().next().map(str::to_string))
            .and_then(|f| f.parse().ok())
            .unwrap_or(0.0)
    }

    fn thread_count() -> f64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|c| {
                c.lines()
                    .find(|l| l.starts_with("Threads:"))
                    .and_then(|l| l.split_whitespace().nth(1).map(str::to_string))
            })
            .and_then(|f| f.parse().ok())
            .unwrap_or(0.0)
    }
}

impl Default for ProcLoadSampler {
    fn default() -> Self {
        ProcLoadSampler::new()
    }
}

impl LoadSampler for ProcLoadSampler {
    fn sample(&self) -> SystemLoad {
        SystemLoad {
            cpu_utilization: self.cpu_utilization(),
            memory_utilization: Self::memory_utilization(),
            load_average: Self::load_average(),
            thread_count: Self::thread_count(),
        }
    }
}

/// Fixed sampler for tests and benchmarks.
pub struct StaticLoadSampler {
    load: RwLock<SystemLoad>,
}

impl StaticLoadSampler {
    pub fn new(load: SystemLoad) -> StaticLoadSampler {
        StaticLoadSampler {
            load: RwLock::new(load),
        }
    }

    pub fn set(&self, load: SystemLoad) {
        *self.load.write().unwrap() = load;
    }
}

impl LoadSampler for StaticLoadSampler {
    fn sample(&self) -> SystemLoad {
        *self.load.read().unwrap()
    }
}
