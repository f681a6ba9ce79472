use std::env;

use config::{Config, File};

/// Loads the runtime configuration: defaults first, then an optional TOML
/// file named by `STRATA_CONF` (default `config/strata.toml`).
///
/// Embedders that need programmatic overrides can layer on top:
///
/// ```ignore
/// let cfg = Config::builder()
///     .add_source(load_config())
///     .set_override("scheduler.adaptive.enabled", true)?
///     .build()?;
/// ```
pub fn load_config() -> Config {
    let cores = num_cpus::get().max(1) as i64;

    let builder = Config::builder()
        .set_default("debug", false)
        .unwrap()
        .set_default("mailbox.system_queue_capacity", 64)
        .unwrap()
        .set_default("mailbox.user_queue_capacity", 1024)
        .unwrap()
        .set_default("mailbox.auto_resize", true)
        .unwrap()
        .set_default("mailbox.batch_size", 32)
        .unwrap()
        .set_default("mailbox.max_batch_processing_ms", 50)
        .unwrap()
        .set_default("scheduler.concurrency.cpu_intensive", cores)
        .unwrap()
        .set_default("scheduler.concurrency.io_intensive", cores * 2)
        .unwrap()
        .set_default("scheduler.concurrency.low_latency", (cores / 2).max(2))
        .unwrap()
        .set_default("scheduler.concurrency.batch", 2)
        .unwrap()
        .set_default("scheduler.concurrency.default", cores)
        .unwrap()
        .set_default("scheduler.queue_size.cpu_intensive", 1000)
        .unwrap()
        .set_default("scheduler.queue_size.io_intensive", 1000)
        .unwrap()
        .set_default("scheduler.queue_size.low_latency", 1000)
        .unwrap()
        .set_default("scheduler.queue_size.batch", 1000)
        .unwrap()
        .set_default("scheduler.queue_size.default", 1000)
        .unwrap()
        .set_default("scheduler.adaptive.enabled", false)
        .unwrap()
        .set_default("scheduler.adaptive.interval_ms", 2000)
        .unwrap()
        .set_default("scheduler.adaptive.min_concurrency", 1)
        .unwrap()
        .set_default("scheduler.adaptive.max_concurrency", 128)
        .unwrap()
        .set_default("scheduler.adaptive.target_cpu_utilization", 0.7)
        .unwrap()
        .set_default("scheduler.adaptive.elasticity_factor", 0.5)
        .unwrap()
        .set_default("scheduler.metrics_interval_ms", 1000)
        .unwrap()
        .set_default("request.default_timeout_ms", 5000)
        .unwrap()
        .set_default("request.reap_interval_ms", 100)
        .unwrap();

    let path = env::var("STRATA_CONF").unwrap_or_else(|_| "config/strata.toml".into());
    builder
        .add_source(File::with_name(&path).required(false))
        .build()
        .unwrap()
}

/// Ask-pattern settings.
#[derive(Clone, Copy, Debug)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            timeout_ms: 5000,
            reap_interval_ms: 100,
        }
    }
}

impl<'a> From<&'a Config> for RequestConfig {
    fn from(cfg: &Config) -> Self {
        RequestConfig {
            timeout_ms: cfg.get_int("request.default_timeout_ms").unwrap() as u64,
            reap_interval_ms: cfg.get_int("request.reap_interval_ms").unwrap() as u64,
        }
    }
}
