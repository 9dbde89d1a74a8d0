use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sampler::framer::DEFAULT_MAX_BUFFER_BYTES;

/// Sampler names powermetrics accepts for `--samplers`.
pub const KNOWN_SAMPLERS: &[&str] = &[
    "tasks",
    "battery",
    "network",
    "disk",
    "interrupts",
    "cpu_power",
    "thermal",
    "sfi",
    "gpu_power",
    "ane_power",
    "gpu_agpm_stats",
    "smc",
];

/// Smallest accepted sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Smallest accepted framing buffer cap.
pub const MIN_BUFFER_BYTES: usize = 64 * 1024;

/// Top-level configuration for socwatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// powermetrics subprocess configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Per-core utilization polling.
    #[serde(default)]
    pub cpu: CpuConfig,

    /// Prometheus exporter configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// JSON snapshot feed on stdout.
    #[serde(default)]
    pub headless: HeadlessConfig,
}

/// powermetrics subprocess configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Sampler binary. Default: "powermetrics".
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra arguments inserted before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,

    /// Samplers passed to `--samplers`.
    #[serde(default = "default_samplers")]
    pub samplers: Vec<String>,

    /// Sampling interval. Default: 1s.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Run the sampler through `sudo`. Default: false.
    #[serde(default)]
    pub sudo: bool,

    /// Refuse to start unless running as root (ignored with `sudo`).
    /// Default: true.
    #[serde(default = "default_true")]
    pub require_root: bool,

    /// Framing buffer cap in bytes. Default: 10 MiB.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Time between SIGTERM and SIGKILL on shutdown. Default: 2s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Per-core utilization polling.
#[derive(Debug, Clone, Deserialize)]
pub struct CpuConfig {
    /// How often tick counters are read. Default: 1s.
    #[serde(default = "default_cpu_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Serve `/metrics`. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address; ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_exporter_addr")]
    pub addr: String,

    /// How often gauges are refreshed from the dispatcher. Default: 1s.
    #[serde(default = "default_exporter_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// JSON snapshot feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadlessConfig {
    /// Emit JSON snapshots on stdout. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Snapshot cadence. Default: 1s.
    #[serde(default = "default_headless_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Stop after this many snapshots; 0 runs until shutdown.
    #[serde(default)]
    pub count: u64,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub interval_ms: Option<u64>,
    pub prometheus: Option<String>,
    pub headless: bool,
    pub count: Option<u64>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_program() -> String {
    "powermetrics".to_string()
}

fn default_samplers() -> Vec<String> {
    ["cpu_power", "gpu_power", "thermal", "network", "disk"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_true() -> bool {
    true
}

fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_cpu_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_exporter_addr() -> String {
    ":9090".to_string()
}

fn default_exporter_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_headless_interval() -> Duration {
    Duration::from_secs(1)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sampler: SamplerConfig::default(),
            cpu: CpuConfig::default(),
            exporter: ExporterConfig::default(),
            headless: HeadlessConfig::default(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            samplers: default_samplers(),
            interval: default_sample_interval(),
            sudo: false,
            require_root: true,
            max_buffer_bytes: default_max_buffer_bytes(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_cpu_poll_interval(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_exporter_addr(),
            interval: default_exporter_interval(),
        }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_headless_interval(),
            count: 0,
        }
    }
}

impl SamplerConfig {
    /// Full command line: program followed by its arguments, with `sudo`
    /// prepended when configured.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 10);
        if self.sudo {
            argv.push("sudo".to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv.extend([
            "--samplers".to_string(),
            self.samplers.join(","),
            "--show-initial-usage".to_string(),
            "-f".to_string(),
            "plist".to_string(),
            "-i".to_string(),
            self.interval.as_millis().to_string(),
        ]);
        argv
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Loads the file when given, otherwise starts from defaults, then
    /// applies command-line overrides and validates the result.
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        cfg.apply(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies command-line overrides.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(level) = &overrides.log_level {
            self.log_level = level.clone();
        }
        if let Some(ms) = overrides.interval_ms {
            let interval = Duration::from_millis(ms);
            self.sampler.interval = interval;
            self.cpu.poll_interval = interval;
            self.exporter.interval = interval;
            self.headless.interval = interval;
        }
        if let Some(addr) = &overrides.prometheus {
            self.exporter.enabled = true;
            self.exporter.addr = normalize_addr(addr);
        }
        if overrides.headless {
            self.headless.enabled = true;
            // Headless alone replaces the exporter unless an address was given.
            if overrides.prometheus.is_none() {
                self.exporter.enabled = false;
            }
        }
        if let Some(count) = overrides.count {
            self.headless.count = count;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sampler.program.is_empty() {
            bail!("sampler.program is required");
        }

        if self.sampler.samplers.is_empty() {
            bail!("sampler.samplers must name at least one sampler");
        }

        for name in &self.sampler.samplers {
            if !KNOWN_SAMPLERS.contains(&name.as_str()) {
                bail!(
                    "unknown sampler {name:?}, expected one of: {}",
                    KNOWN_SAMPLERS.join(", ")
                );
            }
        }

        if self.sampler.interval < MIN_SAMPLE_INTERVAL {
            bail!(
                "sampler.interval {:?} is below the minimum of {:?}",
                self.sampler.interval,
                MIN_SAMPLE_INTERVAL
            );
        }

        if self.sampler.max_buffer_bytes < MIN_BUFFER_BYTES {
            bail!(
                "sampler.max_buffer_bytes must be at least {MIN_BUFFER_BYTES}, got {}",
                self.sampler.max_buffer_bytes
            );
        }

        if self.sampler.shutdown_grace.is_zero() {
            bail!("sampler.shutdown_grace must be positive");
        }

        if self.cpu.poll_interval.is_zero() {
            bail!("cpu.poll_interval must be positive");
        }

        if !self.exporter.enabled && !self.headless.enabled {
            bail!("at least one of exporter.enabled or headless.enabled must be true");
        }

        if self.exporter.enabled {
            if self.exporter.addr.is_empty() {
                bail!("exporter.addr is required when the exporter is enabled");
            }
            if self.exporter.interval.is_zero() {
                bail!("exporter.interval must be positive");
            }
        }

        if self.headless.enabled && self.headless.interval.is_zero() {
            bail!("headless.interval must be positive");
        }

        Ok(())
    }
}

/// Accepts "9090", ":9090" or "host:9090".
fn normalize_addr(addr: &str) -> String {
    if !addr.is_empty() && addr.chars().all(|c| c.is_ascii_digit()) {
        format!(":{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.sampler.program, "powermetrics");
        assert_eq!(cfg.sampler.interval, Duration::from_secs(1));
        assert_eq!(cfg.sampler.max_buffer_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.sampler.shutdown_grace, Duration::from_secs(2));
        assert_eq!(cfg.exporter.addr, ":9090");
        assert!(cfg.exporter.enabled);
        assert!(!cfg.headless.enabled);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_command_line() {
        let cfg = SamplerConfig {
            interval: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(
            cfg.command_line(),
            vec![
                "powermetrics",
                "--samplers",
                "cpu_power,gpu_power,thermal,network,disk",
                "--show-initial-usage",
                "-f",
                "plist",
                "-i",
                "250",
            ]
        );
    }

    #[test]
    fn test_command_line_with_sudo() {
        let cfg = SamplerConfig {
            sudo: true,
            ..Default::default()
        };
        let argv = cfg.command_line();
        assert_eq!(argv[0], "sudo");
        assert_eq!(argv[1], "powermetrics");
    }

    #[test]
    fn test_load_yaml_with_humantime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("socwatch.yaml");
        std::fs::write(
            &path,
            "log_level: debug\n\
             sampler:\n  interval: 500ms\n  samplers: [cpu_power, thermal]\n  shutdown_grace: 5s\n\
             exporter:\n  addr: \"127.0.0.1:9999\"\n",
        )
        .expect("write");

        let cfg = Config::load(&path).expect("loads");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.sampler.interval, Duration::from_millis(500));
        assert_eq!(cfg.sampler.samplers, vec!["cpu_power", "thermal"]);
        assert_eq!(cfg.sampler.shutdown_grace, Duration::from_secs(5));
        assert_eq!(cfg.exporter.addr, "127.0.0.1:9999");
        assert_eq!(cfg.cpu.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/socwatch.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut cfg = Config::default();
        cfg.apply(&Overrides {
            interval_ms: Some(200),
            prometheus: Some("9100".to_string()),
            count: Some(3),
            ..Default::default()
        });

        assert_eq!(cfg.sampler.interval, Duration::from_millis(200));
        assert_eq!(cfg.headless.interval, Duration::from_millis(200));
        assert_eq!(cfg.exporter.addr, ":9100");
        assert_eq!(cfg.headless.count, 3);
    }

    #[test]
    fn test_headless_flag_disables_exporter_without_address() {
        let mut cfg = Config::default();
        cfg.apply(&Overrides {
            headless: true,
            ..Default::default()
        });
        assert!(cfg.headless.enabled);
        assert!(!cfg.exporter.enabled);
        cfg.validate().expect("headless only is valid");
    }

    #[test]
    fn test_headless_flag_with_address_keeps_exporter() {
        let mut cfg = Config::default();
        cfg.apply(&Overrides {
            headless: true,
            prometheus: Some(":9200".to_string()),
            ..Default::default()
        });
        assert!(cfg.headless.enabled);
        assert!(cfg.exporter.enabled);
    }

    #[test]
    fn test_validation_empty_samplers() {
        let mut cfg = Config::default();
        cfg.sampler.samplers.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one sampler"));
    }

    #[test]
    fn test_validation_unknown_sampler() {
        let mut cfg = Config::default();
        cfg.sampler.samplers.push("warp_drive".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown sampler"));
    }

    #[test]
    fn test_validation_interval_too_small() {
        let mut cfg = Config::default();
        cfg.sampler.interval = Duration::from_millis(50);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_validation_buffer_too_small() {
        let mut cfg = Config::default();
        cfg.sampler.max_buffer_bytes = 1024;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_buffer_bytes"));
    }

    #[test]
    fn test_validation_zero_grace() {
        let mut cfg = Config::default();
        cfg.sampler.shutdown_grace = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("shutdown_grace"));
    }

    #[test]
    fn test_validation_requires_a_consumer() {
        let mut cfg = Config::default();
        cfg.exporter.enabled = false;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one of"));
    }

    #[test]
    fn test_validation_exporter_addr_required() {
        let mut cfg = Config::default();
        cfg.exporter.addr.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exporter.addr"));
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("9090"), ":9090");
        assert_eq!(normalize_addr(":9090"), ":9090");
        assert_eq!(normalize_addr("0.0.0.0:80"), "0.0.0.0:80");
    }
}
