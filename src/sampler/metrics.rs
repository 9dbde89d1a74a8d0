use serde::Serialize;

/// Processor power and cluster activity from one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuMetrics {
    pub cpu_w: f64,
    pub gpu_w: f64,
    pub ane_w: f64,
    pub package_w: f64,
    pub e_cluster_active: f64,
    pub p_cluster_active: f64,
    pub e_cluster_freq_mhz: f64,
    pub p_cluster_freq_mhz: f64,
    pub throttled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuMetrics {
    pub freq_mhz: f64,
    pub active_percent: f64,
    pub power_w: f64,
}

/// Network and disk rates. Byte rates are decimal kilobytes per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetDiskMetrics {
    pub in_kbytes_per_sec: f64,
    pub out_kbytes_per_sec: f64,
    pub in_packets_per_sec: f64,
    pub out_packets_per_sec: f64,
    pub read_kbytes_per_sec: f64,
    pub write_kbytes_per_sec: f64,
    pub read_ops_per_sec: f64,
    pub write_ops_per_sec: f64,
}

/// Thermal pressure level reported by the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ThermalState {
    Nominal,
    Moderate,
    Heavy,
    Trapping,
    Critical,
    #[default]
    Unknown,
}

impl ThermalState {
    /// Parses the sampler's `thermal_pressure` string.
    pub fn from_pressure(s: &str) -> Self {
        match s {
            "Nominal" => Self::Nominal,
            "Moderate" => Self::Moderate,
            "Heavy" => Self::Heavy,
            "Trapping" => Self::Trapping,
            "Critical" => Self::Critical,
            _ => Self::Unknown,
        }
    }

    /// Gauge value: 0 nominal, 1 moderate, 2 heavy, 3 trapping or critical.
    /// Unknown maps to 0.
    pub fn code(self) -> u8 {
        match self {
            Self::Nominal | Self::Unknown => 0,
            Self::Moderate => 1,
            Self::Heavy => 2,
            Self::Trapping | Self::Critical => 3,
        }
    }

    /// True for every recognised state other than nominal.
    pub fn is_throttled(self) -> bool {
        !matches!(self, Self::Nominal | Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nominal => "Nominal",
            Self::Moderate => "Moderate",
            Self::Heavy => "Heavy",
            Self::Trapping => "Trapping",
            Self::Critical => "Critical",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ThermalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThermalMetrics {
    pub state: ThermalState,
}

/// Everything extracted from a single decoded record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SocSample {
    pub cpu: CpuMetrics,
    pub gpu: GpuMetrics,
    pub net_disk: NetDiskMetrics,
    pub thermal: ThermalMetrics,
}
