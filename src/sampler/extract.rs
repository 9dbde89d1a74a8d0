//! Typed metric extraction from decoded records.
//!
//! Every extractor is total: a missing or mistyped field contributes zero.

use super::metrics::{CpuMetrics, GpuMetrics, NetDiskMetrics, SocSample, ThermalMetrics, ThermalState};
use super::plist::Value;

const MILLI: f64 = 1000.0;
const KILO: f64 = 1000.0;
const MEGA: f64 = 1_000_000.0;

/// Runs every extractor against one record.
pub fn extract_sample(record: &Value) -> SocSample {
    SocSample {
        cpu: extract_cpu(record),
        gpu: extract_gpu(record),
        net_disk: extract_net_disk(record),
        thermal: extract_thermal(record),
    }
}

pub fn extract_cpu(record: &Value) -> CpuMetrics {
    let processor = record.get("processor");
    let power = |key: &str| {
        processor
            .and_then(|p| p.f64_at(&[key]))
            .map_or(0.0, |mw| mw / MILLI)
    };

    let clusters = processor
        .and_then(|p| p.get("clusters"))
        .and_then(Value::as_array)
        .unwrap_or(&[]);
    let e = cluster_stats(clusters, 'E');
    let p = cluster_stats(clusters, 'P');

    CpuMetrics {
        cpu_w: power("cpu_power"),
        gpu_w: power("gpu_power"),
        ane_w: power("ane_power"),
        package_w: power("combined_power"),
        e_cluster_active: e.active,
        p_cluster_active: p.active,
        e_cluster_freq_mhz: e.freq_mhz,
        p_cluster_freq_mhz: p.freq_mhz,
        throttled: thermal_state(record).is_throttled(),
    }
}

pub fn extract_gpu(record: &Value) -> GpuMetrics {
    let gpu = record.get("gpu");

    GpuMetrics {
        // Reported under freq_hz but already in MHz.
        freq_mhz: gpu.and_then(|g| g.f64_at(&["freq_hz"])).unwrap_or(0.0),
        active_percent: gpu
            .and_then(|g| g.f64_at(&["idle_ratio"]))
            .map_or(0.0, active_percent),
        power_w: record
            .f64_at(&["processor", "gpu_power"])
            .map_or(0.0, |mw| mw / MILLI),
    }
}

pub fn extract_net_disk(record: &Value) -> NetDiskMetrics {
    let net = |key: &str| record.f64_at(&["network", key]).unwrap_or(0.0);
    let disk = |key: &str| record.f64_at(&["disk", key]).unwrap_or(0.0);

    NetDiskMetrics {
        in_kbytes_per_sec: net("ibyte_rate") / KILO,
        out_kbytes_per_sec: net("obyte_rate") / KILO,
        in_packets_per_sec: net("ipacket_rate"),
        out_packets_per_sec: net("opacket_rate"),
        read_kbytes_per_sec: disk("rbytes_per_s") / KILO,
        write_kbytes_per_sec: disk("wbytes_per_s") / KILO,
        read_ops_per_sec: disk("rops_per_s"),
        write_ops_per_sec: disk("wops_per_s"),
    }
}

pub fn extract_thermal(record: &Value) -> ThermalMetrics {
    ThermalMetrics {
        state: thermal_state(record),
    }
}

fn thermal_state(record: &Value) -> ThermalState {
    record
        .str_at(&["thermal_pressure"])
        .map_or(ThermalState::Unknown, ThermalState::from_pressure)
}

fn active_percent(idle_ratio: f64) -> f64 {
    ((1.0 - idle_ratio) * 100.0).clamp(0.0, 100.0)
}

#[derive(Default)]
struct ClusterStats {
    active: f64,
    freq_mhz: f64,
}

/// Mean activity and peak frequency over clusters whose name starts with
/// `prefix`.
fn cluster_stats(clusters: &[Value], prefix: char) -> ClusterStats {
    let mut stats = ClusterStats::default();
    let mut matched = 0usize;

    for cluster in clusters {
        let named = cluster
            .str_at(&["name"])
            .is_some_and(|name| name.starts_with(prefix));
        if !named {
            continue;
        }

        matched += 1;
        stats.active += cluster.f64_at(&["idle_ratio"]).map_or(0.0, active_percent);
        if let Some(hz) = cluster.f64_at(&["freq_hz"]) {
            stats.freq_mhz = stats.freq_mhz.max(hz / MEGA);
        }
    }

    if matched > 0 {
        stats.active /= matched as f64;
    }
    stats
}
