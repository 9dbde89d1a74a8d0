pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dispatch::{Category, Dispatcher};
use crate::soc::memory::{MemoryMetrics, MemoryProbe};
use crate::soc::Soc;
use metrics::ExporterMetrics;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Decimal kB/s as reported by the sampler to binary MiB/s.
pub fn kbytes_to_mib(kbytes_per_sec: f64) -> f64 {
    kbytes_per_sec * 1000.0 / BYTES_PER_MIB
}

/// Pulls the latest dispatcher values into the Prometheus gauges.
pub struct MetricsExporter {
    metrics: Arc<ExporterMetrics>,
    dispatcher: Arc<Dispatcher>,
    soc: Arc<Soc>,
    memory: MemoryProbe,
    seen_overwrites: [u64; Category::ALL.len()],
}

impl MetricsExporter {
    pub fn new(metrics: Arc<ExporterMetrics>, dispatcher: Arc<Dispatcher>, soc: Arc<Soc>) -> Self {
        let info = &soc.info;
        metrics
            .system_status
            .with_label_values(&["p_cores"])
            .set(info.p_cores as f64);
        metrics
            .system_status
            .with_label_values(&["e_cores"])
            .set(info.e_cores as f64);
        metrics
            .system_status
            .with_label_values(&["g_cores"])
            .set(f64::from(info.gpu_cores.unwrap_or(0)));
        metrics
            .system_status
            .with_label_values(&["is_throttled"])
            .set(0.0);

        Self {
            metrics,
            dispatcher,
            soc,
            memory: MemoryProbe::new(),
            seen_overwrites: [0; Category::ALL.len()],
        }
    }

    /// Refreshes every gauge once.
    pub fn refresh(&mut self) {
        self.apply_dispatcher();
        let memory = self.memory.sample();
        self.apply_memory(&memory);
    }

    /// Updates gauges from whatever the dispatcher currently holds.
    /// Categories that were never published are left untouched.
    pub fn apply_dispatcher(&mut self) {
        let m = &self.metrics;

        if let Some(cpu) = self.dispatcher.cpu() {
            m.power_watts.with_label_values(&["cpu"]).set(cpu.cpu_w);
            m.power_watts.with_label_values(&["gpu"]).set(cpu.gpu_w);
            m.power_watts.with_label_values(&["ane"]).set(cpu.ane_w);
            m.power_watts
                .with_label_values(&["package"])
                .set(cpu.package_w);
            m.system_status
                .with_label_values(&["is_throttled"])
                .set(if cpu.throttled { 1.0 } else { 0.0 });
        }

        if let Some(gpu) = self.dispatcher.gpu() {
            m.gpu_usage_percent.set(gpu.active_percent);
            m.gpu_freq_mhz.set(gpu.freq_mhz);
        }

        if let Some(nd) = self.dispatcher.net_disk() {
            m.network_activity_mb
                .with_label_values(&["in"])
                .set(kbytes_to_mib(nd.in_kbytes_per_sec));
            m.network_activity_mb
                .with_label_values(&["out"])
                .set(kbytes_to_mib(nd.out_kbytes_per_sec));
            m.network_packets_per_sec
                .with_label_values(&["in"])
                .set(nd.in_packets_per_sec);
            m.network_packets_per_sec
                .with_label_values(&["out"])
                .set(nd.out_packets_per_sec);
            m.disk_activity_mb
                .with_label_values(&["read"])
                .set(kbytes_to_mib(nd.read_kbytes_per_sec));
            m.disk_activity_mb
                .with_label_values(&["write"])
                .set(kbytes_to_mib(nd.write_kbytes_per_sec));
            m.disk_iops
                .with_label_values(&["read"])
                .set(nd.read_ops_per_sec);
            m.disk_iops
                .with_label_values(&["write"])
                .set(nd.write_ops_per_sec);
        }

        if let Some(thermal) = self.dispatcher.thermal() {
            m.thermal_state.set(f64::from(thermal.state.code()));
        }

        if let Some(util) = self.dispatcher.utilization() {
            let (e_avg, p_avg) = self.soc.topology.group_averages(&util.per_core);
            m.cpu_usage_percent.set(util.total);
            m.ecore_usage_percent.set(e_avg);
            m.pcore_usage_percent.set(p_avg);

            for (i, value) in util.per_core.iter().enumerate() {
                let kind = self.soc.topology.core_type(i).unwrap_or("unknown");
                m.core_usage_percent
                    .with_label_values(&[&i.to_string(), kind])
                    .set(*value);
            }
        }

        for (i, category) in Category::ALL.iter().enumerate() {
            let total = self.dispatcher.overwrites(*category);
            let delta = total.saturating_sub(self.seen_overwrites[i]);
            if delta > 0 {
                m.mailbox_overwrites
                    .with_label_values(&[category.as_str()])
                    .inc_by(delta as f64);
                self.seen_overwrites[i] = total;
            }
        }
    }

    pub fn apply_memory(&self, memory: &MemoryMetrics) {
        let gauge = &self.metrics.memory_gb;
        gauge
            .with_label_values(&["used"])
            .set(MemoryMetrics::gib(memory.used));
        gauge
            .with_label_values(&["total"])
            .set(MemoryMetrics::gib(memory.total));
        gauge
            .with_label_values(&["swap_used"])
            .set(MemoryMetrics::gib(memory.swap_used));
        gauge
            .with_label_values(&["swap_total"])
            .set(MemoryMetrics::gib(memory.swap_total));
    }

    /// Refreshes gauges every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.refresh(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CoreUtilization;
    use crate::dispatch::Update;
    use crate::sampler::metrics::{
        CpuMetrics, GpuMetrics, NetDiskMetrics, ThermalMetrics, ThermalState,
    };
    use crate::soc::ChipInfo;

    fn exporter() -> (MetricsExporter, Arc<ExporterMetrics>, Arc<Dispatcher>) {
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        let dispatcher = Arc::new(Dispatcher::new());
        let soc = Arc::new(Soc::new(ChipInfo {
            name: "Apple M2".to_string(),
            p_cores: 2,
            e_cores: 2,
            gpu_cores: Some(10),
        }));
        (
            MetricsExporter::new(metrics.clone(), dispatcher.clone(), soc),
            metrics,
            dispatcher,
        )
    }

    #[test]
    fn test_kbytes_to_mib() {
        assert!((kbytes_to_mib(1048.576) - 1.0).abs() < 1e-9);
        assert!((kbytes_to_mib(1000.0) - 0.95367431640625).abs() < 1e-12);
        assert_eq!(kbytes_to_mib(0.0), 0.0);
    }

    #[test]
    fn test_static_system_status() {
        let (_exp, metrics, _) = exporter();
        let status = |t: &str| metrics.system_status.with_label_values(&[t]).get();
        assert_eq!(status("p_cores"), 2.0);
        assert_eq!(status("e_cores"), 2.0);
        assert_eq!(status("g_cores"), 10.0);
        assert_eq!(status("is_throttled"), 0.0);
    }

    #[test]
    fn test_apply_dispatcher_sets_gauges() {
        let (mut exp, metrics, dispatcher) = exporter();
        dispatcher.publish(Update::Cpu(CpuMetrics {
            cpu_w: 5.0,
            package_w: 7.0,
            throttled: true,
            ..Default::default()
        }));
        dispatcher.publish(Update::Gpu(GpuMetrics {
            freq_mhz: 1398.0,
            active_percent: 42.0,
            power_w: 2.0,
        }));
        dispatcher.publish(Update::NetDisk(NetDiskMetrics {
            in_kbytes_per_sec: 1048.576,
            read_ops_per_sec: 12.0,
            ..Default::default()
        }));
        dispatcher.publish(Update::Thermal(ThermalMetrics {
            state: ThermalState::Heavy,
        }));
        dispatcher.publish(Update::Utilization(CoreUtilization::new(vec![
            10.0, 30.0, 50.0, 70.0,
        ])));

        exp.apply_dispatcher();

        assert_eq!(metrics.power_watts.with_label_values(&["cpu"]).get(), 5.0);
        assert_eq!(metrics.power_watts.with_label_values(&["package"]).get(), 7.0);
        assert_eq!(
            metrics.system_status.with_label_values(&["is_throttled"]).get(),
            1.0
        );
        assert_eq!(metrics.gpu_freq_mhz.get(), 1398.0);
        assert_eq!(metrics.gpu_usage_percent.get(), 42.0);
        assert!((metrics.network_activity_mb.with_label_values(&["in"]).get() - 1.0).abs() < 1e-9);
        assert_eq!(metrics.disk_iops.with_label_values(&["read"]).get(), 12.0);
        assert_eq!(metrics.thermal_state.get(), 2.0);
        assert_eq!(metrics.cpu_usage_percent.get(), 40.0);
        assert_eq!(metrics.pcore_usage_percent.get(), 20.0);
        assert_eq!(metrics.ecore_usage_percent.get(), 60.0);
        assert_eq!(
            metrics
                .core_usage_percent
                .with_label_values(&["3", "E"])
                .get(),
            70.0
        );
    }

    #[test]
    fn test_overwrites_exported_as_deltas() {
        let (mut exp, metrics, dispatcher) = exporter();
        let publish_twice = || {
            dispatcher.publish(Update::Gpu(GpuMetrics::default()));
            dispatcher.publish(Update::Gpu(GpuMetrics::default()));
        };

        publish_twice();
        exp.apply_dispatcher();
        publish_twice();
        exp.apply_dispatcher();
        exp.apply_dispatcher();

        assert_eq!(
            metrics.mailbox_overwrites.with_label_values(&["gpu"]).get(),
            2.0
        );
    }

    #[test]
    fn test_apply_memory_in_gib() {
        let (exp, metrics, _) = exporter();
        exp.apply_memory(&MemoryMetrics {
            total: 32 * 1024 * 1024 * 1024,
            used: 8 * 1024 * 1024 * 1024,
            ..Default::default()
        });
        assert_eq!(metrics.memory_gb.with_label_values(&["total"]).get(), 32.0);
        assert_eq!(metrics.memory_gb.with_label_values(&["used"]).get(), 8.0);
    }
}
