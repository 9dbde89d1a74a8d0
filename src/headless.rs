//! Periodic JSON snapshots on stdout.
//!
//! With a count the output is one JSON array of exactly that many objects;
//! otherwise one object per line until shutdown. Ticks that arrive before
//! the utilization estimator has a baseline are skipped, up to
//! [`WARMUP_TICK_LIMIT`] of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::sampler::metrics::{CpuMetrics, GpuMetrics, NetDiskMetrics, ThermalState};
use crate::soc::memory::{MemoryMetrics, MemoryProbe};
use crate::soc::{ChipInfo, ChipTopology, Soc};

/// Ticks skipped while waiting for a warm utilization reading. After this
/// many, snapshots are written with whatever is available.
pub const WARMUP_TICK_LIMIT: u32 = 3;

/// Per-record SoC metrics as last published.
#[derive(Debug, Clone, Serialize)]
pub struct SocSnapshot {
    pub cpu: CpuMetrics,
    pub gpu: GpuMetrics,
}

/// One JSON object of the feed.
#[derive(Debug, Clone, Serialize)]
pub struct HeadlessSnapshot {
    pub timestamp: String,
    pub soc: SocSnapshot,
    pub memory: MemoryMetrics,
    pub net_disk: NetDiskMetrics,
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub core_usages: Vec<f64>,
    pub ecore_usage: f64,
    pub pcore_usage: f64,
    pub system_info: ChipInfo,
    pub topology: ChipTopology,
    pub thermal_state: ThermalState,
}

/// Writes snapshots built from the dispatcher's latest values.
pub struct HeadlessReporter<W> {
    dispatcher: Arc<Dispatcher>,
    soc: Arc<Soc>,
    memory: MemoryProbe,
    count: u64,
    emitted: u64,
    warmup_skips: u32,
    out: W,
}

impl<W: AsyncWrite + Unpin> HeadlessReporter<W> {
    pub fn new(dispatcher: Arc<Dispatcher>, soc: Arc<Soc>, count: u64, out: W) -> Self {
        Self {
            dispatcher,
            soc,
            memory: MemoryProbe::new(),
            count,
            emitted: 0,
            warmup_skips: 0,
            out,
        }
    }

    /// Builds a snapshot; categories never published read as zero.
    pub fn snapshot(&self, memory: MemoryMetrics) -> HeadlessSnapshot {
        let cpu = self.dispatcher.cpu().map(|v| (*v).clone()).unwrap_or_default();
        let gpu = self.dispatcher.gpu().map(|v| (*v).clone()).unwrap_or_default();
        let net_disk = self
            .dispatcher
            .net_disk()
            .map(|v| (*v).clone())
            .unwrap_or_default();
        let thermal_state = self
            .dispatcher
            .thermal()
            .map_or(ThermalState::Unknown, |t| t.state);
        let util = self
            .dispatcher
            .utilization()
            .map(|v| (*v).clone())
            .unwrap_or_default();
        let (ecore_usage, pcore_usage) = self.soc.topology.group_averages(&util.per_core);

        HeadlessSnapshot {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            gpu_usage: gpu.active_percent,
            soc: SocSnapshot { cpu, gpu },
            memory,
            net_disk,
            cpu_usage: util.total,
            core_usages: util.per_core,
            ecore_usage,
            pcore_usage,
            system_info: self.soc.info.clone(),
            topology: self.soc.topology.clone(),
            thermal_state,
        }
    }

    /// Whether the configured number of snapshots has been written.
    pub fn is_done(&self) -> bool {
        self.count > 0 && self.emitted >= self.count
    }

    /// Whether the estimator has published a measured (non-baseline)
    /// reading, or the warm-up allowance is used up.
    fn utilization_ready(&mut self) -> bool {
        if self.dispatcher.utilization().is_some_and(|u| u.warm) {
            return true;
        }
        if self.warmup_skips >= WARMUP_TICK_LIMIT {
            return true;
        }
        self.warmup_skips += 1;
        debug!(skipped = self.warmup_skips, "utilization not warm, skipping snapshot");
        false
    }

    /// Writes one snapshot, with array punctuation in counted mode.
    pub async fn emit(&mut self, snapshot: &HeadlessSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("encoding snapshot")?;

        let mut text = String::with_capacity(json.len() + 4);
        if self.count > 0 {
            text.push(if self.emitted == 0 { '[' } else { ',' });
        }
        text.push_str(&json);
        text.push('\n');
        self.emitted += 1;

        if self.is_done() {
            text.push_str("]\n");
        }
        self.write(&text).await
    }

    /// Closes a counted array cut short by shutdown so the output stays
    /// valid JSON.
    pub async fn finish(&mut self) -> Result<()> {
        if self.count > 0 && !self.is_done() {
            let mut text = String::new();
            if self.emitted == 0 {
                text.push('[');
            }
            text.push_str("]\n");
            self.write(&text).await?;
        }
        Ok(())
    }

    async fn write(&mut self, text: &str) -> Result<()> {
        self.out
            .write_all(text.as_bytes())
            .await
            .context("writing snapshot")?;
        self.out.flush().await.context("flushing snapshot")
    }

    async fn tick(&mut self) -> Result<()> {
        if !self.utilization_ready() {
            return Ok(());
        }
        let memory = self.memory.sample();
        let snapshot = self.snapshot(memory);
        self.emit(&snapshot).await
    }

    /// Emits a snapshot every `interval`. In counted mode, `done` is
    /// cancelled after the last one.
    pub async fn run(
        mut self,
        interval: Duration,
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> Result<()> {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return self.finish().await,
                _ = ticker.tick() => {
                    self.tick().await?;
                    if self.is_done() {
                        info!(count = self.count, "headless snapshot count reached");
                        done.cancel();
                        return Ok(());
                    }
                }
            }
        }
    }
}
