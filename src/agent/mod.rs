use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cpu::ticks::{platform_tick_source, TickSource};
use crate::cpu::SharedEstimator;
use crate::dispatch::{Dispatcher, Update};
use crate::export::metrics::ExporterMetrics;
use crate::export::MetricsExporter;
use crate::headless::HeadlessReporter;
use crate::sampler::stats::PipelineStats;
use crate::sampler::Sampler;
use crate::soc::{ChipIdentity, Soc, SysctlIdentity};

/// Agent orchestrates all components: sampler, estimator, exporter, headless feed.
pub struct Agent {
    cfg: Config,
    metrics: Arc<ExporterMetrics>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
    identity: Box<dyn ChipIdentity + Send>,
    ticks: Option<Box<dyn TickSource>>,
    soc: Option<Arc<Soc>>,
    failure: Arc<parking_lot::Mutex<Option<anyhow::Error>>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent using the host's chip identification and tick
    /// counters.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(
            ExporterMetrics::new(&cfg.exporter.addr).context("creating exporter metrics")?,
        );

        Ok(Self {
            cfg,
            metrics,
            dispatcher: Arc::new(Dispatcher::new()),
            stats: Arc::new(PipelineStats::new()),
            identity: Box::new(SysctlIdentity),
            ticks: Some(platform_tick_source()),
            soc: None,
            failure: Arc::new(parking_lot::Mutex::new(None)),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces chip identification.
    pub fn with_identity(mut self, identity: Box<dyn ChipIdentity + Send>) -> Self {
        self.identity = identity;
        self
    }

    /// Replaces the per-core tick source.
    pub fn with_tick_source(mut self, ticks: Box<dyn TickSource>) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn metrics(&self) -> Arc<ExporterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn soc(&self) -> Option<Arc<Soc>> {
        self.soc.as_ref().map(Arc::clone)
    }

    /// Cancelled when a component fails fatally or the headless feed has
    /// written its last snapshot.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. powermetrics needs root unless we go through sudo.
        if self.cfg.sampler.require_root && !self.cfg.sampler.sudo && !running_as_root() {
            bail!("socwatch must run as root (or set sampler.sudo: true)");
        }

        // 1. Resolve the chip layout once.
        let soc = Arc::new(Soc::detect(self.identity.as_ref()));
        info!(
            chip = %soc.info.name,
            p_cores = soc.info.p_cores,
            e_cores = soc.info.e_cores,
            gpu_cores = ?soc.info.gpu_cores,
            topology = %soc.topology.description,
            "resolved chip topology",
        );
        self.soc = Some(Arc::clone(&soc));

        // 2. Metrics server first so scrapes answer during startup.
        if self.cfg.exporter.enabled {
            self.metrics
                .start()
                .await
                .context("starting metrics server")?;
        }

        // 3. Producer.
        self.spawn_sampler();

        // 4. Per-core utilization.
        let ticks = self
            .ticks
            .take()
            .ok_or_else(|| anyhow!("agent already started"))?;
        self.spawn_cpu_estimator(ticks);

        // 5. Consumers.
        if self.cfg.exporter.enabled {
            self.spawn_exporter(Arc::clone(&soc));
        }
        if self.cfg.headless.enabled {
            self.spawn_headless(soc);
        }

        self.spawn_stats_reporter();

        info!(
            interval = ?self.cfg.sampler.interval,
            exporter = self.cfg.exporter.enabled,
            headless = self.cfg.headless.enabled,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Returns the first fatal component error, if any occurred.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for the sampler to reap its child and consumers to flush.
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "agent task join failed");
            }
        }

        let totals = self.stats.totals();
        info!(
            decoded = totals.decoded,
            decode_errors = totals.decode_errors,
            incomplete = totals.incomplete,
            "pipeline totals",
        );

        self.metrics.stop().await?;

        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records a fatal error and cancels every task.
    fn fail(
        failure: &parking_lot::Mutex<Option<anyhow::Error>>,
        cancel: &CancellationToken,
        e: anyhow::Error,
    ) {
        error!(error = %e, "fatal component error, shutting down");
        failure.lock().get_or_insert(e);
        cancel.cancel();
    }

    /// Spawn the powermetrics producer.
    fn spawn_sampler(&mut self) {
        let sampler = Sampler::new(
            self.cfg.sampler.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.stats),
            Arc::clone(&self.metrics),
        );
        let cancel = self.cancel.clone();
        let child_cancel = self.cancel.child_token();
        let failure = Arc::clone(&self.failure);

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = sampler.run(child_cancel).await {
                Agent::fail(&failure, &cancel, anyhow::Error::new(e).context("sampler"));
            }
        }));
    }

    /// Spawn background per-core utilization poller.
    fn spawn_cpu_estimator(&mut self, ticks: Box<dyn TickSource>) {
        let cancel = self.cancel.child_token();
        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = Arc::clone(&self.metrics);
        let estimator = SharedEstimator::new(ticks);
        let poll_interval = self.cfg.cpu.poll_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match estimator.utilization() {
                            Ok(util) => {
                                dispatcher.publish(Update::Utilization(util));
                            }
                            Err(e) => {
                                metrics.cpu_query_errors.inc();
                                warn!(error = %e, "per-core tick query failed");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Spawn the Prometheus gauge refresher.
    fn spawn_exporter(&mut self, soc: Arc<Soc>) {
        let exporter =
            MetricsExporter::new(Arc::clone(&self.metrics), Arc::clone(&self.dispatcher), soc);
        let interval = self.cfg.exporter.interval;
        let cancel = self.cancel.child_token();

        self.tasks.push(tokio::spawn(exporter.run(interval, cancel)));
    }

    /// Spawn the stdout JSON feed.
    fn spawn_headless(&mut self, soc: Arc<Soc>) {
        let reporter = HeadlessReporter::new(
            Arc::clone(&self.dispatcher),
            soc,
            self.cfg.headless.count,
            tokio::io::stdout(),
        );
        let interval = self.cfg.headless.interval;
        let cancel = self.cancel.child_token();
        let done = self.cancel.clone();
        let failure = Arc::clone(&self.failure);

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = reporter.run(interval, cancel, done.clone()).await {
                Agent::fail(&failure, &done, e.context("headless feed"));
            }
        }));
    }

    /// Spawn background pipeline stats reporter.
    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.child_token();
        let stats = Arc::clone(&self.stats);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let (decoded, failed) = stats.take_interval();

                        if failed > 0 {
                            warn!(decoded, failed, "pipeline stats (60s)");
                        } else if decoded > 0 {
                            info!(decoded, "pipeline stats (60s)");
                        } else {
                            debug!("no sampler records in the last 60s");
                        }
                    }
                }
            }
        }));
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
