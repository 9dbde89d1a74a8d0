//! powermetrics subprocess: spawn, frame, decode, extract, publish.

pub mod extract;
pub mod framer;
pub mod metrics;
pub mod plist;
pub mod stats;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SamplerConfig;
use crate::dispatch::Dispatcher;
use crate::export::metrics::ExporterMetrics;
use framer::{FramingError, PlistFramer, RawSample};
use metrics::SocSample;
use stats::{MalformedTracker, PipelineStats, MALFORMED_STREAK_LIMIT};

/// Fatal sampler failures.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sampler command line is empty")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("sampler stdout was not captured")]
    NoStdout,

    #[error("sampler exited unexpectedly ({status})")]
    Exited { status: String },

    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Decodes framed records and publishes the extracted metrics.
///
/// Holds the malformed-record streak, so one processor serves one stream.
pub struct RecordProcessor {
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
    metrics: Arc<ExporterMetrics>,
    malformed: MalformedTracker,
}

impl RecordProcessor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        stats: Arc<PipelineStats>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self {
            dispatcher,
            stats,
            metrics,
            malformed: MalformedTracker::new(),
        }
    }

    /// Handles one framed record. Returns the published sample, or `None`
    /// when the record was dropped.
    pub fn process(&mut self, raw: RawSample) -> Option<SocSample> {
        if !raw.complete {
            warn!(bytes = raw.len(), "sampler stream ended inside a record");
            self.stats.record_incomplete();
            self.metrics
                .framing_errors
                .with_label_values(&["incomplete"])
                .inc();
            self.record_malformed();
            return None;
        }

        let value = match plist::decode(raw.as_bytes()) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "dropping undecodable record");
                self.stats.record_decode_error();
                self.metrics.decode_errors.inc();
                self.record_malformed();
                return None;
            }
        };

        self.malformed.record_success();
        self.stats.record_decoded();
        self.metrics.samples_decoded.inc();

        let sample = extract::extract_sample(&value);
        self.dispatcher.publish_sample(sample.clone());
        Some(sample)
    }

    fn record_malformed(&mut self) {
        if self.malformed.record_failure() {
            warn!(
                limit = MALFORMED_STREAK_LIMIT,
                "consecutive malformed sampler records, resetting"
            );
            self.stats.record_streak_reset();
            self.metrics.malformed_streak_resets.inc();
        }
    }
}

/// Owns the powermetrics child process and the producer loop.
pub struct Sampler {
    cfg: SamplerConfig,
    processor: RecordProcessor,
}

impl Sampler {
    pub fn new(
        cfg: SamplerConfig,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<PipelineStats>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self {
            cfg,
            processor: RecordProcessor::new(dispatcher, stats, metrics),
        }
    }

    fn spawn_child(&self) -> Result<Child, SamplerError> {
        let argv = self.cfg.command_line();
        let (program, args) = argv.split_first().ok_or(SamplerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| SamplerError::Spawn {
            program: program.clone(),
            source,
        })?;

        info!(
            pid = child.id(),
            command = %argv.join(" "),
            "sampler started",
        );

        Ok(child)
    }

    /// Runs until cancelled or until the sampler fails.
    ///
    /// Cancellation is a clean exit. The child is always stopped before
    /// returning: SIGTERM first, SIGKILL after the configured grace period.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SamplerError> {
        let mut child = self.spawn_child()?;
        // Leader of its own group; the id is gone from `child` once reaped.
        let pgid = child.id();
        let stdout = child.stdout.take().ok_or(SamplerError::NoStdout)?;
        let mut frames = FramedRead::new(stdout, PlistFramer::new(self.cfg.max_buffer_bytes));

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => {
                        self.processor.process(raw);
                    }
                    Some(Err(e)) => {
                        let kind = match &e {
                            FramingError::BufferOverflow { .. } => "overflow",
                            FramingError::Io(_) => "io",
                        };
                        self.processor
                            .metrics
                            .framing_errors
                            .with_label_values(&[kind])
                            .inc();
                        break Err(SamplerError::Framing(e));
                    }
                    None => break self.await_exit(&mut child, &cancel).await,
                },
            }
        };

        terminate(&mut child, pgid, self.cfg.shutdown_grace).await;
        outcome
    }

    /// Called once stdout has closed. A child that keeps running without
    /// output is given the grace period and then reported as exited.
    async fn await_exit(
        &self,
        child: &mut Child,
        cancel: &CancellationToken,
    ) -> Result<(), SamplerError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            waited = tokio::time::timeout(self.cfg.shutdown_grace, child.wait()) => {
                let status = match waited {
                    Ok(Ok(status)) => status.to_string(),
                    Ok(Err(e)) => format!("wait failed: {e}"),
                    Err(_) => "stdout closed while still running".to_string(),
                };
                Err(SamplerError::Exited { status })
            }
        }
    }
}

/// Stops the child and everything in its process group, escalating to
/// SIGKILL after `grace`. `pgid` is the child's pid, captured at spawn.
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(%status, "sampler already exited");
        signal_group(pgid, Signal::Kill);
        return;
    }

    if !signal_group(pgid, Signal::Term) {
        signal_child(child, Signal::Term);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "sampler stopped"),
        Ok(Err(e)) => warn!(error = %e, "waiting for sampler exit"),
        Err(_) => {
            warn!(grace = ?grace, "sampler ignored SIGTERM, killing process group");
            if !signal_group(pgid, Signal::Kill) {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "killing sampler");
                }
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "reaping sampler");
            }
            return;
        }
    }

    // Descendants that outlived the leader still share its group.
    signal_group(pgid, Signal::Kill);
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Signals every process in the group. Returns false when the group no
/// longer exists or cannot be signalled.
#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal) -> bool {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return false;
    };

    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, signal.as_raw()) } == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    debug!(pgid, ?signal, error = %err, "signalling sampler process group failed");
    false
}

/// Signals the child alone. Only valid while it has not been reaped.
#[cfg(unix)]
fn signal_child(child: &Child, signal: Signal) {
    let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: as above.
    if unsafe { libc::kill(pid, signal.as_raw()) } != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, ?signal, error = %err, "signalling sampler failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: Signal) -> bool {
    false
}

#[cfg(not(unix))]
fn signal_child(_child: &Child, _signal: Signal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Category;

    const GOOD: &[u8] = b"<?xml version=\"1.0\"?><plist version=\"1.0\"><dict>\
<key>processor</key><dict><key>cpu_power</key><real>3000</real></dict>\
</dict></plist>";
    const BAD: &[u8] = b"<?xml version=\"1.0\"?><plist><dict><key>x</key></dict></plist>";

    fn processor() -> (RecordProcessor, Arc<Dispatcher>, Arc<PipelineStats>, Arc<ExporterMetrics>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let stats = Arc::new(PipelineStats::new());
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        (
            RecordProcessor::new(dispatcher.clone(), stats.clone(), metrics.clone()),
            dispatcher,
            stats,
            metrics,
        )
    }

    fn raw(bytes: &'static [u8], complete: bool) -> RawSample {
        RawSample {
            bytes: bytes::Bytes::from_static(bytes),
            complete,
        }
    }

    #[test]
    fn test_good_record_is_published() {
        let (mut p, dispatcher, stats, metrics) = processor();
        let sample = p.process(raw(GOOD, true)).expect("published");

        assert_eq!(sample.cpu.cpu_w, 3.0);
        assert_eq!(dispatcher.cpu().map(|c| c.cpu_w), Some(3.0));
        assert_eq!(stats.totals().decoded, 1);
        assert_eq!(metrics.samples_decoded.get(), 1.0);
    }

    #[test]
    fn test_bad_record_is_dropped_and_counted() {
        let (mut p, dispatcher, stats, metrics) = processor();
        assert!(p.process(raw(BAD, true)).is_none());

        assert!(dispatcher.cpu().is_none());
        assert_eq!(stats.totals().decode_errors, 1);
        assert_eq!(metrics.decode_errors.get(), 1.0);
    }

    #[test]
    fn test_incomplete_record_counts_as_framing_error() {
        let (mut p, _, stats, metrics) = processor();
        assert!(p.process(raw(GOOD, false)).is_none());

        assert_eq!(stats.totals().incomplete, 1);
        assert_eq!(
            metrics
                .framing_errors
                .with_label_values(&["incomplete"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_streak_resets_after_three_failures() {
        let (mut p, _, stats, metrics) = processor();
        p.process(raw(BAD, true));
        p.process(raw(BAD, true));
        p.process(raw(GOOD, true));
        p.process(raw(BAD, true));
        p.process(raw(BAD, true));
        assert_eq!(stats.totals().streak_resets, 0);

        p.process(raw(BAD, true));
        assert_eq!(stats.totals().streak_resets, 1);
        assert_eq!(metrics.malformed_streak_resets.get(), 1.0);
    }

    #[test]
    fn test_second_record_overwrites_unread_first() {
        let (mut p, dispatcher, _, _) = processor();
        p.process(raw(GOOD, true));
        p.process(raw(GOOD, true));
        assert_eq!(dispatcher.overwrites(Category::Cpu), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_of_replay_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("replay.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s' '{}'\n",
                std::str::from_utf8(GOOD).expect("utf8")
            ),
        )
        .expect("write");

        let cfg = SamplerConfig {
            program: "/bin/sh".to_string(),
            args: vec![script.display().to_string()],
            ..Default::default()
        };
        let dispatcher = Arc::new(Dispatcher::new());
        let stats = Arc::new(PipelineStats::new());
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        let sampler = Sampler::new(cfg, dispatcher.clone(), stats.clone(), metrics);

        let err = sampler
            .run(CancellationToken::new())
            .await
            .expect_err("script exits");
        assert!(matches!(err, SamplerError::Exited { .. }));
        assert_eq!(stats.totals().decoded, 1);
        assert_eq!(dispatcher.cpu().map(|c| c.cpu_w), Some(3.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_long_running_child() {
        let cfg = SamplerConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        };
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        let sampler = Sampler::new(
            cfg,
            Arc::new(Dispatcher::new()),
            Arc::new(PipelineStats::new()),
            metrics,
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sampler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stops in time")
            .expect("joins");
        assert!(result.is_ok());
    }

    fn shell_sampler(script: &str, grace: Duration) -> Sampler {
        let cfg = SamplerConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            shutdown_grace: grace,
            ..Default::default()
        };
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        Sampler::new(
            cfg,
            Arc::new(Dispatcher::new()),
            Arc::new(PipelineStats::new()),
            metrics,
        )
    }

    /// Running and not a zombie, per /proc.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next());
        !matches!(state, Some('Z') | Some('X') | None)
    }

    #[cfg(target_os = "linux")]
    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_group_that_ignores_sigterm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!(
            "trap '' TERM; sleep 300 & echo $! > {}; wait",
            pidfile.display()
        );
        let sampler = shell_sampler(&script, Duration::from_millis(300));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sampler.run(cancel.clone()));

        let mut grandchild = None;
        assert!(
            wait_until(|| {
                grandchild = std::fs::read_to_string(&pidfile)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                grandchild.is_some()
            })
            .await,
            "script wrote its background pid"
        );
        let grandchild = grandchild.expect("pid");
        assert!(is_running(grandchild));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stops in time")
            .expect("joins");
        assert!(result.is_ok());

        assert!(
            wait_until(|| !is_running(grandchild)).await,
            "descendant survived the process-group kill"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_closed_stdout_with_live_child_is_reported() {
        let sampler = shell_sampler("exec 1>&-; sleep 30", Duration::from_millis(300));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            sampler.run(CancellationToken::new()),
        )
        .await
        .expect("returns without cancellation")
        .expect_err("reported as exited");

        match err {
            SamplerError::Exited { status } => assert!(status.contains("still running")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_observed_after_stdout_closes() {
        let sampler = shell_sampler("exec 1>&-; sleep 30", Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sampler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stops in time")
            .expect("joins");
        assert!(result.is_ok());
    }
}
