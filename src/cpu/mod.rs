//! Per-core CPU utilization from successive tick snapshots.

pub mod ticks;

use parking_lot::Mutex;
use serde::Serialize;

use ticks::{CoreTicks, QueryError, TickSource};

/// Per-core busy percentages for one polling interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoreUtilization {
    pub per_core: Vec<f64>,
    pub total: f64,
    /// False for a baseline-only reading, whose zeros are not a measurement.
    #[serde(skip)]
    pub warm: bool,
}

impl CoreUtilization {
    pub fn new(per_core: Vec<f64>) -> Self {
        let total = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f64>() / per_core.len() as f64
        };
        Self {
            per_core,
            total,
            warm: true,
        }
    }

    fn baseline(cores: usize) -> Self {
        Self {
            warm: false,
            ..Self::new(vec![0.0; cores])
        }
    }
}

/// Turns cumulative tick counters into interval utilization.
///
/// The first reading, and any reading whose core count differs from the
/// stored one, only establishes a baseline and reports zeros.
pub struct CpuUsageEstimator<S> {
    source: S,
    previous: Option<Vec<CoreTicks>>,
}

impl<S: TickSource> CpuUsageEstimator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            previous: None,
        }
    }

    /// Utilization since the previous successful call.
    ///
    /// On a query error the stored baseline is left untouched.
    pub fn utilization(&mut self) -> Result<CoreUtilization, QueryError> {
        let current = self.source.read_per_core_ticks()?;

        let result = match &self.previous {
            Some(previous) if previous.len() == current.len() => CoreUtilization::new(
                previous
                    .iter()
                    .zip(&current)
                    .map(|(before, after)| busy_percent(before, after))
                    .collect(),
            ),
            _ => CoreUtilization::baseline(current.len()),
        };

        self.previous = Some(current);
        Ok(result)
    }

    pub fn core_count(&self) -> Option<usize> {
        self.previous.as_ref().map(Vec::len)
    }
}

fn busy_percent(before: &CoreTicks, after: &CoreTicks) -> f64 {
    let user = after.user.saturating_sub(before.user);
    let system = after.system.saturating_sub(before.system);
    let nice = after.nice.saturating_sub(before.nice);
    let idle = after.idle.saturating_sub(before.idle);

    let busy = user.saturating_add(system).saturating_add(nice);
    let total = busy.saturating_add(idle);
    if total == 0 {
        return 0.0;
    }
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Estimator shared between tasks; calls are serialized.
pub struct SharedEstimator<S> {
    inner: Mutex<CpuUsageEstimator<S>>,
}

impl<S: TickSource> SharedEstimator<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Mutex::new(CpuUsageEstimator::new(source)),
        }
    }

    pub fn utilization(&self) -> Result<CoreUtilization, QueryError> {
        self.inner.lock().utilization()
    }
}
