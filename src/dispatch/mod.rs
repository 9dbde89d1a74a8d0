//! Non-blocking fan-out of the latest metrics to independent consumers.
//!
//! Each category owns a single-slot [`Mailbox`]. Producers overwrite the slot
//! and never wait; consumers read the newest value at their own cadence.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::cpu::CoreUtilization;
use crate::sampler::metrics::{CpuMetrics, GpuMetrics, NetDiskMetrics, SocSample, ThermalMetrics};

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The slot was empty or its previous value had been read.
    Stored,
    /// An unread value was replaced.
    Overwrote,
}

const READ: u8 = 0b01;
const RETIRED: u8 = 0b10;

/// One published value and whether it was read before being replaced.
struct Entry<T> {
    value: Arc<T>,
    state: AtomicU8,
}

/// Single-slot holder that keeps only the most recent value.
///
/// A value counts as overwritten only if no reader observed it before the
/// publisher retired it. Readers never return a retired value.
pub struct Mailbox<T> {
    slot: ArcSwapOption<Entry<T>>,
    overwrites: AtomicU64,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            overwrites: AtomicU64::new(0),
        }
    }

    /// Replaces the slot contents. Never blocks.
    pub fn publish(&self, value: T) -> Publish {
        let entry = Arc::new(Entry {
            value: Arc::new(value),
            state: AtomicU8::new(0),
        });

        match self.slot.swap(Some(entry)) {
            Some(prev) if prev.state.fetch_or(RETIRED, Ordering::AcqRel) & READ == 0 => {
                self.overwrites.fetch_add(1, Ordering::Relaxed);
                Publish::Overwrote
            }
            _ => Publish::Stored,
        }
    }

    /// Newest value, if any has been published. Does not consume it.
    pub fn latest(&self) -> Option<Arc<T>> {
        loop {
            let entry = self.slot.load_full()?;
            // Retired between load and mark: a newer value is in the slot.
            if entry.state.fetch_or(READ, Ordering::AcqRel) & RETIRED == 0 {
                return Some(Arc::clone(&entry.value));
            }
        }
    }

    /// Number of publishes that replaced an unread value.
    pub fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::Relaxed)
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Metric categories routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Cpu,
    Gpu,
    NetDisk,
    Thermal,
    Utilization,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Cpu,
        Category::Gpu,
        Category::NetDisk,
        Category::Thermal,
        Category::Utilization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::NetDisk => "net_disk",
            Self::Thermal => "thermal",
            Self::Utilization => "utilization",
        }
    }
}

/// A value destined for one category's mailbox.
#[derive(Debug, Clone)]
pub enum Update {
    Cpu(CpuMetrics),
    Gpu(GpuMetrics),
    NetDisk(NetDiskMetrics),
    Thermal(ThermalMetrics),
    Utilization(CoreUtilization),
}

impl Update {
    pub fn category(&self) -> Category {
        match self {
            Self::Cpu(_) => Category::Cpu,
            Self::Gpu(_) => Category::Gpu,
            Self::NetDisk(_) => Category::NetDisk,
            Self::Thermal(_) => Category::Thermal,
            Self::Utilization(_) => Category::Utilization,
        }
    }
}

/// One mailbox per [`Category`], registered up front.
#[derive(Default)]
pub struct Dispatcher {
    cpu: Mailbox<CpuMetrics>,
    gpu: Mailbox<GpuMetrics>,
    net_disk: Mailbox<NetDiskMetrics>,
    thermal: Mailbox<ThermalMetrics>,
    utilization: Mailbox<CoreUtilization>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, update: Update) -> Publish {
        match update {
            Update::Cpu(v) => self.cpu.publish(v),
            Update::Gpu(v) => self.gpu.publish(v),
            Update::NetDisk(v) => self.net_disk.publish(v),
            Update::Thermal(v) => self.thermal.publish(v),
            Update::Utilization(v) => self.utilization.publish(v),
        }
    }

    /// Publishes every category carried by one decoded record.
    pub fn publish_sample(&self, sample: SocSample) {
        self.publish(Update::Cpu(sample.cpu));
        self.publish(Update::Gpu(sample.gpu));
        self.publish(Update::NetDisk(sample.net_disk));
        self.publish(Update::Thermal(sample.thermal));
    }

    pub fn cpu(&self) -> Option<Arc<CpuMetrics>> {
        self.cpu.latest()
    }

    pub fn gpu(&self) -> Option<Arc<GpuMetrics>> {
        self.gpu.latest()
    }

    pub fn net_disk(&self) -> Option<Arc<NetDiskMetrics>> {
        self.net_disk.latest()
    }

    pub fn thermal(&self) -> Option<Arc<ThermalMetrics>> {
        self.thermal.latest()
    }

    pub fn utilization(&self) -> Option<Arc<CoreUtilization>> {
        self.utilization.latest()
    }

    pub fn overwrites(&self, category: Category) -> u64 {
        match category {
            Category::Cpu => self.cpu.overwrites(),
            Category::Gpu => self.gpu.overwrites(),
            Category::NetDisk => self.net_disk.overwrites(),
            Category::Thermal => self.thermal.overwrites(),
            Category::Utilization => self.utilization.overwrites(),
        }
    }
}
