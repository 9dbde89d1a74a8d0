//! Per-core cumulative tick counters.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by a [`TickSource`].
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse tick line {0:?}")]
    Parse(String),

    #[error("no per-core tick counters found")]
    NoCores,

    #[error("host_processor_info failed: kern_return {0}")]
    Kernel(i32),

    #[error("per-core tick counters are not available on this platform")]
    Unsupported,
}

/// Cumulative ticks for one logical core since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub nice: u64,
}

/// Something that can report cumulative ticks for every logical core.
pub trait TickSource: Send {
    fn read_per_core_ticks(&mut self) -> Result<Vec<CoreTicks>, QueryError>;
}

/// Reads `cpuN` lines from Linux `/proc/stat`.
#[derive(Debug, Clone)]
pub struct ProcStatTicks {
    path: PathBuf,
}

impl ProcStatTicks {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcStatTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for ProcStatTicks {
    fn read_per_core_ticks(&mut self) -> Result<Vec<CoreTicks>, QueryError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| QueryError::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_proc_stat(&content)
    }
}

/// Parses per-core lines of `/proc/stat`, skipping the aggregate `cpu` line.
///
/// Format: `cpuN user nice system idle [iowait irq ...]`.
pub fn parse_proc_stat(content: &str) -> Result<Vec<CoreTicks>, QueryError> {
    let mut cores = Vec::new();

    for line in content.lines() {
        let Some(rest) = line.strip_prefix("cpu") else {
            continue;
        };
        if !rest.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let fields: Vec<u64> = rest
            .split_whitespace()
            .skip(1)
            .take(4)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| QueryError::Parse(line.to_string()))?;

        let [user, nice, system, idle] = fields[..] else {
            return Err(QueryError::Parse(line.to_string()));
        };

        cores.push(CoreTicks {
            user,
            system,
            idle,
            nice,
        });
    }

    if cores.is_empty() {
        return Err(QueryError::NoCores);
    }
    Ok(cores)
}

/// Reads per-processor load counters through `host_processor_info`.
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MachTicks;

#[cfg(target_os = "macos")]
impl TickSource for MachTicks {
    #[allow(deprecated)]
    fn read_per_core_ticks(&mut self) -> Result<Vec<CoreTicks>, QueryError> {
        let mut cpu_count: libc::natural_t = 0;
        let mut info: libc::processor_info_array_t = std::ptr::null_mut();
        let mut info_count: libc::mach_msg_type_number_t = 0;

        // SAFETY: out-pointers are valid for writes; on success the kernel
        // hands back an array of `cpu_count` load-info records that we
        // release with vm_deallocate below.
        let ret = unsafe {
            libc::host_processor_info(
                libc::mach_host_self(),
                libc::PROCESSOR_CPU_LOAD_INFO,
                &mut cpu_count,
                &mut info,
                &mut info_count,
            )
        };
        if ret != libc::KERN_SUCCESS {
            return Err(QueryError::Kernel(ret));
        }

        let loads = info as *const libc::processor_cpu_load_info;
        let mut cores = Vec::with_capacity(cpu_count as usize);
        for i in 0..cpu_count as usize {
            // SAFETY: i < cpu_count, within the returned array.
            let ticks = unsafe { (*loads.add(i)).cpu_ticks };
            cores.push(CoreTicks {
                user: u64::from(ticks[libc::CPU_STATE_USER as usize]),
                system: u64::from(ticks[libc::CPU_STATE_SYSTEM as usize]),
                idle: u64::from(ticks[libc::CPU_STATE_IDLE as usize]),
                nice: u64::from(ticks[libc::CPU_STATE_NICE as usize]),
            });
        }

        // SAFETY: releases exactly the region returned above.
        unsafe {
            libc::vm_deallocate(
                libc::mach_task_self(),
                info as libc::vm_address_t,
                info_count as libc::vm_size_t * std::mem::size_of::<libc::integer_t>(),
            );
        }

        if cores.is_empty() {
            return Err(QueryError::NoCores);
        }
        Ok(cores)
    }
}

/// Always fails; used on targets with no known tick interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTicks;

impl TickSource for UnsupportedTicks {
    fn read_per_core_ticks(&mut self) -> Result<Vec<CoreTicks>, QueryError> {
        Err(QueryError::Unsupported)
    }
}

/// Tick source for the build target.
#[cfg(target_os = "macos")]
pub fn platform_tick_source() -> Box<dyn TickSource> {
    Box::new(MachTicks)
}

#[cfg(target_os = "linux")]
pub fn platform_tick_source() -> Box<dyn TickSource> {
    Box::new(ProcStatTicks::new())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn platform_tick_source() -> Box<dyn TickSource> {
    Box::new(UnsupportedTicks)
}

impl TickSource for Box<dyn TickSource> {
    fn read_per_core_ticks(&mut self) -> Result<Vec<CoreTicks>, QueryError> {
        (**self).read_per_core_ticks()
    }
}
