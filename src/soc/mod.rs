//! Chip identification and the resolved core layout.

pub mod memory;
pub mod topology;

use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

pub use topology::{resolve_topology, ChipTopology};

/// Static facts about the host chip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChipInfo {
    pub name: String,
    pub p_cores: usize,
    pub e_cores: usize,
    /// GPU core count, when the platform reports one.
    pub gpu_cores: Option<u32>,
}

impl ChipInfo {
    pub fn total_cores(&self) -> usize {
        self.p_cores + self.e_cores
    }
}

/// Source of chip identification.
pub trait ChipIdentity {
    fn identify(&self) -> ChipInfo;
}

/// Identifies the chip through `sysctl` and `system_profiler`.
///
/// Falls back to an unnamed chip with every logical CPU counted as a P core
/// when the perf-level keys are missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysctlIdentity;

impl ChipIdentity for SysctlIdentity {
    fn identify(&self) -> ChipInfo {
        let name = run("sysctl", &["-n", "machdep.cpu.brand_string"])
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let counts = run(
            "sysctl",
            &["hw.perflevel0.logicalcpu", "hw.perflevel1.logicalcpu"],
        )
        .map(|out| parse_perf_levels(&out))
        .unwrap_or_default();

        let (p_cores, e_cores) = match counts {
            (Some(p), e) => (p, e.unwrap_or(0)),
            (None, _) => {
                let logical = std::thread::available_parallelism().map_or(1, usize::from);
                debug!(logical, "perf-level core counts unavailable, using logical CPUs");
                (logical, 0)
            }
        };

        let gpu_cores = run("system_profiler", &["-detailLevel", "basic", "SPDisplaysDataType"])
            .and_then(|out| parse_gpu_cores(&out));

        ChipInfo {
            name,
            p_cores,
            e_cores,
            gpu_cores,
        }
    }
}

/// Chip description plus the layout derived from it. Built once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Soc {
    pub info: ChipInfo,
    pub topology: ChipTopology,
}

impl Soc {
    pub fn new(info: ChipInfo) -> Self {
        let topology = resolve_topology(&info.name, info.p_cores, info.e_cores);
        Self { info, topology }
    }

    pub fn detect(identity: &dyn ChipIdentity) -> Self {
        Self::new(identity.identify())
    }
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(program, status = %out.status, "command exited unsuccessfully");
            None
        }
        Err(e) => {
            warn!(program, error = %e, "failed to run command");
            None
        }
    }
}

/// Parses `hw.perflevel0.logicalcpu: N` / `hw.perflevel1.logicalcpu: N`
/// lines into `(p, e)`.
fn parse_perf_levels(output: &str) -> (Option<usize>, Option<usize>) {
    let mut p = None;
    let mut e = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse().ok();
        match key.trim() {
            "hw.perflevel0.logicalcpu" => p = value,
            "hw.perflevel1.logicalcpu" => e = value,
            _ => {}
        }
    }

    (p, e)
}

fn parse_gpu_cores(output: &str) -> Option<u32> {
    output
        .lines()
        .find(|line| line.contains("Total Number of Cores"))
        .and_then(|line| line.split_once(':'))
        .and_then(|(_, value)| value.trim().parse().ok())
}
