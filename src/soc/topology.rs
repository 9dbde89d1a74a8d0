//! Mapping of flat per-core arrays onto performance and efficiency groups.

use serde::Serialize;

/// Which cores in a per-core array are performance (P) and which are
/// efficiency (E) cores. The two lists partition `0..total`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChipTopology {
    pub p_core_indices: Vec<usize>,
    pub e_core_indices: Vec<usize>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreKind {
    Performance,
    Efficiency,
}

use CoreKind::{Efficiency, Performance};

impl ChipTopology {
    /// Lays out consecutive blocks of cores in order.
    fn from_blocks(description: &str, blocks: &[(CoreKind, usize)]) -> Self {
        let mut topology = Self {
            description: description.to_string(),
            ..Default::default()
        };

        let mut next = 0;
        for &(kind, len) in blocks {
            let target = match kind {
                Performance => &mut topology.p_core_indices,
                Efficiency => &mut topology.e_core_indices,
            };
            target.extend(next..next + len);
            next += len;
        }
        topology
    }

    pub fn total_cores(&self) -> usize {
        self.p_core_indices.len() + self.e_core_indices.len()
    }

    /// Mean E-core and P-core values of a per-core array as `(e, p)`.
    ///
    /// Indices beyond the array are ignored; a group with no usable index
    /// averages to 0.
    pub fn group_averages(&self, per_core: &[f64]) -> (f64, f64) {
        (
            mean_at(per_core, &self.e_core_indices),
            mean_at(per_core, &self.p_core_indices),
        )
    }

    /// Core type label for index `i`, as used by the per-core gauge.
    pub fn core_type(&self, i: usize) -> Option<&'static str> {
        if self.p_core_indices.contains(&i) {
            Some("P")
        } else if self.e_core_indices.contains(&i) {
            Some("E")
        } else {
            None
        }
    }
}

fn mean_at(values: &[f64], indices: &[usize]) -> f64 {
    let (sum, n) = indices
        .iter()
        .filter_map(|&i| values.get(i))
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Resolves the core layout for a chip name and its core counts.
///
/// Unrecognised names fall back to all P cores followed by all E cores.
pub fn resolve_topology(name: &str, p_cores: usize, e_cores: usize) -> ChipTopology {
    if name.contains("M3 Ultra") && p_cores == 24 && e_cores == 8 {
        return ChipTopology::from_blocks(
            "M3 Ultra 32-core: E-cores first within each die",
            &[(Efficiency, 4), (Performance, 12), (Efficiency, 4), (Performance, 12)],
        );
    }

    if name.contains("M3 Ultra") && p_cores == 20 && e_cores == 8 {
        return ChipTopology::from_blocks(
            "M3 Ultra 28-core: E-cores first within each die",
            &[(Efficiency, 4), (Performance, 10), (Efficiency, 4), (Performance, 10)],
        );
    }

    if name.contains("M4 Pro") {
        return ChipTopology::from_blocks(
            "M4 Pro: E-cores first, then P-cores",
            &[(Efficiency, e_cores), (Performance, p_cores)],
        );
    }

    if name.contains("M1 Ultra") || name.contains("M2 Ultra") {
        // Die 1 takes the larger half of each class.
        let (p1, e1) = (p_cores.div_ceil(2), e_cores.div_ceil(2));
        return ChipTopology::from_blocks(
            "M1/M2 Ultra: P-cores first within each die",
            &[
                (Performance, p1),
                (Efficiency, e1),
                (Performance, p_cores - p1),
                (Efficiency, e_cores - e1),
            ],
        );
    }

    ChipTopology::from_blocks(
        "Default: P-cores first, then E-cores",
        &[(Performance, p_cores), (Efficiency, e_cores)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(t: &ChipTopology, p: usize, e: usize) {
        assert_eq!(t.p_core_indices.len(), p, "{}", t.description);
        assert_eq!(t.e_core_indices.len(), e, "{}", t.description);

        let mut all: Vec<usize> = t
            .p_core_indices
            .iter()
            .chain(&t.e_core_indices)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..p + e).collect::<Vec<_>>(), "{}", t.description);
    }

    #[test]
    fn test_m3_ultra_32_core() {
        let t = resolve_topology("Apple M3 Ultra", 24, 8);
        assert_partition(&t, 24, 8);
        assert_eq!(t.e_core_indices, vec![0, 1, 2, 3, 16, 17, 18, 19]);
        assert_eq!(t.p_core_indices[..2], [4, 5]);
        assert_eq!(t.p_core_indices[12], 20);
    }

    #[test]
    fn test_m3_ultra_28_core() {
        let t = resolve_topology("Apple M3 Ultra", 20, 8);
        assert_partition(&t, 20, 8);
        assert_eq!(t.e_core_indices, vec![0, 1, 2, 3, 14, 15, 16, 17]);
        assert_eq!(t.p_core_indices.last(), Some(&27));
    }

    #[test]
    fn test_m3_ultra_other_counts_use_default() {
        let t = resolve_topology("Apple M3 Ultra", 16, 8);
        assert_partition(&t, 16, 8);
        assert_eq!(t.p_core_indices, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_m4_pro_efficiency_first() {
        let t = resolve_topology("Apple M4 Pro", 10, 4);
        assert_partition(&t, 10, 4);
        assert_eq!(t.e_core_indices, vec![0, 1, 2, 3]);
        assert_eq!(t.p_core_indices[0], 4);
    }

    #[test]
    fn test_m1_ultra_per_die() {
        let t = resolve_topology("Apple M1 Ultra", 16, 4);
        assert_partition(&t, 16, 4);
        assert_eq!(t.p_core_indices[..8], (0..8).collect::<Vec<_>>()[..]);
        assert_eq!(t.e_core_indices, vec![8, 9, 18, 19]);
        assert_eq!(t.p_core_indices[8], 10);
    }

    #[test]
    fn test_m2_ultra_odd_counts_favour_first_die() {
        let t = resolve_topology("Apple M2 Ultra", 5, 3);
        assert_partition(&t, 5, 3);
        assert_eq!(t.p_core_indices, vec![0, 1, 2, 5, 6]);
        assert_eq!(t.e_core_indices, vec![3, 4, 7]);
    }

    #[test]
    fn test_default_layout() {
        let t = resolve_topology("Apple M2", 4, 4);
        assert_partition(&t, 4, 4);
        assert_eq!(t.p_core_indices, vec![0, 1, 2, 3]);
        assert_eq!(t.e_core_indices, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_unknown_and_empty_names() {
        assert_partition(&resolve_topology("", 8, 0), 8, 0);
        assert_partition(&resolve_topology("Intel(R) Xeon(R)", 0, 0), 0, 0);
    }

    #[test]
    fn test_group_averages() {
        let t = resolve_topology("Apple M2", 2, 2);
        let (e, p) = t.group_averages(&[10.0, 30.0, 50.0, 70.0]);
        assert_eq!(p, 20.0);
        assert_eq!(e, 60.0);
    }

    #[test]
    fn test_group_averages_ignores_missing_indices() {
        let t = resolve_topology("Apple M2", 2, 2);
        let (e, p) = t.group_averages(&[10.0, 30.0]);
        assert_eq!(p, 20.0);
        assert_eq!(e, 0.0);
    }

    #[test]
    fn test_core_type_labels() {
        let t = resolve_topology("Apple M4 Pro", 1, 1);
        assert_eq!(t.core_type(0), Some("E"));
        assert_eq!(t.core_type(1), Some("P"));
        assert_eq!(t.core_type(2), None);
    }
}
