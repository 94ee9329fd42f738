use std::fmt;

use anyhow::{Context, Result};
use aya::maps::PerCpuArray;
use aya::Ebpf;
use pagetap_common::StatIndex;

/// Name of the per-CPU counter array in the eBPF object.
pub const STATS_MAP: &str = "STATS";

/// Handler counters summed over all CPUs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    counters: [u64; StatIndex::COUNT as usize],
}

impl ProbeStats {
    #[must_use]
    pub fn get(&self, stat: StatIndex) -> u64 {
        self.counters[stat as usize]
    }

    pub fn set(&mut self, stat: StatIndex, value: u64) {
        self.counters[stat as usize] = value;
    }

    /// Entries that passed the filter but were neither recorded nor retried.
    #[must_use]
    pub fn lost_entries(&self) -> u64 {
        self.get(StatIndex::CapacityDropped)
    }
}

impl fmt::Display for ProbeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("probes:")?;
        for stat in StatIndex::ALL {
            write!(f, " {}={}", stat.name(), self.get(stat))?;
        }
        Ok(())
    }
}

/// Read the `STATS` per-CPU array.
///
/// # Errors
/// Returns an error if the map is missing or cannot be read
pub fn read_probe_stats(bpf: &Ebpf) -> Result<ProbeStats> {
    let array: PerCpuArray<_, u64> =
        PerCpuArray::try_from(bpf.map(STATS_MAP).context("STATS map not found")?)?;

    let mut stats = ProbeStats::default();
    for stat in StatIndex::ALL {
        let per_cpu = array
            .get(&(stat as u32), 0)
            .with_context(|| format!("read {}", stat.name()))?;
        stats.set(stat, per_cpu.iter().sum());
    }
    Ok(stats)
}
