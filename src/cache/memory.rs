//! Host Memory Module
//!
//! Reports how much physical memory the host can still hand out, used to
//! refuse budgets and reservations the machine cannot back.

use std::fmt::Debug;

pub trait HostMemory: Send + Sync + Debug {
    /// Available bytes, or None when unknown (no constraint is applied).
    fn available_bytes(&self) -> Option<u64>;

    /// Whether `bytes` more can be committed.
    fn can_commit(&self, bytes: u64) -> bool {
        self.available_bytes().map_or(true, |available| bytes <= available)
    }
}

// == System Memory ==
/// Reads `MemAvailable` from `/proc/meminfo`; unknown on other platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl HostMemory for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo_available(&meminfo)
    }
}

fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

// == Fixed Memory ==
/// Fixed answer, for tests and for hosts that pin the figure externally.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<u64>);

impl HostMemory for FixedMemory {
    fn available_bytes(&self) -> Option<u64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384 kB\nMemFree:   1024 kB\nMemAvailable:    2048 kB\n";
        assert_eq!(parse_meminfo_available(meminfo), Some(2048 * 1024));
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_fixed_memory() {
        assert!(FixedMemory(None).can_commit(u64::MAX));
        assert!(FixedMemory(Some(100)).can_commit(100));
        assert!(!FixedMemory(Some(100)).can_commit(101));
    }
}
