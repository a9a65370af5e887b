//! Host-memory discovery and pool sizing.
//!
//! At startup the node probes how much RAM it may actually use: the
//! smaller of physical memory and any cgroup limit imposed on the
//! container. From that number two pools are derived, one for index
//! building and one for the search-mode disk page cache. The probe runs
//! once at boot; the derived numbers are immutable afterwards.

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::Config;

pub const EIGHT_TB: u64 = 8 * 1024 * 1024 * 1024 * 1024;

/// Stand-in for the in-process heap ceiling subtracted from available RAM.
const PROCESS_RESERVATION: u64 = 256 * 1024 * 1024;

const OS_RESERVE_CAP: u64 = 512 * 1024 * 1024;

const CGROUP_V1_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/memory.max";

/// Memory pools derived from the probe, fixed for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudgets {
    /// Total memory the node may consume outside the process reservation.
    pub max_memory_consumption: u64,
    /// Pool handed to the index builder.
    pub index_building: u64,
    /// Pool handed to the search-mode disk cache.
    pub disk_cache: u64,
}

/// Probe the RAM actually available to this process.
///
/// Returns an error when the probe cannot produce a trustworthy number
/// (8 TiB and above is treated as "detection failed" rather than guessed
/// at).
pub fn fetch_available_ram() -> Result<u64> {
    let result = if cfg!(target_os = "linux") {
        available_memory_linux()
    } else {
        available_memory_other()
    };

    if result >= EIGHT_TB {
        bail!("Unable to detect amount of RAM available on server");
    }

    Ok(result)
}

/// Derive the build and cache pools from the probed RAM and configuration.
pub fn compute_budgets(available_ram: u64, config: &Config) -> MemoryBudgets {
    let available_direct = available_ram.saturating_sub(PROCESS_RESERVATION);
    let os_reserve = OS_RESERVE_CAP.min(available_direct / 100);
    let max_memory_consumption = available_direct - os_reserve;

    tracing::info!(
        "Available direct memory size : {}, process reservation : {}, available RAM : {}, memory booked for OS needs {}",
        format_memory(max_memory_consumption),
        format_memory(PROCESS_RESERVATION),
        format_memory(available_ram),
        format_memory(os_reserve)
    );

    let index_building = match config.index_building_max_memory {
        Some(value) => {
            tracing::info!(
                "Using {} for index building. {} will be used for disk page cache.",
                format_memory(value),
                format_memory(max_memory_consumption.saturating_sub(value))
            );
            value
        }
        None => {
            let value = max_memory_consumption / 2;
            tracing::info!(
                "Property vectoriadb.index.building.max-memory-consumption is not set. Using {} for index building. {} will be used for disk page cache.",
                format_memory(value),
                format_memory(max_memory_consumption - value)
            );
            value
        }
    };

    let disk_cache = match config.disk_cache_memory {
        Some(value) => {
            tracing::info!(
                "Using {} for disk page cache. {} will be used to keep primary index in memory.",
                format_memory(value),
                format_memory(max_memory_consumption.saturating_sub(value))
            );
            value
        }
        None => {
            let value = 4 * max_memory_consumption / 5;
            tracing::info!(
                "Property vectoriadb.index.search.disk-cache-memory-consumption is not set. Using {} for disk page cache. {} will be used to keep primary index in memory.",
                format_memory(value),
                format_memory(max_memory_consumption - value)
            );
            value
        }
    };

    MemoryBudgets {
        max_memory_consumption,
        index_building,
        disk_cache,
    }
}

fn available_memory_linux() -> u64 {
    let meminfo = fetch_meminfo_memory();
    let cgroup_v1 = fetch_cgroup_limit(Path::new(CGROUP_V1_LIMIT));
    let cgroup_v2 = fetch_cgroup_limit(Path::new(CGROUP_V2_MAX));

    meminfo.min(cgroup_v1).min(cgroup_v2)
}

#[cfg(windows)]
fn available_memory_other() -> u64 {
    use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

    let mut status = MEMORYSTATUSEX {
        dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
        dwMemoryLoad: 0,
        ullTotalPhys: 0,
        ullAvailPhys: 0,
        ullTotalPageFile: 0,
        ullAvailPageFile: 0,
        ullTotalVirtual: 0,
        ullAvailVirtual: 0,
        ullAvailExtendedVirtual: 0,
    };

    // SAFETY: the struct is properly sized and dwLength is set.
    let ok = unsafe { GlobalMemoryStatusEx(&mut status) };
    if ok == 0 {
        tracing::error!("GlobalMemoryStatusEx failed");
        return i32::MAX as u64;
    }

    status.ullTotalPhys
}

#[cfg(not(windows))]
fn available_memory_other() -> u64 {
    u64::MAX
}

fn fetch_meminfo_memory() -> u64 {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(content) => match parse_meminfo_total(&content) {
            Some(bytes) => bytes,
            None => {
                tracing::error!("Failed to parse /proc/meminfo");
                i32::MAX as u64
            }
        },
        Err(e) => {
            tracing::error!("Failed to read /proc/meminfo: {}", e);
            i32::MAX as u64
        }
    }
}

/// The first meminfo line is `MemTotal:  <kib> kB`.
fn parse_meminfo_total(content: &str) -> Option<u64> {
    let first_line = content.lines().next()?;
    let kib: u64 = first_line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// A missing cgroup file means no limit; so does the literal `max`.
fn fetch_cgroup_limit(path: &Path) -> u64 {
    if !path.exists() {
        return u64::MAX;
    }

    match std::fs::read_to_string(path) {
        Ok(content) => parse_cgroup_limit(&content).unwrap_or_else(|| {
            tracing::error!("Failed to parse {}", path.display());
            i32::MAX as u64
        }),
        Err(e) => {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            i32::MAX as u64
        }
    }
}

fn parse_cgroup_limit(content: &str) -> Option<u64> {
    let token = content.split_whitespace().next()?;
    if token == "max" {
        return Some(u64::MAX);
    }
    token.parse().ok()
}

fn format_memory(bytes: u64) -> String {
    format!(
        "{}/{}Mb/{}Gb",
        bytes,
        bytes / (1024 * 1024),
        bytes / (1024 * 1024 * 1024)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeKind;
    use std::path::PathBuf;

    fn test_config(building: Option<u64>, cache: Option<u64>) -> Config {
        Config {
            dimensions: 3,
            max_connections_per_vertex: 16,
            max_candidates_returned: 128,
            compression_ratio: 32,
            distance_multiplier: 1.0,
            index_building_max_memory: building,
            disk_cache_memory: cache,
            base_path: PathBuf::from("."),
            default_mode: ModeKind::Build,
        }
    }

    #[test]
    fn test_parse_meminfo_total() {
        let content = "MemTotal:       16384 kB\nMemFree:        1024 kB\n";
        assert_eq!(parse_meminfo_total(content), Some(16384 * 1024));
    }

    #[test]
    fn test_parse_meminfo_garbage() {
        assert_eq!(parse_meminfo_total("what is this"), None);
        assert_eq!(parse_meminfo_total(""), None);
    }

    #[test]
    fn test_parse_cgroup_limit() {
        assert_eq!(parse_cgroup_limit("max\n"), Some(u64::MAX));
        assert_eq!(parse_cgroup_limit("4294967296\n"), Some(4294967296));
        assert_eq!(parse_cgroup_limit("garbage"), None);
    }

    #[test]
    fn test_budget_defaults() {
        let ram = 8 * 1024 * 1024 * 1024u64;
        let budgets = compute_budgets(ram, &test_config(None, None));

        let direct = ram - PROCESS_RESERVATION;
        let os_reserve = OS_RESERVE_CAP.min(direct / 100);
        let max = direct - os_reserve;
        assert_eq!(budgets.max_memory_consumption, max);
        assert_eq!(budgets.index_building, max / 2);
        assert_eq!(budgets.disk_cache, 4 * max / 5);
    }

    #[test]
    fn test_budget_overrides() {
        let ram = 8 * 1024 * 1024 * 1024u64;
        let budgets = compute_budgets(ram, &test_config(Some(1 << 30), Some(2 << 30)));

        assert_eq!(budgets.index_building, 1 << 30);
        assert_eq!(budgets.disk_cache, 2 << 30);
    }

    #[test]
    fn test_os_reserve_is_capped() {
        // Large RAM: the reserve caps at 512 MiB instead of 1% of the total.
        let ram = 1024 * 1024 * 1024 * 1024u64;
        let budgets = compute_budgets(ram, &test_config(None, None));
        let direct = ram - PROCESS_RESERVATION;
        assert_eq!(budgets.max_memory_consumption, direct - OS_RESERVE_CAP);
    }
}
