//! Host information from `/etc/os-release`, `/proc` and `statvfs`.
//!
//! Every probe degrades to a fallback value instead of failing: a missing
//! `/proc` (non-Linux hosts) reports zeros rather than an error.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::protocol::{InfoSelection, SystemInfo};

pub(super) fn collect(selection: InfoSelection, disk_path: &Path) -> SystemInfo {
    let mut info = SystemInfo::default();
    if selection.os {
        let (name, version) = os_release();
        info.os_name = Some(name);
        info.os_version = Some(version);
    }
    if selection.cpu {
        info.cpu_info = Some(cpu_info());
    }
    if selection.memory {
        let (total, available) = memory();
        info.total_memory = Some(total);
        info.available_memory = Some(available);
    }
    if selection.disk {
        let (total, available) = disk(disk_path);
        info.total_disk = Some(total);
        info.available_disk = Some(available);
    }
    info
}

fn os_release() -> (String, String) {
    let fields = match std::fs::read_to_string("/etc/os-release") {
        Ok(text) => parse_os_release(&text),
        Err(e) => {
            debug!(error = %e, "No /etc/os-release");
            HashMap::new()
        }
    };
    let name = fields
        .get("NAME")
        .cloned()
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let version = fields
        .get("VERSION_ID")
        .or_else(|| fields.get("VERSION"))
        .cloned()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/osrelease")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    (name, version)
}

fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn cpu_info() -> String {
    let model = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| parse_cpu_model(&text))
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    format!("{model} ({cores} cores)")
}

fn parse_cpu_model(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| matches!(key.trim(), "model name" | "Model" | "Hardware"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|model| !model.is_empty())
}

/// Total and available memory in bytes.
fn memory() -> (u64, u64) {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(text) => parse_meminfo(&text),
        Err(e) => {
            debug!(error = %e, "No /proc/meminfo");
            (0, 0)
        }
    }
}

fn parse_meminfo(text: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kib = rest
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        match key {
            "MemTotal" => total = kib.saturating_mul(1024),
            "MemAvailable" => available = kib.saturating_mul(1024),
            _ => {}
        }
    }
    (total, available)
}

/// Total and available space in bytes on the filesystem holding `path`.
#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn disk(path: &Path) -> (u64, u64) {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = u64::from(stat.fragment_size());
            (
                u64::from(stat.blocks()).saturating_mul(fragment),
                u64::from(stat.blocks_available()).saturating_mul(fragment),
            )
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "statvfs failed");
            (0, 0)
        }
    }
}

#[cfg(not(unix))]
fn disk(_path: &Path) -> (u64, u64) {
    (0, 0)
}
