//! Process and system memory readings for health reporting.
//!
//! Reads `/proc` on Linux. Every reading returns 0 on other platforms or when
//! the proc files cannot be parsed.

use std::fs;

use tracing::debug;

/// Page size assumed when converting `/proc/self/statm` page counts.
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMonitor;

impl ProcessMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Resident set size of this process in bytes.
    pub fn memory_usage(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            match fs::read_to_string("/proc/self/statm") {
                Ok(content) => parse_statm_rss(&content).unwrap_or(0),
                Err(e) => {
                    debug!(error = %e, "Failed to read /proc/self/statm");
                    0
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    /// Total physical memory of the host in bytes.
    pub fn total_memory(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            match fs::read_to_string("/proc/meminfo") {
                Ok(content) => parse_meminfo_total(&content).unwrap_or(0),
                Err(e) => {
                    debug!(error = %e, "Failed to read /proc/meminfo");
                    0
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    pub fn memory_usage_human(&self) -> String {
        match self.memory_usage() {
            0 => "unknown".to_string(),
            bytes => format_bytes(bytes),
        }
    }
}

// statm format: size resident share text lib data dt, in pages.
fn parse_statm_rss(content: &str) -> Option<u64> {
    let pages: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

// "MemTotal:       16318480 kB"
fn parse_meminfo_total(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Render a byte count with a binary unit, e.g. `"1.5 GB"`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
