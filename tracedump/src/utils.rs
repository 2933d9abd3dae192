use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::statvfs::statvfs;
use nix::time::{clock_gettime, ClockId};

pub const S_TO_NS: u64 = 1_000_000_000;
pub const MS_TO_NS: u64 = 1_000_000;

/// Wall clock, Unix seconds.
pub fn wall_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall clock, Unix milliseconds.
pub fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Boot clock (ticks during suspend), nanoseconds since boot.
pub fn boot_now_ns() -> Option<u64> {
    clock_gettime(ClockId::CLOCK_BOOTTIME)
        .ok()
        .map(|ts| ts.tv_sec() as u64 * S_TO_NS + ts.tv_nsec() as u64)
}

/// Wall-clock instant of boot, in milliseconds. Captured per call; drift
/// across a single dump is negligible.
pub fn boot_epoch_ms() -> Option<u64> {
    let boot_ms = boot_now_ns()? / MS_TO_NS;
    Some(wall_now_ms().saturating_sub(boot_ms))
}

/// Convert a page timestamp in boot-clock nanoseconds to wall milliseconds.
pub fn boot_ns_to_wall_ms(ts_ns: u64, boot_epoch: u64) -> u64 {
    boot_epoch.saturating_add(ts_ns / MS_TO_NS)
}

/// Resolve symlinks and dot segments. For paths that do not exist yet the
/// parent directory is resolved and the file name re-appended.
pub fn canonicalize_path(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Some(resolved);
    }
    let parent = path.parent()?;
    let name = path.file_name()?;
    fs::canonicalize(parent).ok().map(|p| p.join(name))
}

/// Free bytes available to unprivileged writers on the volume holding `path`.
pub fn free_space_bytes(path: &Path) -> Option<u64> {
    let stat = statvfs(path).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Rename the current process/thread, truncated to the kernel's 16-byte cap.
pub fn set_process_name(name: &str) {
    let capped: String = name.chars().take(15).collect();
    if let Ok(cname) = CString::new(capped) {
        let _ = nix::sys::prctl::set_name(&cname);
    }
}

/// Current frequency of each CPU as "cpu frequency: f0,f1,...", read from
/// cpufreq. CPUs without a readable node are skipped.
pub fn read_cpu_frequencies() -> String {
    let mut freqs = Vec::new();
    let mut cpu = 0;
    loop {
        let node = format!("/sys/devices/system/cpu/cpu{}/cpufreq/scaling_cur_freq", cpu);
        match fs::read_to_string(&node) {
            Ok(contents) => freqs.push(contents.trim().to_string()),
            Err(_) => break,
        }
        cpu += 1;
    }
    format!("cpu frequency: {}", freqs.join(","))
}
