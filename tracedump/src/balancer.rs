use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::properties;
use crate::sysfs::TraceSysfs;
use crate::utils;
use crate::Engine;

/// Tick between balance rounds.
const BALANCE_INTERVAL_SECS: u64 = 15;
/// Floor for any single CPU buffer, KB.
const MIN_CPU_BUFFER_KB: u64 = 256;

/// Redistribution strategy for the per-CPU ring buffers: CPUs producing
/// more trace bytes get a larger share of the total budget.
pub struct DynamicBuffer {
    sysfs: TraceSysfs,
    cpu_count: usize,
    base_kb: u32,
}

impl DynamicBuffer {
    pub fn new(sysfs: TraceSysfs, cpu_count: usize, base_kb: u32) -> DynamicBuffer {
        DynamicBuffer {
            sysfs,
            cpu_count,
            base_kb,
        }
    }

    /// "bytes: N" line of `per_cpu/cpuN/stats`.
    fn stats_bytes(&self, cpu: usize) -> u64 {
        let stats = std::fs::read_to_string(self.sysfs.per_cpu_stats(cpu)).unwrap_or_default();
        for line in stats.lines() {
            if let Some(value) = line.strip_prefix("bytes:") {
                return value.trim().parse::<u64>().unwrap_or(0);
            }
        }
        0
    }

    /// New size vector in KB, one entry per CPU. The summed budget equals
    /// `base_kb * cpu_count`; idle CPUs shrink toward the floor.
    pub fn calculate(&self) -> Vec<u32> {
        let usage: Vec<u64> = (0..self.cpu_count).map(|cpu| self.stats_bytes(cpu)).collect();
        let total: u64 = usage.iter().sum();
        let budget = self.base_kb as u64 * self.cpu_count as u64;
        if total == 0 {
            return vec![self.base_kb; self.cpu_count];
        }
        usage
            .iter()
            .map(|&bytes| {
                let share = budget * bytes / total;
                share.clamp(MIN_CPU_BUFFER_KB, budget) as u32
            })
            .collect()
    }
}

/// Background loop redistributing per-CPU buffer sizes while the engine is
/// open. Doubles as the tamper watchdog: if the user-tag property no
/// longer matches the snapshot taken at open, or tracing was switched off
/// underneath us, control of the kernel state was lost and the loop exits.
pub(crate) fn balancer_task(engine: Arc<Engine>, sysfs: TraceSysfs, base_kb: u32) {
    utils::set_process_name("TraceBalancer");
    log::info!("buffer balancer started");
    'outer: loop {
        for _ in 0..BALANCE_INTERVAL_SECS {
            thread::sleep(Duration::from_secs(1));
            if !engine.mode_is_open() {
                break 'outer;
            }
        }

        let expected = engine.tag_prop_snapshot();
        let current = properties::get_property_u64(properties::KEY_USER_TAGS, 0);
        if current != expected {
            log::error!("user tag property changed from {} to {}, balancer exits", expected, current);
            break;
        }
        if !sysfs.tracing_on() {
            log::error!("tracing_on was cleared externally, balancer exits");
            break;
        }

        let cpu_count = sysfs.cpu_count();
        let sizes = DynamicBuffer::new(sysfs.clone(), cpu_count, base_kb).calculate();
        if sizes.len() != cpu_count {
            log::error!("buffer size calculation failed");
            break;
        }
        for (cpu, size_kb) in sizes.iter().enumerate() {
            log::debug!("cpu{} buffer set to {} KB", cpu, size_kb);
            sysfs.write_node(&sysfs.per_cpu_buffer_size(cpu), &size_kb.to_string());
        }
    }
    engine.balancer_running.store(false, Ordering::Release);
    log::info!("buffer balancer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fake_tracefs;
    use std::fs;

    #[test]
    fn idle_cpus_keep_the_base_size() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 4);
        let sizes = DynamicBuffer::new(sysfs, 4, 1024).calculate();
        assert_eq!(sizes, vec![1024; 4]);
    }

    #[test]
    fn busy_cpus_take_a_larger_share() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 2);
        fs::write(dir.path().join("per_cpu/cpu0/stats"), "entries: 10\nbytes: 300000\n").unwrap();
        fs::write(dir.path().join("per_cpu/cpu1/stats"), "entries: 1\nbytes: 100000\n").unwrap();
        let sizes = DynamicBuffer::new(sysfs, 2, 1024).calculate();
        assert_eq!(sizes.len(), 2);
        assert!(sizes[0] > sizes[1]);
        // the busy CPU gets three quarters of the 2048 KB budget
        assert_eq!(sizes[0], 1536);
        assert_eq!(sizes[1], 512);
    }

    #[test]
    fn tiny_shares_stay_above_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 2);
        fs::write(dir.path().join("per_cpu/cpu0/stats"), "bytes: 999999\n").unwrap();
        fs::write(dir.path().join("per_cpu/cpu1/stats"), "bytes: 1\n").unwrap();
        let sizes = DynamicBuffer::new(sysfs, 2, 1024).calculate();
        assert_eq!(sizes[1] as u64, MIN_CPU_BUFFER_KB);
    }
}
