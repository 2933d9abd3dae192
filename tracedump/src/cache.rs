use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::container::{self, ContainerWriter, TimeWindow, WriterOptions};
use crate::sysfs::TraceSysfs;
use crate::utils;
use crate::Engine;

/// Resolved cache-mode knobs; zeros passed to `cache_on` fall back to the
/// product config before a session is built.
#[derive(Debug, Clone)]
pub(crate) struct CacheSession {
    /// Total size budget of the cache pool, bytes.
    pub total_budget_bytes: u64,
    /// Nominal slice duration, seconds.
    pub slice_secs: u64,
    /// Per-slice file cap, bytes.
    pub file_cap_bytes: u64,
    /// Age-out horizon for old slices, milliseconds.
    pub retention_ms: u64,
}

/// Continuous sliced drain into the cache pool. A snapshot can interrupt
/// the current slice through the `interrupt_dump` atomic; the slice is
/// then closed (with one final drain) so its file becomes visible for
/// migration, and the flag is released once the file is indexed.
pub(crate) fn cache_task(engine: Arc<Engine>, sysfs: TraceSysfs, session: CacheSession) {
    utils::set_process_name("TraceCache");
    log::info!(
        "cache task started, slice {} s, budget {} bytes",
        session.slice_secs,
        session.total_budget_bytes
    );

    while engine.cache_flag.load(Ordering::Acquire) {
        {
            let mut pools = engine.pools.lock().unwrap();
            pools.cache.age_by_total_size(session.total_budget_bytes);
            pools.cache.age_by_duration(utils::wall_now_ms(), session.retention_ms);
        }
        let interrupted = drain_one_slice(&engine, &sysfs, &session);
        if interrupted {
            // slice is indexed; let the waiting snapshot proceed
            engine.interrupt_dump.store(false, Ordering::Release);
        }
    }
    engine.cache_end.store(true, Ordering::Release);
    log::info!("cache task exited");
}

/// Write one cache slice. Returns whether the slice was closed early on
/// behalf of a snapshot.
fn drain_one_slice(engine: &Arc<Engine>, sysfs: &TraceSysfs, session: &CacheSession) -> bool {
    let seq = engine.next_file_seq();
    let inflight = engine.output_dir.join(container::inflight_file_name(seq));
    let opts = WriterOptions {
        window: TimeWindow::default(),
        size_cap_bytes: Some(session.file_cap_bytes),
        aggregated: sysfs.is_aggregated(),
        cpu_count: sysfs.cpu_count(),
    };
    let mut writer = match ContainerWriter::create(&inflight, sysfs, &engine.output_dir, opts) {
        Ok(w) => w,
        Err(e) => {
            log::error!("open {} failed: {}", inflight.display(), e);
            // do not spin on a broken output directory
            thread::sleep(Duration::from_secs(1));
            return false;
        }
    };
    sysfs.mark_clock_sync();
    if !writer.write_preamble() {
        writer.abort();
        return false;
    }

    let mut interrupted = false;
    let mut close_early = false;
    for _ in 0..session.slice_secs.max(1) {
        if engine.interrupt_dump.load(Ordering::Acquire) {
            interrupted = true;
            close_early = true;
            break;
        }
        if !engine.cache_flag.load(Ordering::Acquire) {
            close_early = true;
            break;
        }
        thread::sleep(Duration::from_secs(1));
        if !writer.write_cpu_raw() {
            break;
        }
        if writer.size_capped() {
            break;
        }
    }
    if close_early && !writer.size_capped() {
        // pull in whatever accumulated since the last tick before sealing
        writer.write_cpu_raw();
    }
    writer.write_trailing();
    match writer.finalize(true) {
        Ok(info) => {
            let mut pools = engine.pools.lock().unwrap();
            pools.cache.append(info);
        }
        Err(e) => log::error!("sealing cache slice failed: {}", e),
    }
    interrupted
}
