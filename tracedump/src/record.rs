use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::container::{self, ContainerWriter, TimeWindow, WriterOptions};
use crate::params::TraceParams;
use crate::pool::TraceFileInfo;
use crate::sysfs::TraceSysfs;
use crate::utils;
use crate::Engine;

/// Drain wakeup period while a file is being recorded.
pub(crate) const DRAIN_TICK: Duration = Duration::from_secs(1);
/// Consecutive output-file regenerations before the task gives up.
const MAX_NEW_FILE_ROLLS: u32 = 5;

/// Long-lived drain loop producing a rotating file sequence. Runs on its
/// own thread exactly while the RECORD bit is set; `record_end` is the
/// join sentinel.
pub(crate) fn record_task(engine: Arc<Engine>, sysfs: TraceSysfs, params: TraceParams) {
    utils::set_process_name("TraceRecorder");
    log::info!("record task started");
    let _ = fs::remove_file(engine.output_dir.join(container::SAVED_EVENTS_FORMAT));

    let file_limit = if params.file_limit > 0 {
        params.file_limit
    } else {
        engine.config.record_file_limit
    };
    {
        let mut pools = engine.pools.lock().unwrap();
        pools.record.refresh();
        if engine.ageing_allowed() {
            pools.record.age_by_count(file_limit);
            pools.record.age_by_total_size(engine.config.record_file_kb * 1024 * file_limit as u64);
        }
    }

    // fileSize 0 on a root build means one uncut file
    if params.file_size_kb == 0 && engine.config.root_version {
        record_uncut(&engine, &sysfs, &params);
        engine.record_end.store(true, Ordering::Release);
        log::info!("record task exited");
        return;
    }

    let cap_kb = if params.file_size_kb > 0 {
        params.file_size_kb
    } else {
        engine.config.record_file_kb
    };
    let mut rolls = 0u32;
    while engine.record_flag.load(Ordering::Acquire) {
        if engine.ageing_allowed() {
            let mut pools = engine.pools.lock().unwrap();
            pools.record.age_by_count(file_limit);
        }
        match drain_one_file(&engine, &sysfs, Some(cap_kb * 1024), None) {
            Some(info) => {
                rolls = 0;
                let mut pools = engine.pools.lock().unwrap();
                pools.record.append(info);
            }
            None => {
                rolls += 1;
                if rolls > MAX_NEW_FILE_ROLLS {
                    log::error!("creating new record files failed repeatedly, task stops");
                    break;
                }
            }
        }
    }
    engine.record_end.store(true, Ordering::Release);
    log::info!("record task exited");
}

fn record_uncut(engine: &Arc<Engine>, sysfs: &TraceSysfs, params: &TraceParams) {
    let explicit = params.output_file.as_deref();
    if let Some(info) = drain_one_file(engine, sysfs, None, explicit) {
        let mut pools = engine.pools.lock().unwrap();
        pools.record.append(info);
    }
}

/// Write one container, draining the raw buffer every second until the
/// record flag drops, the size cap hits, or the output file disappears.
fn drain_one_file(
    engine: &Arc<Engine>,
    sysfs: &TraceSysfs,
    cap_bytes: Option<u64>,
    explicit_path: Option<&Path>,
) -> Option<TraceFileInfo> {
    let seq = engine.next_file_seq();
    let inflight = engine.output_dir.join(container::inflight_file_name(seq));
    let path = explicit_path.unwrap_or(&inflight);
    let opts = WriterOptions {
        window: TimeWindow::default(),
        size_cap_bytes: cap_bytes,
        aggregated: sysfs.is_aggregated(),
        cpu_count: sysfs.cpu_count(),
    };
    let mut writer = match ContainerWriter::create(path, sysfs, &engine.output_dir, opts) {
        Ok(w) => w,
        Err(e) => {
            log::error!("open {} failed: {}", path.display(), e);
            return None;
        }
    };
    sysfs.mark_clock_sync();
    if !writer.write_preamble() {
        writer.abort();
        return None;
    }
    while engine.record_flag.load(Ordering::Acquire) && !writer.size_capped() {
        thread::sleep(DRAIN_TICK);
        if !writer.write_cpu_raw() {
            break;
        }
    }
    writer.write_trailing();
    let sealed = if explicit_path.is_some() {
        writer.finalize_in_place()
    } else {
        writer.finalize(false)
    };
    match sealed {
        Ok(info) => Some(info),
        Err(e) => {
            log::error!("sealing record file failed: {}", e);
            None
        }
    }
}
