//! Dump engine for the kernel trace ring buffer.
//!
//! The engine sits on top of the tracing pseudo-filesystem and produces
//! self-describing binary trace containers on disk. One underlying buffer
//! serves three concurrent capture styles:
//!
//! - **snapshot**: on-demand capture of recent history, bounded by a
//!   caller-supplied time window and drained inside a short-lived child
//!   process;
//! - **recording**: long-running continuous capture into a rotating,
//!   size-capped file sequence;
//! - **cache**: a background producer that keeps draining the buffer
//!   into a pre-aged pool so a later snapshot can answer instantly.
//!
//! [`TraceDumper`] is the façade: it owns the composite mode bitset,
//! serializes transitions, and routes calls to the engines.

mod balancer;
mod cache;
mod config;
mod container;
mod error;
mod mode;
mod params;
mod pool;
mod properties;
mod record;
mod snapshot;
mod sysfs;
mod tags;
mod utils;

pub use config::ProductConfig;
pub use container::{
    CONTENT_TYPE_BASE_INFO, CONTENT_TYPE_CMDLINES, CONTENT_TYPE_CPU_RAW,
    CONTENT_TYPE_EVENTS_FORMAT, CONTENT_TYPE_HEADER_PAGE, CONTENT_TYPE_KALLSYMS,
    CONTENT_TYPE_PRINTK_FORMATS, CONTENT_TYPE_TGIDS, CONTENT_HEADER_LEN, FILE_HEADER_LEN,
    PAGE_SIZE, TRACE_MAGIC, TRACE_VERSION,
};
pub use error::{TraceErrorCode, TraceRetInfo};
pub use mode::TraceMode;
pub use params::TraceParams;
pub use pool::TraceFileInfo;
pub use tags::{TagInfo, TagKind, TagRegistry};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::cache::CacheSession;
use crate::pool::{PoolKind, TracePool};
use crate::snapshot::DumpWindow;
use crate::sysfs::TraceSysfs;

/// Join poll period for the worker-end sentinels.
const JOIN_TICK: Duration = Duration::from_millis(100);
/// How long a dump waits for the cache task to close its slice.
const CACHE_INTERRUPT_WAIT: Duration = Duration::from_secs(5);

pub(crate) struct Pools {
    pub snapshot: TracePool,
    pub record: TracePool,
    pub cache: TracePool,
}

impl Pools {
    fn new(dir: &Path) -> Pools {
        Pools {
            snapshot: TracePool::new(dir, PoolKind::Snapshot),
            record: TracePool::new(dir, PoolKind::Record),
            cache: TracePool::new(dir, PoolKind::Cache),
        }
    }
}

pub(crate) struct Coordinator {
    mode: TraceMode,
    params: TraceParams,
    sysfs: Option<TraceSysfs>,
    tag_prop_snapshot: u64,
}

/// Shared state behind the façade. Worker threads hold an `Arc` to it;
/// the coordinator lock is always taken before the pool lock.
pub(crate) struct Engine {
    pub coord: Mutex<Coordinator>,
    pub pools: Mutex<Pools>,
    pub record_flag: AtomicBool,
    pub record_end: AtomicBool,
    pub cache_flag: AtomicBool,
    pub cache_end: AtomicBool,
    pub interrupt_dump: AtomicBool,
    pub balancer_running: AtomicBool,
    file_seq: AtomicU64,
    pub registry: TagRegistry,
    pub config: ProductConfig,
    pub output_dir: PathBuf,
    trace_root: Option<PathBuf>,
}

impl Engine {
    pub fn mode_is_open(&self) -> bool {
        self.coord.lock().unwrap().mode.contains(TraceMode::OPEN)
    }

    pub fn tag_prop_snapshot(&self) -> u64 {
        self.coord.lock().unwrap().tag_prop_snapshot
    }

    pub fn next_file_seq(&self) -> u64 {
        self.file_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn ageing_allowed(&self) -> bool {
        self.config.ageing_enabled && !self.config.root_version
    }
}

pub struct TraceDumperBuilder {
    registry: TagRegistry,
    config: Option<ProductConfig>,
    trace_root: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

impl TraceDumperBuilder {
    pub fn config(mut self, config: ProductConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an explicit tracing root instead of probing the well-known
    /// mount points.
    pub fn trace_root(mut self, root: &Path) -> Self {
        self.trace_root = Some(root.to_path_buf());
        self
    }

    pub fn output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = Some(dir.to_path_buf());
        self
    }

    pub fn build(self) -> TraceDumper {
        let config = self.config.unwrap_or_else(|| config::product().clone());
        let output_dir = self.output_dir.unwrap_or_else(|| config.output_dir.clone());
        TraceDumper {
            engine: Arc::new(Engine {
                coord: Mutex::new(Coordinator {
                    mode: TraceMode::CLOSE,
                    params: TraceParams::default(),
                    sysfs: None,
                    tag_prop_snapshot: 0,
                }),
                pools: Mutex::new(Pools::new(&output_dir)),
                record_flag: AtomicBool::new(false),
                record_end: AtomicBool::new(true),
                cache_flag: AtomicBool::new(false),
                cache_end: AtomicBool::new(true),
                interrupt_dump: AtomicBool::new(false),
                balancer_running: AtomicBool::new(false),
                file_seq: AtomicU64::new(0),
                registry: self.registry,
                config,
                output_dir,
                trace_root: self.trace_root,
            }),
        }
    }
}

/// The mode coordinator and public façade over the dump engine.
pub struct TraceDumper {
    engine: Arc<Engine>,
}

impl TraceDumper {
    /// Engine with the product defaults, probing the live tracing root at
    /// open time. The registry comes from the external tag taxonomy.
    pub fn new(registry: TagRegistry) -> TraceDumper {
        TraceDumper::builder(registry).build()
    }

    pub fn builder(registry: TagRegistry) -> TraceDumperBuilder {
        TraceDumperBuilder {
            registry,
            config: None,
            trace_root: None,
            output_dir: None,
        }
    }

    pub fn mode(&self) -> TraceMode {
        self.engine.coord.lock().unwrap().mode
    }

    fn probe_sysfs(&self) -> Option<TraceSysfs> {
        match &self.engine.trace_root {
            Some(root) => TraceSysfs::at(root),
            None => TraceSysfs::probe(),
        }
    }

    /// Open a capture session from the named tag groups with the product
    /// defaults.
    pub fn open(&self, tag_groups: &[&str]) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if !coord.mode.is_closed() {
            log::error!("open rejected, mode is {:?}", coord.mode);
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(sysfs) = self.probe_sysfs() else {
            return TraceErrorCode::TraceNotSupported;
        };
        if self.engine.registry.is_empty() {
            return TraceErrorCode::TagError;
        }
        let groups: Vec<String> = tag_groups.iter().map(|g| g.to_string()).collect();
        if groups.is_empty() || !self.engine.registry.check_groups(&groups) {
            return TraceErrorCode::TagError;
        }
        let mut params = TraceParams::default();
        params.tag_groups = groups;
        params.buffer_size_kb = if sysfs.is_aggregated() {
            self.engine.config.aggregated_buffer_kb
        } else {
            self.engine.config.buffer_kb
        };
        self.open_session(&mut coord, sysfs, params)
    }

    /// Open a capture session from an argument string, e.g.
    /// `"tags:sched clockType:boot bufferSize:1024 overwrite:1"`.
    pub fn open_args(&self, args: &str) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if !coord.mode.is_closed() {
            log::error!("open rejected, mode is {:?}", coord.mode);
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(sysfs) = self.probe_sysfs() else {
            return TraceErrorCode::TraceNotSupported;
        };
        if self.engine.registry.is_empty() {
            return TraceErrorCode::TagError;
        }
        let Some(params) = params::parse_args(args, &self.engine.registry) else {
            return TraceErrorCode::TagError;
        };
        self.open_session(&mut coord, sysfs, params)
    }

    fn open_session(
        &self,
        coord: &mut Coordinator,
        sysfs: TraceSysfs,
        params: TraceParams,
    ) -> TraceErrorCode {
        if let Err(e) = fs::create_dir_all(&self.engine.output_dir) {
            log::error!("create {} failed: {}", self.engine.output_dir.display(), e);
            return TraceErrorCode::FileError;
        }
        let _ = fs::remove_file(self.engine.output_dir.join(container::SAVED_EVENTS_FORMAT));

        sysfs.disable_all(&self.engine.registry);
        sysfs.truncate_trace();
        if !sysfs.program(&params, &self.engine.registry) {
            // wind the kernel back rather than leave it half-programmed
            sysfs.disable_all(&self.engine.registry);
            return TraceErrorCode::FileError;
        }
        if params.app_pid > 0 {
            properties::set_property(properties::KEY_APP_PID, &params.app_pid.to_string());
        }

        {
            let mut pools = self.engine.pools.lock().unwrap();
            pools.snapshot.refresh();
            pools.record.refresh();
            pools.cache.refresh();
            if self.engine.ageing_allowed() {
                pools.snapshot.age_by_count(self.engine.config.snapshot_file_limit);
            }
        }

        coord.tag_prop_snapshot = properties::get_property_u64(properties::KEY_USER_TAGS, 0);
        coord.sysfs = Some(sysfs.clone());
        coord.params = params;
        coord.mode = TraceMode::OPEN;

        if !sysfs.is_aggregated() && !self.engine.balancer_running.swap(true, Ordering::AcqRel) {
            let engine = Arc::clone(&self.engine);
            let base_kb = coord.params.buffer_size_kb;
            thread::spawn(move || balancer::balancer_task(engine, sysfs, base_kb));
        }
        log::info!("trace session opened");
        TraceErrorCode::Success
    }

    /// One snapshot of the window ending at `end_time_wall` (Unix seconds,
    /// 0 meaning now) and reaching back `max_duration` seconds (0 meaning
    /// unbounded). With the cache engine running the request is answered
    /// from the cache pool instead of re-draining the buffer.
    pub fn dump(&self, max_duration: i64, end_time_wall: u64) -> TraceRetInfo {
        let window = match snapshot::compute_window(max_duration, end_time_wall) {
            Ok(w) => w,
            Err(code) => return TraceRetInfo::error(code, self.mode()),
        };
        let coord = self.engine.coord.lock().unwrap();
        let mode = coord.mode;
        if !mode.contains(TraceMode::OPEN) || mode.contains(TraceMode::RECORD) {
            log::error!("dump rejected, mode is {:?}", mode);
            return TraceRetInfo::error(TraceErrorCode::WrongTraceMode, mode);
        }
        let Some(sysfs) = coord.sysfs.clone() else {
            return TraceRetInfo::error(TraceErrorCode::WrongTraceMode, mode);
        };
        if mode.contains(TraceMode::CACHE) {
            drop(coord);
            return self.dump_from_cache(&window);
        }
        self.dump_fresh(coord, sysfs, &window)
    }

    /// Cache fast path: ask the cache task to close its slice, then
    /// migrate every covered cache file into the snapshot pool.
    fn dump_from_cache(&self, window: &DumpWindow) -> TraceRetInfo {
        self.engine.interrupt_dump.store(true, Ordering::Release);
        let rounds = CACHE_INTERRUPT_WAIT.as_millis() / JOIN_TICK.as_millis();
        for _ in 0..rounds {
            if !self.engine.interrupt_dump.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(JOIN_TICK);
        }

        let coord = self.engine.coord.lock().unwrap();
        let mode = coord.mode;
        if !mode.contains(TraceMode::OPEN) {
            return TraceRetInfo::error(TraceErrorCode::WrongTraceMode, mode);
        }
        let mut pools = self.engine.pools.lock().unwrap();
        let Pools { snapshot, cache, .. } = &mut *pools;
        let (mut hits, _) = cache.find_overlapping(window.wall_start_ms, window.wall_end_ms);
        hits.reverse(); // migrate from the back so indices stay valid
        for idx in hits {
            cache.migrate_to(idx, snapshot);
        }
        let (files, covered_ms) = collect_window_files(snapshot, window);
        if files.is_empty() {
            log::error!("no cached file covers the requested window");
            return TraceRetInfo::error(TraceErrorCode::OutOfTime, mode);
        }
        build_ret(TraceErrorCode::Success, files, covered_ms, window, mode)
    }

    /// Normal path: fork a child to drain the window into a fresh file.
    fn dump_fresh(
        &self,
        coord: MutexGuard<'_, Coordinator>,
        sysfs: TraceSysfs,
        window: &DumpWindow,
    ) -> TraceRetInfo {
        // the guard stays held: only one writer may drain at a time
        let mode = coord.mode;
        let floor = self.engine.config.free_space_floor_kb * 1024;
        match utils::free_space_bytes(&self.engine.output_dir) {
            Some(free) if free >= floor => {}
            Some(free) => {
                log::error!("only {} bytes free, dump refused", free);
                return TraceRetInfo::error(TraceErrorCode::FileError, mode);
            }
            None => return TraceRetInfo::error(TraceErrorCode::FileError, mode),
        }

        let seq = self.engine.next_file_seq();
        let tmp = self.engine.output_dir.join(container::inflight_file_name(seq));
        let outcome =
            match snapshot::dump_in_child(&sysfs, &self.engine.output_dir, &tmp, window.boot) {
                Ok(outcome) => outcome,
                Err(code) => {
                    let _ = fs::remove_file(&tmp);
                    return TraceRetInfo::error(code, mode);
                }
            };
        if outcome.status != TraceErrorCode::Success {
            // a partial file with no raw bytes is useless; drop it
            let _ = fs::remove_file(&tmp);
            return TraceRetInfo::error(outcome.status, mode);
        }
        let info = match container::finalize_at(
            &tmp,
            &self.engine.output_dir,
            outcome.first_page_ts,
            outcome.last_page_ts,
            false,
        ) {
            Ok(info) => info,
            Err(e) => {
                log::error!("sealing snapshot failed: {}", e);
                return TraceRetInfo::error(TraceErrorCode::WriteTraceInfoError, mode);
            }
        };

        let mut pools = self.engine.pools.lock().unwrap();
        pools.snapshot.append(info);
        if self.engine.ageing_allowed() {
            pools.snapshot.age_by_count(self.engine.config.snapshot_file_limit);
        }
        // overlay any older cache files still covering the window
        let Pools { snapshot, cache, .. } = &mut *pools;
        let (mut hits, _) = cache.find_overlapping(window.wall_start_ms, window.wall_end_ms);
        hits.reverse();
        for idx in hits {
            cache.migrate_to(idx, snapshot);
        }
        let (files, covered_ms) = collect_window_files(snapshot, window);
        build_ret(TraceErrorCode::Success, files, covered_ms, window, mode)
    }

    /// Start the rotating recording drain. Requires a plain open session
    /// and the previous recording task to be fully joined.
    pub fn record_on(&self) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if coord.mode != TraceMode::OPEN {
            log::error!("record_on rejected, mode is {:?}", coord.mode);
            return TraceErrorCode::WrongTraceMode;
        }
        if !self.engine.record_end.load(Ordering::Acquire) {
            log::error!("previous recording is still draining");
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(sysfs) = coord.sysfs.clone() else {
            return TraceErrorCode::WrongTraceMode;
        };
        self.engine.record_flag.store(true, Ordering::Release);
        self.engine.record_end.store(false, Ordering::Release);
        let engine = Arc::clone(&self.engine);
        let params = coord.params.clone();
        let task_sysfs = sysfs.clone();
        thread::spawn(move || record::record_task(engine, task_sysfs, params));
        coord.mode |= TraceMode::RECORD;
        // seed offline analysis with the current cpu frequencies
        sysfs.write_marker(&utils::read_cpu_frequencies());
        log::info!("recording on");
        TraceErrorCode::Success
    }

    /// Stop the recording drain and return the files it produced in this
    /// session.
    pub fn record_off(&self) -> TraceRetInfo {
        let mut coord = self.engine.coord.lock().unwrap();
        if !coord.mode.contains(TraceMode::RECORD) {
            log::error!("record_off rejected, mode is {:?}", coord.mode);
            return TraceRetInfo::error(TraceErrorCode::WrongTraceMode, coord.mode);
        }
        self.engine.record_flag.store(false, Ordering::Release);
        while !self.engine.record_end.load(Ordering::Acquire) {
            thread::sleep(JOIN_TICK);
            self.engine.record_flag.store(false, Ordering::Release);
        }
        coord.mode.remove(TraceMode::RECORD);
        let files = self.engine.pools.lock().unwrap().record.take_fresh();
        log::info!("recording off, {} files", files.len());
        TraceRetInfo {
            error_code: TraceErrorCode::Success,
            output_files: files,
            coverage_duration_ms: 0,
            coverage_ratio: 0,
            mode: coord.mode,
        }
    }

    /// Start the background cache drain. Zero arguments fall back to the
    /// product config: total pool budget in KB and slice length in seconds.
    pub fn cache_on(&self, total_size_kb: u64, slice_secs: u64) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if coord.mode != TraceMode::OPEN {
            log::error!("cache_on rejected, mode is {:?}", coord.mode);
            return TraceErrorCode::WrongTraceMode;
        }
        if !self.engine.cache_end.load(Ordering::Acquire) {
            log::error!("previous cache task is still draining");
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(sysfs) = coord.sysfs.clone() else {
            return TraceErrorCode::WrongTraceMode;
        };
        let config = &self.engine.config;
        let session = CacheSession {
            total_budget_bytes: if total_size_kb > 0 {
                total_size_kb * 1024
            } else {
                config.cache_total_kb * 1024
            },
            slice_secs: if slice_secs > 0 {
                slice_secs
            } else {
                config.cache_slice_secs
            },
            file_cap_bytes: config.cache_file_kb * 1024,
            retention_ms: config.cache_retention_secs * 1000,
        };
        self.engine.cache_flag.store(true, Ordering::Release);
        self.engine.cache_end.store(false, Ordering::Release);
        let engine = Arc::clone(&self.engine);
        thread::spawn(move || cache::cache_task(engine, sysfs, session));
        coord.mode |= TraceMode::CACHE;
        log::info!("cache on");
        TraceErrorCode::Success
    }

    /// Stop the cache drain. The in-flight slice is finished and stays in
    /// the cache pool.
    pub fn cache_off(&self) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if !coord.mode.contains(TraceMode::CACHE) {
            log::error!("cache_off rejected, mode is {:?}", coord.mode);
            return TraceErrorCode::WrongTraceMode;
        }
        self.engine.cache_flag.store(false, Ordering::Release);
        while !self.engine.cache_end.load(Ordering::Acquire) {
            thread::sleep(JOIN_TICK);
            self.engine.cache_flag.store(false, Ordering::Release);
        }
        coord.mode.remove(TraceMode::CACHE);
        log::info!("cache off");
        TraceErrorCode::Success
    }

    /// Stop every worker, disable all kernel tags, reset the buffer and
    /// clear the in-memory pools. Idempotent: closing a closed engine is a
    /// no-op success.
    pub fn close(&self) -> TraceErrorCode {
        let mut coord = self.engine.coord.lock().unwrap();
        if coord.mode.is_closed() {
            log::info!("trace already closed");
            return TraceErrorCode::Success;
        }
        self.engine.record_flag.store(false, Ordering::Release);
        self.engine.cache_flag.store(false, Ordering::Release);
        while !self.engine.record_end.load(Ordering::Acquire) {
            thread::sleep(JOIN_TICK);
        }
        while !self.engine.cache_end.load(Ordering::Acquire) {
            thread::sleep(JOIN_TICK);
        }
        coord.mode = TraceMode::CLOSE;
        self.engine.interrupt_dump.store(false, Ordering::Release);

        properties::set_property(properties::KEY_APP_PID, "-1");
        if let Some(sysfs) = coord.sysfs.take() {
            sysfs.disable_all(&self.engine.registry);
            sysfs.truncate_trace();
        }
        let mut pools = self.engine.pools.lock().unwrap();
        pools.snapshot.clear();
        pools.record.clear();
        pools.cache.clear();
        log::info!("trace session closed");
        TraceErrorCode::Success
    }
}

fn collect_window_files(snapshot: &TracePool, window: &DumpWindow) -> (Vec<PathBuf>, u64) {
    let (hits, covered_ms) = snapshot.find_overlapping(window.wall_start_ms, window.wall_end_ms);
    let files = hits
        .into_iter()
        .map(|idx| snapshot.files()[idx].path.clone())
        .collect();
    (files, covered_ms)
}

fn build_ret(
    code: TraceErrorCode,
    files: Vec<PathBuf>,
    covered_ms: u64,
    window: &DumpWindow,
    mode: TraceMode,
) -> TraceRetInfo {
    let ratio = match window.committed_ms {
        Some(committed) if committed > 0 => ((covered_ms * 1000 / committed).min(1000)) as u32,
        _ => {
            if covered_ms > 0 {
                1000
            } else {
                0
            }
        }
    };
    TraceRetInfo {
        error_code: code,
        output_files: files,
        coverage_duration_ms: covered_ms,
        coverage_ratio: ratio,
        mode,
    }
}
