use std::fs;
use std::path::{Path, PathBuf};

pub const TRACE_FILE_SUFFIX: &str = ".sys";
pub const TRACE_FILE_STEM: &str = "trace_";
pub const CACHE_FILE_PREFIX: &str = "cache_";

/// Window-intersection slack, covering second-granularity caller input.
const OVERLAP_TOLERANCE_MS: u64 = 100;
/// Spans at or above this are treated as corrupt metadata and ignored.
pub const MAX_FILE_SPAN_MS: u64 = 2_000_000;

/// One on-disk trace file. Times are wall-clock milliseconds derived from
/// the first and last page timestamps observed while the file was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFileInfo {
    pub path: PathBuf,
    pub start_ms: u64,
    pub end_ms: u64,
    pub size_bytes: u64,
    /// Produced by the currently running session (cleared on refresh).
    pub fresh: bool,
}

impl TraceFileInfo {
    pub fn span_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

pub fn trace_file_name(start_ms: u64, end_ms: u64, cache: bool) -> String {
    let prefix = if cache { CACHE_FILE_PREFIX } else { "" };
    format!("{}{}{}_{}{}", prefix, TRACE_FILE_STEM, start_ms, end_ms, TRACE_FILE_SUFFIX)
}

/// Parse `trace_<startMs>_<endMs>.sys` / `cache_trace_<startMs>_<endMs>.sys`.
pub fn parse_trace_file_name(name: &str) -> Option<(u64, u64, bool)> {
    let (cache, rest) = match name.strip_prefix(CACHE_FILE_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let rest = rest.strip_prefix(TRACE_FILE_STEM)?;
    let rest = rest.strip_suffix(TRACE_FILE_SUFFIX)?;
    let (start, end) = rest.split_once('_')?;
    let start_ms = start.parse::<u64>().ok()?;
    let end_ms = end.parse::<u64>().ok()?;
    if start_ms > end_ms {
        return None;
    }
    Some((start_ms, end_ms, cache))
}

/// Which capture mode a pool serves; decides the filename prefix the
/// refresh scan accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Snapshot,
    Record,
    Cache,
}

/// In-memory index of one on-disk trace pool, sorted by start time.
#[derive(Debug)]
pub struct TracePool {
    dir: PathBuf,
    kind: PoolKind,
    files: Vec<TraceFileInfo>,
}

impl TracePool {
    pub fn new(dir: &Path, kind: PoolKind) -> TracePool {
        TracePool {
            dir: dir.to_path_buf(),
            kind,
            files: Vec::new(),
        }
    }

    pub fn files(&self) -> &[TraceFileInfo] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Rebuild the index from filesystem truth. Entries with a span past
    /// the corruption guard are skipped.
    pub fn refresh(&mut self) {
        self.files.clear();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((start_ms, end_ms, cache)) = parse_trace_file_name(name) else {
                continue;
            };
            if cache != (self.kind == PoolKind::Cache) {
                continue;
            }
            if end_ms - start_ms >= MAX_FILE_SPAN_MS {
                log::warn!("skipping {} with corrupt time span", name);
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            self.files.push(TraceFileInfo {
                path: entry.path(),
                start_ms,
                end_ms,
                size_bytes,
                fresh: false,
            });
        }
        self.files.sort_by_key(|f| f.start_ms);
    }

    pub fn append(&mut self, info: TraceFileInfo) {
        self.files.push(info);
        self.files.sort_by_key(|f| f.start_ms);
    }

    fn remove_file(info: &TraceFileInfo) {
        match fs::remove_file(&info.path) {
            Ok(()) => log::info!("deleted old trace file {}", info.path.display()),
            Err(e) => log::warn!("delete {} failed: {}", info.path.display(), e),
        }
    }

    /// Keep at most `limit` files, discarding the oldest.
    pub fn age_by_count(&mut self, limit: usize) {
        while self.files.len() > limit {
            let oldest = self.files.remove(0);
            Self::remove_file(&oldest);
        }
    }

    /// Discard oldest files until the summed size fits `budget_bytes`.
    pub fn age_by_total_size(&mut self, budget_bytes: u64) {
        while self.total_size_bytes() > budget_bytes && !self.files.is_empty() {
            let oldest = self.files.remove(0);
            Self::remove_file(&oldest);
        }
    }

    /// Discard files whose end time fell out of the retention window.
    pub fn age_by_duration(&mut self, now_ms: u64, retention_ms: u64) {
        let cutoff = now_ms.saturating_sub(retention_ms);
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.files.drain(..).partition(|f| f.end_ms < cutoff);
        for info in &expired {
            Self::remove_file(info);
        }
        self.files = kept;
    }

    /// Paths of the files produced by the current session, clearing the
    /// markers.
    pub fn take_fresh(&mut self) -> Vec<PathBuf> {
        let mut fresh = Vec::new();
        for file in &mut self.files {
            if file.fresh {
                file.fresh = false;
                fresh.push(file.path.clone());
            }
        }
        fresh
    }

    /// Indices of files intersecting `[start - tol, end + tol]`, oldest first,
    /// with the summed covered duration clipped to the window.
    pub fn find_overlapping(&self, start_ms: u64, end_ms: u64) -> (Vec<usize>, u64) {
        let lo = start_ms.saturating_sub(OVERLAP_TOLERANCE_MS);
        let hi = end_ms.saturating_add(OVERLAP_TOLERANCE_MS);
        let mut hits = Vec::new();
        let mut covered_ms = 0;
        for (idx, file) in self.files.iter().enumerate() {
            if file.span_ms() >= MAX_FILE_SPAN_MS {
                continue;
            }
            if file.end_ms < lo || file.start_ms > hi {
                continue;
            }
            hits.push(idx);
            let clip_start = file.start_ms.max(start_ms);
            let clip_end = file.end_ms.min(end_ms);
            covered_ms += clip_end.saturating_sub(clip_start);
        }
        (hits, covered_ms)
    }

    /// Move a cache file into the snapshot pool, stripping its prefix on
    /// disk. The caller supplies the index returned by `find_overlapping`.
    pub fn migrate_to(&mut self, idx: usize, snapshot_pool: &mut TracePool) -> bool {
        let info = &self.files[idx];
        let target_name = trace_file_name(info.start_ms, info.end_ms, false);
        let target = snapshot_pool.dir.join(&target_name);
        if let Err(e) = fs::rename(&info.path, &target) {
            log::error!("migrate {} failed: {}", info.path.display(), e);
            return false;
        }
        let mut info = self.files.remove(idx);
        log::info!("migrated {} to {}", info.path.display(), target.display());
        info.path = target;
        snapshot_pool.append(info);
        true
    }
}
