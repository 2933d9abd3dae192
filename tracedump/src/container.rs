use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::TraceErrorCode;
use crate::pool::{self, TraceFileInfo};
use crate::sysfs::TraceSysfs;
use crate::utils;

pub const TRACE_MAGIC: u16 = 0xDF49; // 57161
pub const TRACE_VERSION: u16 = 2;
/// Standard container with one raw section per CPU.
pub const FILE_TYPE_RAW: u8 = 0;
/// Kernel variant with a single aggregated raw pipe.
pub const FILE_TYPE_AGGREGATED: u8 = 1;

pub const CONTENT_TYPE_EVENTS_FORMAT: u8 = 1;
pub const CONTENT_TYPE_CMDLINES: u8 = 2;
pub const CONTENT_TYPE_TGIDS: u8 = 3;
pub const CONTENT_TYPE_CPU_RAW: u8 = 4;
pub const CONTENT_TYPE_HEADER_PAGE: u8 = 30;
pub const CONTENT_TYPE_PRINTK_FORMATS: u8 = 31;
pub const CONTENT_TYPE_KALLSYMS: u8 = 32;
pub const CONTENT_TYPE_BASE_INFO: u8 = 33;

pub const PAGE_SIZE: usize = 4096;
/// 1 MiB staging buffer between the raw pipe and the output file.
const STAGING_SIZE: usize = 256 * PAGE_SIZE;
/// Pages below half a page signal a drained buffer; two in a row end the
/// section.
const PAGE_THRESHOLD: u64 = (PAGE_SIZE / 2) as u64;
const MAX_SHORT_PAGES: u32 = 2;
/// Fixed file header: u16 magic, u8 type, pad, u16 version, pad, u32 reserved.
pub const FILE_HEADER_LEN: u64 = 12;
/// Content header: u8 type, 3 pad bytes, u32 payload length.
pub const CONTENT_HEADER_LEN: u64 = 8;
const MAX_CPU_COUNT: u32 = 24;
/// The output file is re-checked for existence every Nth section write.
const EXIST_CHECK_INTERVAL: u32 = 10;

/// Memoized concatenation of the event format descriptors, rebuilt once
/// per open session inside the output directory.
pub const SAVED_EVENTS_FORMAT: &str = "saved_events_format";

/// Format descriptors bundled into every container, most useful first.
/// Absent events are skipped.
const PRIORITY_FORMATS: &[&str] = &[
    "events/sched/sched_wakeup/format",
    "events/sched/sched_switch/format",
    "events/sched/sched_blocked_reason/format",
    "events/power/cpu_frequency/format",
    "events/power/clock_set_rate/format",
    "events/power/cpu_frequency_limits/format",
    "events/power/cpu_idle/format",
    "events/block/block_bio_remap/format",
    "events/block/block_rq_issue/format",
    "events/block/block_rq_complete/format",
    "events/block/block_rq_insert/format",
    "events/ext4/ext4_da_write_begin/format",
    "events/ext4/ext4_da_write_end/format",
    "events/ext4/ext4_sync_file_enter/format",
    "events/ext4/ext4_sync_file_exit/format",
    "events/filemap/mm_filemap_add_to_page_cache/format",
    "events/filemap/mm_filemap_delete_from_page_cache/format",
    "events/workqueue/workqueue_execute_start/format",
    "events/workqueue/workqueue_execute_end/format",
    "events/irq/irq_handler_entry/format",
    "events/ftrace/print/format",
];

/// Half-open capture window in boot-clock nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow {
            start_ns: 0,
            end_ns: u64::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub window: TimeWindow,
    /// Per-file size cap in bytes; only raw sections are charged against
    /// it. None means uncut.
    pub size_cap_bytes: Option<u64>,
    pub aggregated: bool,
    pub cpu_count: usize,
}

fn content_header(content_type: u8, length: u32) -> [u8; CONTENT_HEADER_LEN as usize] {
    let mut buf = [0u8; CONTENT_HEADER_LEN as usize];
    buf[0] = content_type;
    buf[4..8].copy_from_slice(&length.to_le_bytes());
    buf
}

/// Streams kernel source files into one self-describing container file.
/// A writer produces exactly one file and is consumed by `finalize`.
pub struct ContainerWriter {
    file: File,
    path: PathBuf,
    sysfs: TraceSysfs,
    output_dir: PathBuf,
    opts: WriterOptions,
    staging: Vec<u8>,
    out_size: u64,
    first_page_ts: u64,
    last_page_ts: u64,
    status: TraceErrorCode,
    size_capped: bool,
    exist_check_tick: u32,
}

impl ContainerWriter {
    pub fn create(
        path: &Path,
        sysfs: &TraceSysfs,
        output_dir: &Path,
        opts: WriterOptions,
    ) -> io::Result<ContainerWriter> {
        let path = utils::canonicalize_path(path).unwrap_or_else(|| path.to_path_buf());
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)?;
        Ok(ContainerWriter {
            file,
            path,
            sysfs: sysfs.clone(),
            output_dir: output_dir.to_path_buf(),
            opts,
            staging: vec![0u8; STAGING_SIZE],
            out_size: 0,
            first_page_ts: u64::MAX,
            last_page_ts: 0,
            status: TraceErrorCode::Unset,
            size_capped: false,
            exist_check_tick: 0,
        })
    }

    pub fn status(&self) -> TraceErrorCode {
        self.status
    }

    /// First and last accepted page timestamps, boot-clock ns. Zeroes when
    /// no page was accepted.
    pub fn page_ts_range(&self) -> (u64, u64) {
        if self.first_page_ts == u64::MAX {
            (0, 0)
        } else {
            (self.first_page_ts, self.last_page_ts)
        }
    }

    pub fn size_capped(&self) -> bool {
        self.size_capped
    }

    /// Fixed header, base info and the memoized events format. Must come
    /// before any raw section.
    pub fn write_preamble(&mut self) -> bool {
        if let Err(e) = self.write_file_header() {
            log::error!("file header write failed: {}", e);
            return false;
        }
        self.write_base_info();
        self.write_events_format()
    }

    fn write_file_header(&mut self) -> io::Result<()> {
        let mut reserved: u32 = if cfg!(target_pointer_width = "32") { 1 } else { 0 };
        let cpus = (self.opts.cpu_count as u32).min(MAX_CPU_COUNT);
        reserved |= cpus << 1;
        let file_type = if self.opts.aggregated {
            FILE_TYPE_AGGREGATED
        } else {
            FILE_TYPE_RAW
        };
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        header[0..2].copy_from_slice(&TRACE_MAGIC.to_le_bytes());
        header[2] = file_type;
        header[4..6].copy_from_slice(&TRACE_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&reserved.to_le_bytes());
        self.file.write_all(&header)?;
        self.out_size += FILE_HEADER_LEN;
        Ok(())
    }

    fn write_section_from_buffer(&mut self, content_type: u8, payload: &[u8]) -> bool {
        let header = content_header(content_type, payload.len() as u32);
        let result = self
            .file
            .write_all(&header)
            .and_then(|_| self.file.write_all(payload));
        if let Err(e) = result {
            log::error!("section {} write failed: {}", content_type, e);
            return false;
        }
        self.out_size += CONTENT_HEADER_LEN + payload.len() as u64;
        true
    }

    fn write_base_info(&mut self) -> bool {
        let version = fs::read("/proc/version").unwrap_or_default();
        self.write_section_from_buffer(CONTENT_TYPE_BASE_INFO, &version)
    }

    /// Assemble `saved_events_format` from the priority descriptor list if
    /// it does not exist yet, then stream it as a section.
    pub fn write_events_format(&mut self) -> bool {
        let memo = self.output_dir.join(SAVED_EVENTS_FORMAT);
        if !memo.exists() {
            let mut out = match File::create(&memo) {
                Ok(f) => f,
                Err(e) => {
                    log::error!("create {} failed: {}", memo.display(), e);
                    return false;
                }
            };
            for rel in PRIORITY_FORMATS {
                let src = self.sysfs.node(rel);
                if let Ok(mut f) = File::open(&src) {
                    if let Err(e) = io::copy(&mut f, &mut out) {
                        log::warn!("copy {} failed: {}", src.display(), e);
                    }
                }
            }
            log::info!("saved events format to {}", memo.display());
        }
        self.write_section_from_file(CONTENT_TYPE_EVENTS_FORMAT, &memo, false)
    }

    /// Drain the raw pipes into per-CPU sections (or one aggregated
    /// section). Returns false when the output file needs regeneration or
    /// an unrecoverable write error occurred.
    pub fn write_cpu_raw(&mut self) -> bool {
        if self.opts.aggregated {
            let src = self.sysfs.aggregated_raw();
            if !self.write_section_from_file(CONTENT_TYPE_CPU_RAW, &src, true) {
                return false;
            }
        } else {
            for cpu in 0..self.opts.cpu_count {
                let src = self.sysfs.per_cpu_raw(cpu);
                let content_type = CONTENT_TYPE_CPU_RAW + cpu as u8;
                if !self.write_section_from_file(content_type, &src, true) {
                    return false;
                }
                if self.size_capped {
                    break;
                }
            }
        }
        true
    }

    /// Saved cmdlines, tgids and the descriptor sections that close a
    /// container. The kallsyms section is a placeholder and not emitted.
    pub fn write_trailing(&mut self) -> bool {
        let mut ok = true;
        ok &= self.write_section_from_file(CONTENT_TYPE_CMDLINES, &self.sysfs.node("saved_cmdlines"), false);
        ok &= self.write_section_from_file(CONTENT_TYPE_TGIDS, &self.sysfs.node("saved_tgids"), false);
        if !self.opts.aggregated {
            ok &= self.write_section_from_file(
                CONTENT_TYPE_HEADER_PAGE,
                &self.sysfs.node("events/header_page"),
                false,
            );
            ok &= self.write_section_from_file(
                CONTENT_TYPE_PRINTK_FORMATS,
                &self.sysfs.node("printk_formats"),
                false,
            );
        }
        ok
    }

    /// The output file can be unlinked underneath a long-running drain;
    /// notice within a bounded number of section writes.
    fn check_output_exists(&mut self) -> bool {
        self.exist_check_tick += 1;
        if self.exist_check_tick > EXIST_CHECK_INTERVAL {
            self.exist_check_tick = 0;
            if !self.path.exists() {
                log::info!("output file {} disappeared", self.path.display());
                return false;
            }
        }
        true
    }

    fn write_section_from_file(&mut self, content_type: u8, src: &Path, timed: bool) -> bool {
        if !self.check_output_exists() {
            return false;
        }
        let mut open_opts = OpenOptions::new();
        open_opts.read(true);
        if timed {
            open_opts.custom_flags(libc::O_NONBLOCK);
        }
        let src_file = match open_opts.open(src) {
            Ok(f) => f,
            Err(e) => {
                log::error!("open {} failed: {}", src.display(), e);
                return false;
            }
        };
        match self.stream_section(content_type, src_file, timed) {
            Ok(written) => {
                log::debug!("section {} from {}: {} bytes", content_type, src.display(), written);
                true
            }
            Err(e) => {
                log::error!("section {} from {} failed: {}", content_type, src.display(), e);
                false
            }
        }
    }

    /// Core streaming protocol: placeholder content header, payload in
    /// page-sized reads through the staging buffer, then the header is
    /// patched with the measured length.
    fn stream_section(&mut self, content_type: u8, mut src: File, timed: bool) -> io::Result<u64> {
        let header_pos = self.file.stream_position()?;
        self.file.write_all(&content_header(content_type, 0))?;
        let mut written: u64 = 0;
        let mut short_pages = 0u32;
        loop {
            let mut staged = 0usize;
            let mut end = false;
            while staged + PAGE_SIZE <= STAGING_SIZE {
                let n = match src.read(&mut self.staging[staged..staged + PAGE_SIZE]) {
                    Ok(0) => {
                        end = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        end = true;
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("source read ended: {}", e);
                        end = true;
                        break;
                    }
                };
                if timed && n >= 17 {
                    let page = &self.staging[staged..staged + 16];
                    let page_ts = u64::from_le_bytes(page[0..8].try_into().unwrap());
                    if page_ts > self.opts.window.end_ns {
                        // the raw buffer is roughly monotonic per CPU
                        end = true;
                        break;
                    }
                    if page_ts < self.opts.window.start_ns {
                        continue;
                    }
                    self.first_page_ts = self.first_page_ts.min(page_ts);
                    self.last_page_ts = self.last_page_ts.max(page_ts);
                    let page_len = u64::from_le_bytes(page[8..16].try_into().unwrap());
                    if page_len < PAGE_THRESHOLD {
                        short_pages += 1;
                    }
                    staged += n;
                    if short_pages >= MAX_SHORT_PAGES {
                        end = true;
                        break;
                    }
                } else {
                    staged += n;
                }
            }
            self.file.write_all(&self.staging[..staged])?;
            written += staged as u64;
            if timed && self.cap_would_overflow(written) {
                log::warn!("per-file size threshold reached, section closed");
                self.size_capped = true;
                break;
            }
            if end {
                break;
            }
        }
        let end_pos = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(header_pos))?;
        self.file.write_all(&content_header(content_type, written as u32))?;
        self.file.seek(SeekFrom::Start(end_pos))?;
        if timed {
            if written > 0 {
                self.status = TraceErrorCode::Success;
            } else if self.status == TraceErrorCode::Unset {
                self.status = TraceErrorCode::OutOfTime;
            }
        }
        self.out_size += written + CONTENT_HEADER_LEN;
        Ok(written)
    }

    fn cap_would_overflow(&self, pending: u64) -> bool {
        match self.opts.size_cap_bytes {
            Some(cap) => self.out_size + pending + CONTENT_HEADER_LEN >= cap,
            None => false,
        }
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Close the file and rename it to embed the observed page-time range.
    pub fn finalize(mut self, cache: bool) -> io::Result<TraceFileInfo> {
        self.file.sync_all()?;
        let (first_ts, last_ts) = self.page_ts_range();
        finalize_at(&self.path, &self.output_dir, first_ts, last_ts, cache)
    }

    /// Close the file under its explicit caller-supplied name, without the
    /// pool rename.
    pub fn finalize_in_place(mut self) -> io::Result<TraceFileInfo> {
        self.file.sync_all()?;
        let boot_epoch = utils::boot_epoch_ms().unwrap_or(0);
        let (first_ts, last_ts) = self.page_ts_range();
        let (start_ms, end_ms) = if first_ts == 0 && last_ts == 0 {
            let now = utils::wall_now_ms();
            (now, now)
        } else {
            (
                utils::boot_ns_to_wall_ms(first_ts, boot_epoch),
                utils::boot_ns_to_wall_ms(last_ts.max(first_ts), boot_epoch),
            )
        };
        let size_bytes = fs::metadata(&self.path)?.len();
        Ok(TraceFileInfo {
            path: self.path.clone(),
            start_ms,
            end_ms,
            size_bytes,
            fresh: true,
        })
    }

    /// Remove a partial output file.
    pub fn abort(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Rename a finished container to `trace_<startMs>_<endMs>.sys` (with the
/// cache prefix when asked) and index it. Timestamps are boot-clock ns;
/// zero means no page was captured and the current instant is used.
pub fn finalize_at(
    path: &Path,
    output_dir: &Path,
    first_page_ts: u64,
    last_page_ts: u64,
    cache: bool,
) -> io::Result<TraceFileInfo> {
    let boot_epoch = utils::boot_epoch_ms().unwrap_or(0);
    let (start_ms, end_ms) = if first_page_ts == 0 && last_page_ts == 0 {
        let now = utils::wall_now_ms();
        (now, now)
    } else {
        (
            utils::boot_ns_to_wall_ms(first_page_ts, boot_epoch),
            utils::boot_ns_to_wall_ms(last_page_ts.max(first_page_ts), boot_epoch),
        )
    };
    let target = output_dir.join(pool::trace_file_name(start_ms, end_ms, cache));
    fs::rename(path, &target)?;
    let size_bytes = fs::metadata(&target)?.len();
    log::info!("trace file sealed: {}", target.display());
    Ok(TraceFileInfo {
        path: target,
        start_ms,
        end_ms,
        size_bytes,
        fresh: true,
    })
}

/// Name for an in-flight container before its time range is known.
pub fn inflight_file_name(seq: u64) -> String {
    format!("trace_inflight_{}_{}.tmp", std::process::id(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fake_tracefs;

    /// Build one synthetic ring-buffer page: 8 B timestamp, 8 B payload
    /// size, 1 B overwrite flag, zero padding to PAGE_SIZE.
    pub(crate) fn fake_page(ts_ns: u64, payload_len: u64) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[0..8].copy_from_slice(&ts_ns.to_le_bytes());
        page[8..16].copy_from_slice(&payload_len.to_le_bytes());
        page[16] = 0;
        page
    }

    fn write_pipe(root: &Path, cpu: usize, pages: &[Vec<u8>]) {
        let path = root.join(format!("per_cpu/cpu{}/trace_pipe_raw", cpu));
        let mut bytes = Vec::new();
        for page in pages {
            bytes.extend_from_slice(page);
        }
        fs::write(path, bytes).unwrap();
    }

    fn default_opts(cpu_count: usize) -> WriterOptions {
        WriterOptions {
            window: TimeWindow::default(),
            size_cap_bytes: None,
            aggregated: false,
            cpu_count,
        }
    }

    fn read_sections(path: &Path) -> (u16, u16, Vec<(u8, u32)>) {
        let bytes = fs::read(path).unwrap();
        let magic = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let mut sections = Vec::new();
        let mut pos = FILE_HEADER_LEN as usize;
        while pos < bytes.len() {
            let ty = bytes[pos];
            let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
            sections.push((ty, len));
            pos += CONTENT_HEADER_LEN as usize + len as usize;
        }
        assert_eq!(pos, bytes.len(), "section lengths must account for the whole file");
        (magic, version, sections)
    }

    #[test]
    fn produces_a_well_formed_container() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 2);
        write_pipe(dir.path(), 0, &[fake_page(1_000, 3000), fake_page(2_000, 3000)]);
        write_pipe(dir.path(), 1, &[fake_page(1_500, 3000)]);

        let tmp = out.path().join(inflight_file_name(0));
        let mut writer = ContainerWriter::create(&tmp, &sysfs, out.path(), default_opts(2)).unwrap();
        assert!(writer.write_preamble());
        assert!(writer.write_cpu_raw());
        assert!(writer.write_trailing());
        assert_eq!(writer.status(), TraceErrorCode::Success);
        let info = writer.finalize(false).unwrap();

        let (magic, version, sections) = read_sections(&info.path);
        assert_eq!(magic, TRACE_MAGIC);
        assert_eq!(version, TRACE_VERSION);
        let types: Vec<u8> = sections.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            vec![
                CONTENT_TYPE_BASE_INFO,
                CONTENT_TYPE_EVENTS_FORMAT,
                CONTENT_TYPE_CPU_RAW,
                CONTENT_TYPE_CPU_RAW + 1,
                CONTENT_TYPE_CMDLINES,
                CONTENT_TYPE_TGIDS,
                CONTENT_TYPE_HEADER_PAGE,
                CONTENT_TYPE_PRINTK_FORMATS,
            ]
        );
        // both cpu0 pages and the single cpu1 page made it through
        assert_eq!(sections[2].1 as usize, 2 * PAGE_SIZE);
        assert_eq!(sections[3].1 as usize, PAGE_SIZE);
    }

    #[test]
    fn pages_outside_the_window_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 1);
        write_pipe(
            dir.path(),
            0,
            &[
                fake_page(100, 3000),   // before the window: skipped
                fake_page(5_000, 3000), // inside
                fake_page(6_000, 3000), // inside
                fake_page(99_999, 3000), // past the end: terminates
                fake_page(7_000, 3000),
            ],
        );
        let mut opts = default_opts(1);
        opts.window = TimeWindow {
            start_ns: 1_000,
            end_ns: 10_000,
        };
        let tmp = out.path().join(inflight_file_name(1));
        let mut writer = ContainerWriter::create(&tmp, &sysfs, out.path(), opts).unwrap();
        assert!(writer.write_preamble());
        assert!(writer.write_cpu_raw());
        assert_eq!(writer.page_ts_range(), (5_000, 6_000));
        assert!(writer.write_trailing());
        let info = writer.finalize(false).unwrap();
        let (_, _, sections) = read_sections(&info.path);
        let raw = sections.iter().find(|(t, _)| *t == CONTENT_TYPE_CPU_RAW).unwrap();
        assert_eq!(raw.1 as usize, 2 * PAGE_SIZE);
    }

    #[test]
    fn no_raw_bytes_marks_the_dump_out_of_time() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 1);
        write_pipe(dir.path(), 0, &[fake_page(50, 3000)]);
        let mut opts = default_opts(1);
        opts.window = TimeWindow {
            start_ns: 1_000_000,
            end_ns: 2_000_000,
        };
        let tmp = out.path().join(inflight_file_name(2));
        let mut writer = ContainerWriter::create(&tmp, &sysfs, out.path(), opts).unwrap();
        assert!(writer.write_preamble());
        assert!(writer.write_cpu_raw());
        assert_eq!(writer.status(), TraceErrorCode::OutOfTime);
        writer.abort();
        assert!(!tmp.exists());
    }

    #[test]
    fn two_short_pages_end_the_section() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 1);
        write_pipe(
            dir.path(),
            0,
            &[
                fake_page(1_000, 3000),
                fake_page(2_000, 100), // short
                fake_page(3_000, 100), // short: section ends here
                fake_page(4_000, 3000),
            ],
        );
        let tmp = out.path().join(inflight_file_name(3));
        let mut writer =
            ContainerWriter::create(&tmp, &sysfs, out.path(), default_opts(1)).unwrap();
        assert!(writer.write_preamble());
        assert!(writer.write_cpu_raw());
        let info = writer.finalize(false).unwrap();
        let (_, _, sections) = read_sections(&info.path);
        let raw = sections.iter().find(|(t, _)| *t == CONTENT_TYPE_CPU_RAW).unwrap();
        // the two short pages are kept, the page after them is not read
        assert_eq!(raw.1 as usize, 3 * PAGE_SIZE);
    }

    #[test]
    fn size_cap_closes_the_section_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 1);
        let pages: Vec<Vec<u8>> = (0..600).map(|i| fake_page(1_000 + i, 3000)).collect();
        write_pipe(dir.path(), 0, &pages);
        let mut opts = default_opts(1);
        opts.size_cap_bytes = Some(1024 * 1024); // one staging flush
        let tmp = out.path().join(inflight_file_name(4));
        let mut writer = ContainerWriter::create(&tmp, &sysfs, out.path(), opts).unwrap();
        assert!(writer.write_preamble());
        assert!(writer.write_cpu_raw());
        assert!(writer.size_capped());
        // the file still parses section by section
        let info = writer.finalize(false).unwrap();
        let (magic, _, _) = read_sections(&info.path);
        assert_eq!(magic, TRACE_MAGIC);
    }

    #[test]
    fn events_format_is_memoized_across_writers() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sysfs = fake_tracefs(dir.path(), 1);
        let tmp = out.path().join(inflight_file_name(5));
        let mut writer =
            ContainerWriter::create(&tmp, &sysfs, out.path(), default_opts(1)).unwrap();
        assert!(writer.write_preamble());
        writer.abort();
        let memo = out.path().join(SAVED_EVENTS_FORMAT);
        assert!(memo.exists());
        let first = fs::read(&memo).unwrap();
        assert!(!first.is_empty());
        // a second writer streams the memo instead of rebuilding it
        fs::write(dir.path().join("events/sched/sched_switch/format"), "changed\n").unwrap();
        let tmp = out.path().join(inflight_file_name(6));
        let mut writer =
            ContainerWriter::create(&tmp, &sysfs, out.path(), default_opts(1)).unwrap();
        assert!(writer.write_preamble());
        writer.abort();
        assert_eq!(fs::read(&memo).unwrap(), first);
    }
}
