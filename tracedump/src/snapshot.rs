use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult};

use crate::container::{ContainerWriter, TimeWindow, WriterOptions};
use crate::error::TraceErrorCode;
use crate::sysfs::TraceSysfs;
use crate::utils;

/// Deadline for the child to deliver its status triple.
const CHILD_WAIT_TIMEOUT_MS: u16 = 10_000;
/// Settling time after the clock-sync marker before the drain starts.
const MARKER_SETTLE: Duration = Duration::from_millis(10);
/// Status byte plus the first and last page timestamps.
const STATUS_RECORD_LEN: usize = 17;

/// Resolved capture window of one dump call, in both clock domains.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DumpWindow {
    pub boot: TimeWindow,
    pub wall_start_ms: u64,
    pub wall_end_ms: u64,
    /// Requested span in ms when the caller bounded the duration.
    pub committed_ms: Option<u64>,
}

/// Translate the caller's wall-clock request into a boot-clock window.
/// `end_time_wall` of zero means "now"; a future end time is clamped.
pub(crate) fn compute_window(
    max_duration: i64,
    end_time_wall: u64,
) -> Result<DumpWindow, TraceErrorCode> {
    if max_duration < 0 {
        log::error!("illegal max duration {}", max_duration);
        return Err(TraceErrorCode::InvalidMaxDuration);
    }
    let wall_now = utils::wall_now_secs();
    let boot_now_ns = utils::boot_now_ns().ok_or(TraceErrorCode::SysinfoReadFailure)?;
    let boot_epoch = wall_now.saturating_sub(boot_now_ns / utils::S_TO_NS);

    let end_wall = if end_time_wall == 0 || end_time_wall > wall_now {
        if end_time_wall > wall_now {
            log::warn!("end time {} is later than now, clamped", end_time_wall);
        }
        wall_now
    } else {
        end_time_wall
    };
    if end_wall <= boot_epoch {
        log::error!("end time {} is earlier than boot time {}", end_wall, boot_epoch);
        return Err(TraceErrorCode::OutOfTime);
    }

    // second-granularity input: one extra second of tolerance at the end
    let end_boot_ns = (end_wall - boot_epoch + 1) * utils::S_TO_NS;
    let max_duration = max_duration as u64;
    let start_boot_ns = if max_duration > 0 {
        end_boot_ns.saturating_sub(max_duration * utils::S_TO_NS)
    } else {
        0
    };

    let wall_end_ms = end_wall * 1000;
    let wall_start_ms = if max_duration > 0 {
        wall_end_ms.saturating_sub(max_duration * 1000)
    } else {
        0
    };
    Ok(DumpWindow {
        boot: TimeWindow {
            start_ns: start_boot_ns,
            end_ns: end_boot_ns,
        },
        wall_start_ms,
        wall_end_ms,
        committed_ms: (max_duration > 0).then(|| max_duration * 1000),
    })
}

/// What the child reports back over the pipe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DumpOutcome {
    pub status: TraceErrorCode,
    pub first_page_ts: u64,
    pub last_page_ts: u64,
}

extern "C" fn timeout_signal_handler(signum: libc::c_int) {
    if signum == libc::SIGUSR1 {
        unsafe { libc::_exit(0) };
    }
}

/// One-shot snapshot through a short-lived child process. The drain runs
/// against kernel pseudo-files whose failure modes are not safe to handle
/// in-process; the parent only waits on a pipe with a bounded deadline.
/// On success the raw container is left at `out_path` for the caller to
/// seal and index.
pub(crate) fn dump_in_child(
    sysfs: &TraceSysfs,
    output_dir: &Path,
    out_path: &Path,
    window: TimeWindow,
) -> Result<DumpOutcome, TraceErrorCode> {
    let (pipe_read, pipe_write) = pipe().map_err(|e| {
        log::error!("pipe creation error: {}", e);
        TraceErrorCode::PipeCreateError
    })?;

    match unsafe { fork() } {
        Err(e) => {
            log::error!("fork error: {}", e);
            Err(TraceErrorCode::ForkError)
        }
        Ok(ForkResult::Child) => {
            drop(pipe_read);
            unsafe {
                let _ = signal(Signal::SIGUSR1, SigHandler::Handler(timeout_signal_handler));
            }
            utils::set_process_name("TraceDumpChild");
            sysfs.mark_clock_sync();
            thread::sleep(MARKER_SETTLE);

            let status = child_write_container(sysfs, output_dir, out_path, window);
            let mut record = [0u8; STATUS_RECORD_LEN];
            record[0] = status.status as u8;
            record[1..9].copy_from_slice(&status.first_page_ts.to_le_bytes());
            record[9..17].copy_from_slice(&status.last_page_ts.to_le_bytes());
            let mut pipe_file = File::from(pipe_write);
            let _ = pipe_file.write_all(&record);
            unsafe { libc::_exit(0) };
        }
        Ok(ForkResult::Parent { child }) => {
            drop(pipe_write);
            let mut pipe_file = File::from(pipe_read);
            if !wait_for_child(&pipe_file, child) {
                return Err(TraceErrorCode::EpollWaitError);
            }
            let mut record = [0u8; STATUS_RECORD_LEN];
            let read_ok = pipe_file.read_exact(&mut record).is_ok();
            if waitpid(child, None).is_err() {
                log::error!("waiting for dump child {} failed", child);
            }
            if !read_ok {
                log::error!("dump child status record was truncated");
                return Err(TraceErrorCode::WriteTraceInfoError);
            }
            Ok(DumpOutcome {
                status: TraceErrorCode::from_u8(record[0]),
                first_page_ts: u64::from_le_bytes(record[1..9].try_into().unwrap()),
                last_page_ts: u64::from_le_bytes(record[9..17].try_into().unwrap()),
            })
        }
    }
}

fn child_write_container(
    sysfs: &TraceSysfs,
    output_dir: &Path,
    out_path: &Path,
    window: TimeWindow,
) -> DumpOutcome {
    let failed = DumpOutcome {
        status: TraceErrorCode::FileError,
        first_page_ts: 0,
        last_page_ts: 0,
    };
    let opts = WriterOptions {
        window,
        size_cap_bytes: None,
        aggregated: sysfs.is_aggregated(),
        cpu_count: sysfs.cpu_count(),
    };
    let mut writer = match ContainerWriter::create(out_path, sysfs, output_dir, opts) {
        Ok(w) => w,
        Err(e) => {
            log::error!("open {} failed: {}", out_path.display(), e);
            return failed;
        }
    };
    if !writer.write_preamble() {
        return failed;
    }
    if !writer.write_cpu_raw() {
        return failed;
    }
    writer.write_trailing();
    if writer.sync().is_err() {
        return failed;
    }
    let (first_page_ts, last_page_ts) = writer.page_ts_range();
    DumpOutcome {
        status: writer.status(),
        first_page_ts,
        last_page_ts,
    }
}

/// Block on the pipe with a deadline. A silent child is escalated to
/// SIGUSR1 and reaped without blocking.
fn wait_for_child(pipe_file: &File, child: nix::unistd::Pid) -> bool {
    let ready = epoll_wait_readable(pipe_file, CHILD_WAIT_TIMEOUT_MS);
    if !ready {
        log::error!("dump child {} did not answer, killing it", child);
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => {
                let _ = kill(child, Signal::SIGUSR1);
                let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
            }
            Ok(_) => {}
        }
        return false;
    }
    true
}

fn epoll_wait_readable(file: &File, timeout_ms: u16) -> bool {
    let epoll = match Epoll::new(EpollCreateFlags::empty()) {
        Ok(e) => e,
        Err(e) => {
            log::error!("epoll_create error: {}", e);
            return false;
        }
    };
    if let Err(e) = epoll.add(file, EpollEvent::new(EpollFlags::EPOLLIN, 0)) {
        log::error!("epoll_ctl error: {}", e);
        return false;
    }
    let mut events = [EpollEvent::empty()];
    loop {
        match epoll.wait(&mut events, EpollTimeout::from(timeout_ms)) {
            Ok(n) => return n > 0,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::error!("epoll_wait error: {}", e);
                return false;
            }
        }
    }
}
