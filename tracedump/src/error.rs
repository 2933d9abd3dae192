use std::fmt;
use std::path::PathBuf;

use crate::mode::TraceMode;

/// Error taxonomy returned by the coordinator. Codes are stable u8 values:
/// the snapshot child reports its status over a pipe as one of these bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceErrorCode {
    Success = 0,
    TraceNotSupported = 1,
    TraceIsOccupied = 2,
    TagError = 3,
    FileError = 4,
    WriteTraceInfoError = 5,
    WrongTraceMode = 6,
    OutOfTime = 7,
    ForkError = 8,
    InvalidMaxDuration = 9,
    EpollWaitError = 10,
    PipeCreateError = 11,
    SysinfoReadFailure = 12,
    Unset = 255,
}

impl TraceErrorCode {
    pub fn from_u8(value: u8) -> TraceErrorCode {
        match value {
            0 => TraceErrorCode::Success,
            1 => TraceErrorCode::TraceNotSupported,
            2 => TraceErrorCode::TraceIsOccupied,
            3 => TraceErrorCode::TagError,
            4 => TraceErrorCode::FileError,
            5 => TraceErrorCode::WriteTraceInfoError,
            6 => TraceErrorCode::WrongTraceMode,
            7 => TraceErrorCode::OutOfTime,
            8 => TraceErrorCode::ForkError,
            9 => TraceErrorCode::InvalidMaxDuration,
            10 => TraceErrorCode::EpollWaitError,
            11 => TraceErrorCode::PipeCreateError,
            12 => TraceErrorCode::SysinfoReadFailure,
            _ => TraceErrorCode::Unset,
        }
    }

    pub fn is_success(self) -> bool {
        self == TraceErrorCode::Success
    }
}

impl fmt::Display for TraceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TraceErrorCode::Success => "success",
            TraceErrorCode::TraceNotSupported => "trace pseudo filesystem is not mounted",
            TraceErrorCode::TraceIsOccupied => "trace buffer is occupied by another client",
            TraceErrorCode::TagError => "unknown trace tag or tag group",
            TraceErrorCode::FileError => "trace node or output file access failed",
            TraceErrorCode::WriteTraceInfoError => "trace file was not produced",
            TraceErrorCode::WrongTraceMode => "operation is not legal in the current mode",
            TraceErrorCode::OutOfTime => "no trace data inside the requested time window",
            TraceErrorCode::ForkError => "fork of the dump child failed",
            TraceErrorCode::InvalidMaxDuration => "max duration is negative",
            TraceErrorCode::EpollWaitError => "dump child did not answer in time",
            TraceErrorCode::PipeCreateError => "status pipe creation failed",
            TraceErrorCode::SysinfoReadFailure => "system clock read failed",
            TraceErrorCode::Unset => "unset",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for TraceErrorCode {}

/// Result record handed back by the file-producing entry points.
/// `output_files` may be non-empty even when `error_code` is not
/// `Success`, e.g. a cache fast path that only partially covers the
/// requested window.
#[derive(Debug, Clone)]
pub struct TraceRetInfo {
    pub error_code: TraceErrorCode,
    pub output_files: Vec<PathBuf>,
    /// Window duration actually covered by `output_files`, in ms.
    pub coverage_duration_ms: u64,
    /// Covered / requested duration, in permille, clamped to 1000.
    pub coverage_ratio: u32,
    pub mode: TraceMode,
}

impl TraceRetInfo {
    pub fn error(code: TraceErrorCode, mode: TraceMode) -> TraceRetInfo {
        TraceRetInfo {
            error_code: code,
            output_files: Vec::new(),
            coverage_duration_ms: 0,
            coverage_ratio: 0,
            mode,
        }
    }
}
