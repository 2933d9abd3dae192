//! Recording and cache lifecycle scenarios against fake tracing roots.

mod common;

use std::thread;
use std::time::Duration;

use tracedump::{TraceDumper, TraceErrorCode, TraceMode};

fn dumper_pair() -> (tempfile::TempDir, tempfile::TempDir, TraceDumper) {
    let trace_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    common::fake_tracefs(trace_dir.path(), 2);
    let dumper = TraceDumper::builder(common::test_registry())
        .trace_root(trace_dir.path())
        .output_dir(out_dir.path())
        .config(common::test_config())
        .build();
    (trace_dir, out_dir, dumper)
}

#[test]
fn record_session_produces_capped_valid_files() {
    let (trace_dir, out_dir, dumper) = dumper_pair();
    common::seed_pipe(
        trace_dir.path(),
        0,
        &[common::fake_page(1_000, 3000), common::fake_page(2_000, 3000)],
    );

    // the arg parser must tolerate spaces after colons
    assert_eq!(
        dumper.open_args("tags: sched clockType: boot bufferSize:1024 overwrite: 1 fileSize:204800"),
        TraceErrorCode::Success
    );
    assert_eq!(dumper.record_on(), TraceErrorCode::Success);
    assert_eq!(dumper.mode(), TraceMode::OPEN | TraceMode::RECORD);

    thread::sleep(Duration::from_millis(1500));
    let ret = dumper.record_off();
    assert_eq!(ret.error_code, TraceErrorCode::Success);
    assert!(!ret.output_files.is_empty());
    assert_eq!(dumper.mode(), TraceMode::OPEN);

    for file in &ret.output_files {
        let summary = common::validate_container(file);
        assert!(!summary.sections.is_empty());
        let size = std::fs::metadata(file).unwrap().len();
        assert!(size <= 204800 * 1024, "file {} exceeds its cap", file.display());
    }

    assert_eq!(dumper.close(), TraceErrorCode::Success);
    // close winds the kernel state back
    let tracing_on = std::fs::read_to_string(trace_dir.path().join("tracing_on")).unwrap();
    assert_eq!(tracing_on, "0");
    drop(out_dir);
}

#[test]
fn cache_files_migrate_into_the_snapshot_pool_on_dump() {
    let (_trace_dir, out_dir, dumper) = dumper_pair();
    assert_eq!(dumper.open(&["scene_performance"]), TraceErrorCode::Success);
    assert_eq!(dumper.cache_on(0, 1), TraceErrorCode::Success);
    assert_eq!(dumper.mode(), TraceMode::OPEN | TraceMode::CACHE);

    // let a couple of one-second slices seal
    thread::sleep(Duration::from_millis(2_500));
    assert!(
        !common::trace_files_in(out_dir.path(), "cache_trace_").is_empty(),
        "no cache slice was sealed"
    );

    let ret = dumper.dump(0, 0);
    assert_eq!(ret.error_code, TraceErrorCode::Success);
    assert!(!ret.output_files.is_empty());
    for file in &ret.output_files {
        let name = file.file_name().unwrap().to_string_lossy();
        assert!(
            name.starts_with("trace_"),
            "migrated file {} kept its cache prefix",
            name
        );
        assert!(file.exists());
        common::validate_container(file);
    }

    assert_eq!(dumper.cache_off(), TraceErrorCode::Success);
    assert_eq!(dumper.mode(), TraceMode::OPEN);
    assert_eq!(dumper.close(), TraceErrorCode::Success);
}

#[test]
fn rejected_dump_leaves_no_file_behind() {
    let (_trace_dir, out_dir, dumper) = dumper_pair();
    assert_eq!(dumper.open(&["scene_performance"]), TraceErrorCode::Success);

    let ret = dumper.dump(-1, tracedump_now());
    assert_eq!(ret.error_code, TraceErrorCode::InvalidMaxDuration);
    assert!(ret.output_files.is_empty());
    assert!(common::trace_files_in(out_dir.path(), "trace_").is_empty());

    assert_eq!(dumper.close(), TraceErrorCode::Success);
}

#[test]
fn open_and_dump_are_refused_while_recording() {
    let (_trace_dir, _out_dir, dumper) = dumper_pair();
    assert_eq!(dumper.open(&["scene_performance"]), TraceErrorCode::Success);
    assert_eq!(dumper.record_on(), TraceErrorCode::Success);

    // a second client cannot reopen or snapshot a recording session
    assert_eq!(dumper.open(&["scene_performance"]), TraceErrorCode::WrongTraceMode);
    assert_eq!(dumper.cache_on(0, 0), TraceErrorCode::WrongTraceMode);
    let ret = dumper.dump(0, 0);
    assert_eq!(ret.error_code, TraceErrorCode::WrongTraceMode);

    let ret = dumper.record_off();
    assert_eq!(ret.error_code, TraceErrorCode::Success);
    assert_eq!(dumper.close(), TraceErrorCode::Success);
}

fn tracedump_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
