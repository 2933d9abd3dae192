//! End-to-end snapshot dump against a fake tracing root. The dump forks a
//! child process, so this scenario lives alone in its own test binary.

mod common;

use tracedump::{TraceDumper, TraceErrorCode, TraceMode};

#[test]
fn snapshot_dump_produces_a_valid_container() {
    let trace_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    common::fake_tracefs(trace_dir.path(), 2);
    common::seed_pipe(
        trace_dir.path(),
        0,
        &[
            common::fake_page(1_000, 3000),
            common::fake_page(2_000, 3000),
            common::fake_page(3_000, 3000),
        ],
    );
    common::seed_pipe(
        trace_dir.path(),
        1,
        &[common::fake_page(1_500, 3000), common::fake_page(2_500, 3000)],
    );

    let dumper = TraceDumper::builder(common::test_registry())
        .trace_root(trace_dir.path())
        .output_dir(out_dir.path())
        .config(common::test_config())
        .build();
    assert_eq!(dumper.open(&["scene_performance"]), TraceErrorCode::Success);
    assert_eq!(dumper.mode(), TraceMode::OPEN);

    let ret = dumper.dump(0, 0);
    assert_eq!(ret.error_code, TraceErrorCode::Success);
    assert_eq!(ret.output_files.len(), 1);
    assert_eq!(ret.mode, TraceMode::OPEN);

    let file = &ret.output_files[0];
    let name = file.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("trace_") && name.ends_with(".sys"), "bad name {}", name);

    let summary = common::validate_container(file);
    assert_eq!(summary.file_type, 0);
    // reserved carries the cpu count in its upper bits
    assert_eq!(summary.reserved >> 1, 2);
    // one raw section per cpu, carrying exactly the seeded pages
    let raw0 = summary.sections.iter().find(|(t, _)| *t == 4).unwrap();
    let raw1 = summary.sections.iter().find(|(t, _)| *t == 5).unwrap();
    assert_eq!(raw0.1 as usize, 3 * common::PAGE_SIZE);
    assert_eq!(raw1.1 as usize, 2 * common::PAGE_SIZE);

    assert_eq!(dumper.close(), TraceErrorCode::Success);
    assert_eq!(dumper.mode(), TraceMode::CLOSE);
}
