#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tracedump::{ProductConfig, TagInfo, TagRegistry};

/// Build a fake tracing root with every node the engine touches and
/// `cpus` per-CPU directories with empty raw pipes.
pub fn fake_tracefs(root: &Path, cpus: usize) {
    fs::create_dir_all(root).unwrap();
    for node in [
        "trace_marker",
        "tracing_on",
        "buffer_size_kb",
        "current_tracer",
        "saved_cmdlines_size",
        "saved_cmdlines",
        "saved_tgids",
        "printk_formats",
        "trace",
    ] {
        fs::write(root.join(node), "").unwrap();
    }
    fs::write(root.join("trace_clock"), "local global [boot]\n").unwrap();
    fs::create_dir_all(root.join("options")).unwrap();
    for node in ["options/overwrite", "options/record-tgid", "options/record-cmd"] {
        fs::write(root.join(node), "0").unwrap();
    }
    fs::create_dir_all(root.join("events")).unwrap();
    fs::write(root.join("events/header_page"), "field: u64 timestamp;\n").unwrap();
    for event in [
        "sched/sched_switch",
        "sched/sched_wakeup",
        "power/cpu_frequency",
        "power/cpu_idle",
    ] {
        let dir = root.join("events").join(event);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("enable"), "0").unwrap();
        fs::write(dir.join("format"), format!("name: {}\n", event)).unwrap();
    }
    for cpu in 0..cpus {
        let dir = root.join(format!("per_cpu/cpu{}", cpu));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("trace_pipe_raw"), "").unwrap();
        fs::write(dir.join("stats"), "entries: 0\nbytes: 0\n").unwrap();
        fs::write(dir.join("buffer_size_kb"), "1024").unwrap();
    }
}

pub const PAGE_SIZE: usize = 4096;

/// One synthetic ring-buffer page: 8 B boot timestamp, 8 B payload size,
/// 1 B overwrite flag, zero padding.
pub fn fake_page(ts_ns: u64, payload_len: u64) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[0..8].copy_from_slice(&ts_ns.to_le_bytes());
    page[8..16].copy_from_slice(&payload_len.to_le_bytes());
    page
}

pub fn seed_pipe(root: &Path, cpu: usize, pages: &[Vec<u8>]) {
    let mut bytes = Vec::new();
    for page in pages {
        bytes.extend_from_slice(page);
    }
    fs::write(root.join(format!("per_cpu/cpu{}/trace_pipe_raw", cpu)), bytes).unwrap();
}

pub fn test_registry() -> TagRegistry {
    let mut registry = TagRegistry::new();
    registry.add_tag(TagInfo::user("app", 1 << 5));
    registry.add_tag(TagInfo::user("graphics", 1 << 6));
    registry.add_tag(TagInfo::kernel(
        "sched",
        &[
            "events/sched/sched_switch/enable",
            "events/sched/sched_wakeup/enable",
        ],
    ));
    registry.add_tag(TagInfo::kernel("freq", &["events/power/cpu_frequency/enable"]));
    registry.add_tag(TagInfo::kernel("idle", &["events/power/cpu_idle/enable"]));
    registry.add_group("default", &["app", "sched"]);
    registry.add_group("scene_performance", &["graphics", "freq", "idle"]);
    registry
}

/// Config suitable for sandboxed runs: no free-space requirement and a
/// retention window long enough that nothing ages out mid-test.
pub fn test_config() -> ProductConfig {
    let mut config = ProductConfig::default();
    config.free_space_floor_kb = 1;
    config.cache_retention_secs = 1_000_000;
    config
}

pub struct ContainerSummary {
    pub file_type: u8,
    pub reserved: u32,
    pub sections: Vec<(u8, u32)>,
}

/// Parse a container from byte 0 and check the framing invariants: the
/// magic and version match, and the section headers' lengths account for
/// every byte after the fixed file header.
pub fn validate_container(path: &Path) -> ContainerSummary {
    let bytes = fs::read(path).unwrap();
    assert!(bytes.len() >= tracedump::FILE_HEADER_LEN as usize, "truncated header");
    let magic = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
    assert_eq!(magic, tracedump::TRACE_MAGIC);
    assert_eq!(magic, 57161);
    let file_type = bytes[2];
    let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    assert_eq!(version, tracedump::TRACE_VERSION);
    let reserved = u32::from_le_bytes(bytes[8..12].try_into().unwrap());

    let mut sections = Vec::new();
    let mut pos = tracedump::FILE_HEADER_LEN as usize;
    while pos < bytes.len() {
        assert!(
            pos + tracedump::CONTENT_HEADER_LEN as usize <= bytes.len(),
            "dangling section header at {}",
            pos
        );
        let ty = bytes[pos];
        let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
        sections.push((ty, len));
        pos += tracedump::CONTENT_HEADER_LEN as usize + len as usize;
    }
    assert_eq!(pos, bytes.len(), "section lengths must sum to the file size");
    ContainerSummary {
        file_type,
        reserved,
        sections,
    }
}

/// Pool files (by prefix) currently on disk.
pub fn trace_files_in(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(prefix) && name.ends_with(".sys")
        })
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}
