use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::params::TraceParams;
use crate::properties;
use crate::tags::{TagKind, TagRegistry};
use crate::utils;

const DEBUGFS_TRACE_ROOT: &str = "/sys/kernel/debug/tracing/";
const TRACEFS_TRACE_ROOT: &str = "/sys/kernel/tracing/";
const SAVED_CMDLINES_SIZE: u32 = 3072;

/// Handle on the tracing pseudo-filesystem. All kernel programming goes
/// through this one type; tests point it at a fake root.
#[derive(Debug, Clone)]
pub struct TraceSysfs {
    root: PathBuf,
}

impl TraceSysfs {
    /// Probe the two well-known mount points for a usable tracing root.
    /// The `trace_marker` node is the probe target: it exists on every
    /// kernel that has the tracing subsystem compiled in.
    pub fn probe() -> Option<TraceSysfs> {
        for root in [DEBUGFS_TRACE_ROOT, TRACEFS_TRACE_ROOT] {
            if Path::new(root).join("trace_marker").exists() {
                return Some(TraceSysfs {
                    root: PathBuf::from(root),
                });
            }
        }
        log::error!("did not find a mounted trace folder");
        None
    }

    /// Use an explicit root instead of probing. The caller is responsible
    /// for the root actually containing a `trace_marker` node.
    pub fn at(root: &Path) -> Option<TraceSysfs> {
        if root.join("trace_marker").exists() {
            Some(TraceSysfs {
                root: root.to_path_buf(),
            })
        } else {
            log::error!("{} is not a trace root", root.display());
            None
        }
    }

    pub fn node(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn read_node(&self, name: &str) -> String {
        fs::read_to_string(self.node(name)).unwrap_or_default()
    }

    pub fn write_node(&self, name: &str, value: &str) -> bool {
        let path = self.node(name);
        let file = OpenOptions::new().write(true).truncate(true).open(&path);
        let result = file.and_then(|mut f| f.write_all(value.as_bytes()));
        if let Err(e) = result {
            log::error!("write {} to {} failed: {}", value, path.display(), e);
            return false;
        }
        true
    }

    fn set_node(&self, name: &str, enabled: bool) -> bool {
        self.write_node(name, if enabled { "1" } else { "0" })
    }

    /// Clear the ring buffer by truncating the `trace` node.
    pub fn truncate_trace(&self) -> bool {
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.node("trace"))
        {
            Ok(_) => true,
            Err(e) => {
                log::error!("clear old trace failed: {}", e);
                false
            }
        }
    }

    /// Append one line to the trace-marker node, injecting an event into
    /// the ring buffer.
    pub fn write_marker(&self, line: &str) -> bool {
        let file = OpenOptions::new().write(true).open(self.node("trace_marker"));
        match file.and_then(|mut f| f.write_all(line.as_bytes())) {
            Ok(()) => true,
            Err(e) => {
                log::error!("trace_marker write failed: {}", e);
                false
            }
        }
    }

    /// Emit a marker pairing the wall clock with the monotonic clock so a
    /// parser can align both domains.
    pub fn mark_clock_sync(&self) -> bool {
        let realtime_ms = utils::wall_now_ms();
        let parent_ns = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(|ts| ts.tv_sec() as u64 * utils::S_TO_NS + ts.tv_nsec() as u64)
            .unwrap_or(0);
        let line = format!(
            "trace_event_clock_sync: realtime_ts={}\ntrace_event_clock_sync: parent_ts={}.{:06}\n",
            realtime_ms,
            parent_ns / utils::S_TO_NS,
            (parent_ns % utils::S_TO_NS) / 1000,
        );
        self.write_marker(&line)
    }

    /*
    trace_clock:
        Whenever an event is recorded into the ring buffer, a
        "timestamp" is added. The stamp comes from a specified clock;
        reading the node lists every available clock with the current
        one in brackets, e.g. "local global [boot]".
     */
    pub fn set_clock(&self, clock_type: &str) -> bool {
        let requested = if clock_type.is_empty() { "boot" } else { clock_type };
        let available = self.read_node("trace_clock");
        if !available.contains(requested) {
            log::error!("clock {} is non-existent, set to boot", requested);
            return self.write_node("trace_clock", "boot");
        }
        for token in available.split_whitespace() {
            if token == requested {
                return self.write_node("trace_clock", requested);
            }
            // current selection; no write needed when it already matches
            if token.len() > 2 && token.starts_with('[') && &token[1..token.len() - 1] == requested
            {
                return true;
            }
        }
        log::info!("unknown clock {}, changed to default boot", requested);
        self.write_node("trace_clock", "boot")
    }

    /// Wind every capture control back to the idle state: all event
    /// enables zeroed, the user-tag property cleared, the buffer shrunk
    /// and writing stopped.
    pub fn disable_all(&self, registry: &TagRegistry) -> bool {
        for tag in registry.tags() {
            if tag.kind != TagKind::Kernel {
                continue;
            }
            for path in &tag.enable_paths {
                if self.node(path).exists() {
                    self.set_node(path, false);
                }
            }
        }
        properties::set_property(properties::KEY_USER_TAGS, "0");
        self.write_node("buffer_size_kb", "1");
        self.set_node("tracing_on", false)
    }

    /// Program a capture session: enable the selected tags, then size and
    /// start the buffer. Returns false as soon as a required node write
    /// fails.
    pub fn program(&self, params: &TraceParams, registry: &TagRegistry) -> bool {
        let mut user_tag_bits: u64 = 0;
        for name in registry.expand(params) {
            let Some(tag) = registry.tag(&name) else {
                log::error!("tag {} is invalid", name);
                continue;
            };
            match tag.kind {
                TagKind::User => user_tag_bits |= tag.bit,
                TagKind::Kernel => {
                    for path in &tag.enable_paths {
                        if self.node(path).exists() {
                            self.set_node(path, true);
                        }
                    }
                }
            }
        }
        properties::set_property(properties::KEY_USER_TAGS, &user_tag_bits.to_string());

        let mut ok = true;
        ok &= self.write_node("current_tracer", "nop");
        ok &= self.write_node("buffer_size_kb", &params.buffer_size_kb.to_string());
        ok &= self.set_clock(&params.clock_type);
        ok &= self.set_node("options/overwrite", params.overwrite);
        ok &= self.write_node("saved_cmdlines_size", &SAVED_CMDLINES_SIZE.to_string());
        ok &= self.set_node("options/record-tgid", true);
        ok &= self.set_node("options/record-cmd", true);
        if !ok {
            return false;
        }
        self.set_node("tracing_on", true)
    }

    pub fn tracing_on(&self) -> bool {
        self.read_node("tracing_on").starts_with('1')
    }

    /// Kernels with an aggregated raw pipe expose `trace_pipe_raw` at the
    /// root instead of the per-CPU tree.
    pub fn is_aggregated(&self) -> bool {
        self.node("trace_pipe_raw").exists() && !self.node("per_cpu").exists()
    }

    /// Number of `per_cpu/cpuN` directories; falls back to the scheduler's
    /// view when the tree is absent.
    pub fn cpu_count(&self) -> usize {
        let mut count = 0;
        while self.node(&format!("per_cpu/cpu{}", count)).exists() {
            count += 1;
        }
        if count == 0 {
            count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        }
        count
    }

    pub fn per_cpu_raw(&self, cpu: usize) -> PathBuf {
        self.node(&format!("per_cpu/cpu{}/trace_pipe_raw", cpu))
    }

    pub fn aggregated_raw(&self) -> PathBuf {
        self.node("trace_pipe_raw")
    }

    pub fn per_cpu_stats(&self, cpu: usize) -> PathBuf {
        self.node(&format!("per_cpu/cpu{}/stats", cpu))
    }

    pub fn per_cpu_buffer_size(&self, cpu: usize) -> String {
        format!("per_cpu/cpu{}/buffer_size_kb", cpu)
    }
}

/// Build a fake tracing root for tests: every node the engine touches,
/// plus `cpus` per-CPU directories with empty raw pipes.
#[cfg(test)]
pub(crate) fn fake_tracefs(root: &Path, cpus: usize) -> TraceSysfs {
    use std::fs::create_dir_all;

    create_dir_all(root).unwrap();
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
    create_dir_all(root.join("options")).unwrap();
    for node in ["options/overwrite", "options/record-tgid", "options/record-cmd"] {
        fs::write(root.join(node), "0").unwrap();
    }
    create_dir_all(root.join("events")).unwrap();
    fs::write(root.join("events/header_page"), "field: u64 timestamp;\n").unwrap();
    for event in ["sched/sched_switch", "sched/sched_wakeup", "power/cpu_frequency", "power/cpu_idle"] {
        let dir = root.join("events").join(event);
        create_dir_all(&dir).unwrap();
        fs::write(dir.join("enable"), "0").unwrap();
        fs::write(dir.join("format"), format!("name: {}\n", event)).unwrap();
    }
    for cpu in 0..cpus {
        let dir = root.join(format!("per_cpu/cpu{}", cpu));
        create_dir_all(&dir).unwrap();
        fs::write(dir.join("trace_pipe_raw"), "").unwrap();
        fs::write(dir.join("stats"), "entries: 0\nbytes: 0\n").unwrap();
        fs::write(dir.join("buffer_size_kb"), "1024").unwrap();
    }
    TraceSysfs::at(root).unwrap()
}
