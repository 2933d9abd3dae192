use std::path::PathBuf;

use crate::config;
use crate::tags::TagRegistry;

/// Capture configuration, frozen for the lifetime of one open session.
#[derive(Debug, Clone)]
pub struct TraceParams {
    pub tags: Vec<String>,
    pub tag_groups: Vec<String>,
    pub buffer_size_kb: u32,
    pub clock_type: String,
    pub overwrite: bool,
    /// Explicit output path for uncut recording; pool naming otherwise.
    pub output_file: Option<PathBuf>,
    /// Per-file size cap in KB; 0 means the product default.
    pub file_size_kb: u64,
    /// Pool file-count cap; 0 means the product default.
    pub file_limit: usize,
    /// PID filter for application tracing; 0 means unset.
    pub app_pid: i32,
}

impl Default for TraceParams {
    fn default() -> Self {
        TraceParams {
            tags: Vec::new(),
            tag_groups: Vec::new(),
            buffer_size_kb: config::product().buffer_kb,
            clock_type: "boot".to_string(),
            overwrite: true,
            output_file: None,
            file_size_kb: 0,
            file_limit: 0,
            app_pid: 0,
        }
    }
}

/// Collapse "<symbol> " back to "<symbol>" so that arg strings written
/// with spaces after colons or commas still parse. Bounded to keep a
/// pathological input from looping.
fn remove_space_after(symbol: char, args: &mut String) {
    let needle = format!("{} ", symbol);
    let mut rounds = 0;
    while let Some(pos) = args.find(&needle) {
        args.replace_range(pos..pos + 2, &symbol.to_string());
        rounds += 1;
        if rounds >= 30 {
            break;
        }
    }
}

fn parse_pos_int(value: &str) -> u64 {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => {
            log::warn!("illegal numeric argument {:?}, treated as unset", value);
            0
        }
    }
}

/// Parse an open-args string of the form
/// `tags:tag1,tag2 tagGroups:g1 clockType:boot bufferSize:1024 overwrite:1
/// output:file fileSize:102400 fileLimit:15 appPid:42`.
/// Unknown keys and unknown tag/group names are rejected.
pub fn parse_args(args: &str, registry: &TagRegistry) -> Option<TraceParams> {
    let mut normalized = args.to_string();
    remove_space_after(':', &mut normalized);
    remove_space_after(',', &mut normalized);

    let mut params = TraceParams::default();
    for item in normalized.split_whitespace() {
        let Some((key, value)) = item.split_once(':') else {
            log::error!("argument without colon: {:?}, skipped", item);
            continue;
        };
        match key {
            "tags" => params.tags = value.split(',').map(str::to_string).collect(),
            "tagGroups" => params.tag_groups = value.split(',').map(str::to_string).collect(),
            "clockType" => params.clock_type = value.to_string(),
            "bufferSize" => params.buffer_size_kb = parse_pos_int(value) as u32,
            "overwrite" => params.overwrite = value != "0",
            "output" => params.output_file = Some(PathBuf::from(value)),
            "fileSize" => params.file_size_kb = parse_pos_int(value),
            "fileLimit" => params.file_limit = parse_pos_int(value) as usize,
            "appPid" => {
                params.app_pid = parse_pos_int(value) as i32;
                if params.app_pid == 0 {
                    log::error!("appPid {:?} must be a number greater than 0", value);
                    return None;
                }
            }
            _ => {
                log::error!("unknown trace argument {:?}", key);
                return None;
            }
        }
    }
    if params.buffer_size_kb == 0 {
        params.buffer_size_kb = config::product().buffer_kb;
    }
    if !registry.check_tags(&params.tags) || !registry.check_groups(&params.tag_groups) {
        return None;
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::test_registry;

    #[test]
    fn parses_a_full_argument_string() {
        let registry = test_registry();
        let params = parse_args(
            "tags:sched,freq clockType:boot bufferSize:1024 overwrite:1 fileSize:204800 fileLimit:10",
            &registry,
        )
        .unwrap();
        assert_eq!(params.tags, vec!["sched", "freq"]);
        assert_eq!(params.clock_type, "boot");
        assert_eq!(params.buffer_size_kb, 1024);
        assert!(params.overwrite);
        assert_eq!(params.file_size_kb, 204800);
        assert_eq!(params.file_limit, 10);
    }

    #[test]
    fn tolerates_spaces_after_colons_and_commas() {
        let registry = test_registry();
        let params = parse_args(
            "tags: sched, freq clockType: boot bufferSize:1024 overwrite: 1",
            &registry,
        )
        .unwrap();
        assert_eq!(params.tags, vec!["sched", "freq"]);
        assert_eq!(params.buffer_size_kb, 1024);
        assert!(params.overwrite);
    }

    #[test]
    fn rejects_unknown_keys_and_tags() {
        let registry = test_registry();
        assert!(parse_args("bogus:1", &registry).is_none());
        assert!(parse_args("tags:not_a_tag", &registry).is_none());
        assert!(parse_args("tagGroups:not_a_group", &registry).is_none());
    }

    #[test]
    fn zero_app_pid_is_an_error() {
        let registry = test_registry();
        assert!(parse_args("appPid:0", &registry).is_none());
        assert!(parse_args("appPid:abc", &registry).is_none());
        let params = parse_args("appPid:42", &registry).unwrap();
        assert_eq!(params.app_pid, 42);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let registry = test_registry();
        let params = parse_args("bufferSize:banana", &registry).unwrap();
        assert_eq!(params.buffer_size_kb, crate::config::product().buffer_kb);
        let params = parse_args("fileSize:-3", &registry).unwrap();
        assert_eq!(params.file_size_kb, 0);
    }
}
