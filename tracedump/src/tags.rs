use std::collections::{BTreeSet, HashMap};

use crate::params::TraceParams;

/// Where a tag takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// A bit in the user-space tag bitmask property.
    User,
    /// One or more ftrace event enable nodes.
    Kernel,
}

#[derive(Debug, Clone)]
pub struct TagInfo {
    pub name: String,
    pub kind: TagKind,
    /// Bit value ORed into the user-tag property (user tags only).
    pub bit: u64,
    /// Enable nodes relative to the tracing root (kernel tags only),
    /// e.g. "events/sched/sched_switch/enable".
    pub enable_paths: Vec<String>,
}

impl TagInfo {
    pub fn user(name: &str, bit: u64) -> TagInfo {
        TagInfo {
            name: name.to_string(),
            kind: TagKind::User,
            bit,
            enable_paths: Vec::new(),
        }
    }

    pub fn kernel(name: &str, enable_paths: &[&str]) -> TagInfo {
        TagInfo {
            name: name.to_string(),
            kind: TagKind::Kernel,
            bit: 0,
            enable_paths: enable_paths.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Resolver from tag and group names to kernel enable nodes and user-tag
/// bits. The taxonomy itself is parsed elsewhere; the engine only consumes
/// a populated registry.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    tags: HashMap<String, TagInfo>,
    groups: HashMap<String, Vec<String>>,
}

impl TagRegistry {
    pub fn new() -> TagRegistry {
        TagRegistry::default()
    }

    pub fn add_tag(&mut self, tag: TagInfo) {
        self.tags.insert(tag.name.clone(), tag);
    }

    pub fn add_group(&mut self, name: &str, members: &[&str]) {
        self.groups
            .insert(name.to_string(), members.iter().map(|m| m.to_string()).collect());
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() || self.groups.is_empty()
    }

    pub fn tag(&self, name: &str) -> Option<&TagInfo> {
        self.tags.get(name)
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagInfo> {
        self.tags.values()
    }

    pub fn check_tags(&self, names: &[String]) -> bool {
        names.iter().all(|n| {
            let known = self.tags.contains_key(n);
            if !known {
                log::error!("tag {} is not provided", n);
            }
            known
        })
    }

    pub fn check_groups(&self, names: &[String]) -> bool {
        names.iter().all(|n| {
            let known = self.groups.contains_key(n);
            if !known {
                log::error!("tag group {} is not provided", n);
            }
            known
        })
    }

    /// Union of the explicit tags and the expanded groups of `params`.
    /// When any group is selected the "default" group is appended as well.
    pub fn expand(&self, params: &TraceParams) -> BTreeSet<String> {
        let mut ready: BTreeSet<String> = params.tags.iter().cloned().collect();
        if !params.tag_groups.is_empty() {
            match self.groups.get("default") {
                Some(members) => ready.extend(members.iter().cloned()),
                None => log::error!("default tag group is missing from the registry"),
            }
        }
        for group in &params.tag_groups {
            if let Some(members) = self.groups.get(group) {
                ready.extend(members.iter().cloned());
            }
        }
        ready
    }
}

#[cfg(test)]
pub(crate) fn test_registry() -> TagRegistry {
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
