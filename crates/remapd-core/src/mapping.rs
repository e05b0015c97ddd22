// Remapd Mapping Structures
// DeviceSelector, OutputAction, RemapRule, MappingTable

use std::collections::{HashMap, HashSet};

use evdev::Key;
use smallvec::SmallVec;

/// Identity selectors for the physical device of a configured group.
///
/// Any subset of the three fields may be present; a discovered device
/// matches only if every present field matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    /// Device name as reported by the kernel (EVIOCGNAME)
    pub input_name: Option<String>,
    /// Physical location string (EVIOCGPHYS)
    pub input_phys: Option<String>,
    /// Device node path, e.g. /dev/input/event5
    pub input_fn: Option<String>,
}

impl DeviceSelector {
    /// True if no selector field is present
    pub fn is_empty(&self) -> bool {
        self.input_name.is_none() && self.input_phys.is_none() && self.input_fn.is_none()
    }

    /// Check whether a discovered device matches every present selector
    pub fn matches(&self, name: Option<&str>, phys: Option<&str>, path: &str) -> bool {
        if let Some(want) = &self.input_name {
            if name != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.input_phys {
            if phys != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.input_fn {
            if path != want {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(name) = &self.input_name {
            parts.push(format!("name={name:?}"));
        }
        if let Some(phys) = &self.input_phys {
            parts.push(format!("phys={phys:?}"));
        }
        if let Some(path) = &self.input_fn {
            parts.push(format!("fn={path}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// One resolved output of a remap rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputAction {
    /// Emit one key code, carrying the source event's value
    Single(Key),
    /// Press every code in list order; release in exact reverse order
    Chord(Vec<Key>),
}

impl OutputAction {
    /// Output codes in press order
    pub fn codes(&self) -> &[Key] {
        match self {
            Self::Single(key) => std::slice::from_ref(key),
            Self::Chord(keys) => keys,
        }
    }
}

/// A validated remap rule: one source code mapped to an ordered,
/// non-empty list of output actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    source: Key,
    actions: Vec<OutputAction>,
}

impl RemapRule {
    /// Create a rule. The config loader guarantees `actions` is non-empty
    /// and that every chord has at least one code.
    pub fn new(source: Key, actions: Vec<OutputAction>) -> Self {
        Self { source, actions }
    }

    /// The physical code this rule fires on
    pub fn source(&self) -> Key {
        self.source
    }

    /// The ordered output actions
    pub fn actions(&self) -> &[OutputAction] {
        &self.actions
    }

    /// Flattened output codes across all actions, in press order
    pub fn output_codes(&self) -> SmallVec<[Key; 4]> {
        self.actions
            .iter()
            .flat_map(|action| action.codes().iter().copied())
            .collect()
    }
}

/// One configured device group: its selectors, the name of the paired
/// virtual device, and the remap rules scoped to it.
#[derive(Debug, Clone)]
pub struct DeviceGroup {
    selector: DeviceSelector,
    output_name: String,
    rules: HashMap<u16, RemapRule>,
}

impl DeviceGroup {
    /// Create a group from validated rules. The config loader guarantees
    /// at most one rule per source code.
    pub fn new(
        selector: DeviceSelector,
        output_name: impl Into<String>,
        rules: Vec<RemapRule>,
    ) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| (rule.source().code(), rule))
            .collect();
        Self {
            selector,
            output_name: output_name.into(),
            rules,
        }
    }

    /// The device selectors for this group
    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    /// Name to advertise on the paired virtual device
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Number of rules in this group
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Look up the rule for a source code, if any
    pub fn rule(&self, code: u16) -> Option<&RemapRule> {
        self.rules.get(&code)
    }

    /// Every output code any rule in this group can synthesize.
    /// Used by the capability mirror to extend the virtual device.
    pub fn synthesized_codes(&self) -> HashSet<Key> {
        self.rules
            .values()
            .flat_map(|rule| rule.output_codes())
            .collect()
    }
}

/// Immutable mapping table covering all configured device groups.
///
/// Built once from validated configuration and shared read-only across
/// sessions; the engine performs no re-validation.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    groups: Vec<DeviceGroup>,
}

impl MappingTable {
    /// Create a table from validated groups
    pub fn new(groups: Vec<DeviceGroup>) -> Self {
        Self { groups }
    }

    /// All configured groups, in config order
    pub fn groups(&self) -> &[DeviceGroup] {
        &self.groups
    }

    /// A single group by index
    pub fn group(&self, index: usize) -> Option<&DeviceGroup> {
        self.groups.get(index)
    }

    /// Number of configured groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if no groups are configured
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Resolve a source code within a group to its output actions.
    /// `None` signals the caller to pass the event through unchanged.
    pub fn lookup(&self, group: usize, code: u16) -> Option<&[OutputAction]> {
        self.groups
            .get(group)
            .and_then(|g| g.rule(code))
            .map(|rule| rule.actions())
    }
}
