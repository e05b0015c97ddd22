// Remapd Config Parser - TOML with Serde
// Parses and validates device groups and remap rules

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use evdev::Key;
use serde::Deserialize;

use crate::mapping::{DeviceGroup, DeviceSelector, MappingTable, OutputAction, RemapRule};

/// Configuration errors. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("no config.toml found (looked in {0})")]
    NotFound(String),

    #[error("device group {0}: at least one of input_name, input_phys or input_fn is required")]
    MissingSelector(usize),

    #[error("device group {group}: unknown key name '{name}'")]
    UnknownKey { group: usize, name: String },

    #[error("device group {group}: key code {code} out of range")]
    CodeOutOfRange { group: usize, code: i64 },

    #[error("device group {group}: source '{key}' has an empty output action list")]
    EmptyActions { group: usize, key: String },

    #[error("device group {group}: source '{key}' has an empty chord")]
    EmptyChord { group: usize, key: String },

    #[error("device group {group}: duplicate remapping for source '{key}'")]
    DuplicateSource { group: usize, key: String },
}

/// Root TOML table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    /// Configured device groups, in order
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceToml>,
}

/// One `[[device]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceToml {
    /// Device name selector (EVIOCGNAME)
    pub input_name: Option<String>,
    /// Physical location selector (EVIOCGPHYS)
    pub input_phys: Option<String>,
    /// Device node path selector
    pub input_fn: Option<String>,
    /// Name for the paired virtual device (defaulted when absent)
    pub output_name: Option<String>,
    /// Source key -> ordered output actions
    #[serde(default)]
    pub remappings: HashMap<String, Vec<ActionToml>>,
}

/// One output action as written in TOML: a key, or a chord list of keys
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionToml {
    Key(KeyToml),
    Chord(Vec<KeyToml>),
}

/// A key written either by name ("KEY_A") or raw numeric code
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyToml {
    Code(i64),
    Name(String),
}

/// Parsed configuration, not yet validated into a MappingTable
#[derive(Debug, Clone)]
pub struct Config {
    toml: ConfigToml,
}

impl Config {
    /// Default config location: $XDG_CONFIG_HOME/remapd/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remapd").join("config.toml"))
    }

    /// Load from the default XDG location
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()
            .ok_or_else(|| ConfigError::NotFound("no config directory".to_string()))?;
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::from_toml_path(&path)
    }

    /// Load and parse a TOML config file
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse config from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let toml: ConfigToml =
            toml::from_str(raw).map_err(|e| ConfigError::TomlParse(e.to_string()))?;
        Ok(Self { toml })
    }

    /// Validate and resolve into the immutable mapping table.
    ///
    /// Rejects groups with no selector, unresolvable key names, empty
    /// action lists or chords, and duplicate source codes within a group.
    pub fn build_table(&self) -> Result<MappingTable, ConfigError> {
        let mut groups = Vec::with_capacity(self.toml.devices.len());

        for (index, device) in self.toml.devices.iter().enumerate() {
            let selector = DeviceSelector {
                input_name: device.input_name.clone(),
                input_phys: device.input_phys.clone(),
                input_fn: device.input_fn.clone(),
            };
            if selector.is_empty() {
                return Err(ConfigError::MissingSelector(index));
            }

            let output_name = device
                .output_name
                .clone()
                .unwrap_or_else(|| default_output_name(&selector, index));

            let mut rules: Vec<RemapRule> = Vec::with_capacity(device.remappings.len());
            for (source_spec, action_specs) in &device.remappings {
                let source = resolve_source(index, source_spec)?;
                if rules.iter().any(|rule| rule.source() == source) {
                    return Err(ConfigError::DuplicateSource {
                        group: index,
                        key: source_spec.clone(),
                    });
                }
                if action_specs.is_empty() {
                    return Err(ConfigError::EmptyActions {
                        group: index,
                        key: source_spec.clone(),
                    });
                }

                let mut actions = Vec::with_capacity(action_specs.len());
                for spec in action_specs {
                    actions.push(resolve_action(index, source_spec, spec)?);
                }
                rules.push(RemapRule::new(source, actions));
            }

            log::debug!(
                "config group {index}: {} rule(s), selector {selector}",
                rules.len()
            );
            groups.push(DeviceGroup::new(selector, output_name, rules));
        }

        Ok(MappingTable::new(groups))
    }
}

fn default_output_name(selector: &DeviceSelector, index: usize) -> String {
    match &selector.input_name {
        Some(name) => format!("remapd {name}"),
        None => format!("remapd device {index}"),
    }
}

fn resolve_key(group: usize, spec: &KeyToml) -> Result<Key, ConfigError> {
    match spec {
        KeyToml::Code(code) => {
            if *code < 0 || *code > i64::from(u16::MAX) {
                return Err(ConfigError::CodeOutOfRange {
                    group,
                    code: *code,
                });
            }
            Ok(Key::new(*code as u16))
        }
        KeyToml::Name(name) => Key::from_str(name).map_err(|_| ConfigError::UnknownKey {
            group,
            name: name.clone(),
        }),
    }
}

// TOML table keys are always strings, so a numeric source arrives as "276".
fn resolve_source(group: usize, source: &str) -> Result<Key, ConfigError> {
    if let Ok(code) = source.parse::<i64>() {
        return resolve_key(group, &KeyToml::Code(code));
    }
    resolve_key(group, &KeyToml::Name(source.to_string()))
}

fn resolve_action(
    group: usize,
    source: &str,
    spec: &ActionToml,
) -> Result<OutputAction, ConfigError> {
    match spec {
        ActionToml::Key(key) => Ok(OutputAction::Single(resolve_key(group, key)?)),
        ActionToml::Chord(keys) => {
            if keys.is_empty() {
                return Err(ConfigError::EmptyChord {
                    group,
                    key: source.to_string(),
                });
            }
            let mut chord = Vec::with_capacity(keys.len());
            for key in keys {
                chord.push(resolve_key(group, key)?);
            }
            Ok(OutputAction::Chord(chord))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[device]]
        input_name = "Logitech MX Vertical"
        output_name = "remapd MX Vertical"

        [device.remappings]
        BTN_EXTRA = ["KEY_Z"]
        BTN_SIDE = [["KEY_LEFTMETA", "KEY_A"]]
    "#;

    #[test]
    fn test_parse_and_build_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let table = config.build_table().unwrap();

        assert_eq!(table.len(), 1);
        let group = table.group(0).unwrap();
        assert_eq!(group.output_name(), "remapd MX Vertical");
        assert_eq!(group.rule_count(), 2);

        let actions = table.lookup(0, Key::BTN_SIDE.code()).unwrap();
        assert_eq!(
            actions,
            &[OutputAction::Chord(vec![Key::KEY_LEFTMETA, Key::KEY_A])]
        );
    }

    #[test]
    fn test_numeric_codes_accepted() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_fn = "/dev/input/event5"

            [device.remappings]
            276 = [30]
            "#,
        )
        .unwrap();
        let table = config.build_table().unwrap();

        let actions = table.lookup(0, 276).unwrap();
        assert_eq!(actions, &[OutputAction::Single(Key::new(30))]);
    }

    #[test]
    fn test_mixed_actions_keep_order() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            KEY_F13 = ["KEY_A", ["KEY_LEFTCTRL", "KEY_C"]]
            "#,
        )
        .unwrap();
        let table = config.build_table().unwrap();

        let actions = table.lookup(0, Key::KEY_F13.code()).unwrap();
        assert_eq!(
            actions,
            &[
                OutputAction::Single(Key::KEY_A),
                OutputAction::Chord(vec![Key::KEY_LEFTCTRL, Key::KEY_C]),
            ]
        );
    }

    #[test]
    fn test_missing_selector_rejected() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            output_name = "nameless"
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::MissingSelector(0))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            KEY_BOGUS_NAME = ["KEY_A"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::UnknownKey { group: 0, .. })
        ));
    }

    #[test]
    fn test_empty_action_list_rejected() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            BTN_EXTRA = []
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::EmptyActions { group: 0, .. })
        ));
    }

    #[test]
    fn test_validation_error_names_the_source() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            BTN_EXTRA = []
            "#,
        )
        .unwrap();

        let err = config.build_table().unwrap_err();
        assert!(err.to_string().contains("BTN_EXTRA"));
        assert!(matches!(
            err,
            ConfigError::EmptyActions { group: 0, ref key } if key.as_str() == "BTN_EXTRA"
        ));
    }

    #[test]
    fn test_empty_chord_rejected() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            BTN_EXTRA = [[]]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::EmptyChord { group: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        // "BTN_EXTRA" and its numeric code are distinct TOML keys that
        // resolve to the same source code.
        let config = Config::from_toml_str(&format!(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            BTN_EXTRA = ["KEY_Z"]
            {} = ["KEY_A"]
            "#,
            Key::BTN_EXTRA.code(),
        ))
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::DuplicateSource { group: 0, .. })
        ));
    }

    #[test]
    fn test_code_out_of_range_rejected() {
        let config = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"

            [device.remappings]
            BTN_EXTRA = [70000]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_table(),
            Err(ConfigError::CodeOutOfRange { group: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected_at_parse() {
        let result = Config::from_toml_str(
            r#"
            [[device]]
            input_name = "Pad"
            bouncekeyz = 3
            "#,
        );

        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
