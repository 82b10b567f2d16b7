//! Flag descriptors contributed by modules and providers.
//!
//! Modules mutate a [`FlagSet`] during the flag phase of `App::build`; the app
//! materializes the set as dynamically-built `clap` arguments, parses the
//! process argv, and overlays the explicitly-set values into
//! [`ProviderValues`](super::ProviderValues). Flag names use `-` separators by
//! CLI convention (`scheduler-timezone`) and map onto dotted config keys
//! (`scheduler.timezone`).

use std::collections::HashMap;
use std::time::Duration;

use super::value::ConfigValue;
use crate::config::duration::parse_duration;
use crate::error::CoreError;

/// Value type of a flag or provider config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    String,
    Int,
    Bool,
    Duration,
    Float,
}

/// A single flag descriptor.
#[derive(Debug, Clone)]
pub struct FlagSpec {
    pub name: String,
    pub kind: FlagKind,
    pub default: ConfigValue,
    pub description: String,
}

/// Ordered, name-unique collection of flag descriptors.
#[derive(Debug, Default)]
pub struct FlagSet {
    flags: Vec<FlagSpec>,
    duplicates: Vec<String>,
}

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string_var(&mut self, name: &str, default: &str, description: &str) -> &mut Self {
        self.push(FlagSpec {
            name: name.to_string(),
            kind: FlagKind::String,
            default: ConfigValue::String(default.to_string()),
            description: description.to_string(),
        })
    }

    pub fn int_var(&mut self, name: &str, default: i64, description: &str) -> &mut Self {
        self.push(FlagSpec {
            name: name.to_string(),
            kind: FlagKind::Int,
            default: ConfigValue::Integer(default),
            description: description.to_string(),
        })
    }

    pub fn bool_var(&mut self, name: &str, default: bool, description: &str) -> &mut Self {
        self.push(FlagSpec {
            name: name.to_string(),
            kind: FlagKind::Bool,
            default: ConfigValue::Bool(default),
            description: description.to_string(),
        })
    }

    pub fn duration_var(&mut self, name: &str, default: Duration, description: &str) -> &mut Self {
        self.push(FlagSpec {
            name: name.to_string(),
            kind: FlagKind::Duration,
            default: ConfigValue::String(format_duration(default)),
            description: description.to_string(),
        })
    }

    pub fn float_var(&mut self, name: &str, default: f64, description: &str) -> &mut Self {
        self.push(FlagSpec {
            name: name.to_string(),
            kind: FlagKind::Float,
            default: ConfigValue::Float(default),
            description: description.to_string(),
        })
    }

    fn push(&mut self, spec: FlagSpec) -> &mut Self {
        if self.flags.iter().any(|f| f.name == spec.name) {
            self.duplicates.push(spec.name);
        } else {
            self.flags.push(spec);
        }
        self
    }

    pub fn specs(&self) -> &[FlagSpec] {
        &self.flags
    }

    /// Flag names registered more than once, surfaced as build errors.
    pub(crate) fn duplicate_names(&self) -> &[String] {
        &self.duplicates
    }

    /// Config-key defaults contributed by the flag descriptors.
    pub(crate) fn defaults(&self) -> HashMap<String, ConfigValue> {
        self.flags
            .iter()
            .map(|f| (flag_key(&f.name), f.default.clone()))
            .collect()
    }

    /// Attach every descriptor to a `clap` command as a long option.
    pub(crate) fn attach(&self, mut cmd: clap::Command) -> clap::Command {
        for spec in &self.flags {
            let arg = clap::Arg::new(spec.name.clone())
                .long(spec.name.clone())
                .help(spec.description.clone());
            let arg = match spec.kind {
                FlagKind::Bool => arg.action(clap::ArgAction::SetTrue),
                _ => arg.action(clap::ArgAction::Set).value_name("VALUE"),
            };
            cmd = cmd.arg(arg);
        }
        cmd
    }

    /// Extract the flags the user set explicitly on the command line, coerced
    /// to their declared kind and keyed by dotted config key.
    pub(crate) fn extract(
        &self,
        matches: &clap::ArgMatches,
    ) -> Result<HashMap<String, ConfigValue>, CoreError> {
        let mut out = HashMap::new();
        for spec in &self.flags {
            let explicit = matches.value_source(&spec.name)
                == Some(clap::parser::ValueSource::CommandLine);
            if !explicit {
                continue;
            }
            let value = match spec.kind {
                FlagKind::Bool => ConfigValue::Bool(matches.get_flag(&spec.name)),
                _ => {
                    let raw: &String = matches
                        .get_one(&spec.name)
                        .expect("clap guarantees a value for explicitly-set flags");
                    coerce(&spec.name, spec.kind, raw)?
                }
            };
            out.insert(flag_key(&spec.name), value);
        }
        Ok(out)
    }
}

/// Coerce a raw string flag value to its declared kind.
pub(crate) fn coerce(name: &str, kind: FlagKind, raw: &str) -> Result<ConfigValue, CoreError> {
    let mismatch = |expected: &'static str| CoreError::TypeMismatch {
        key: name.to_string(),
        expected,
    };
    match kind {
        FlagKind::String => Ok(ConfigValue::String(raw.to_string())),
        FlagKind::Int => raw
            .parse::<i64>()
            .map(ConfigValue::Integer)
            .map_err(|_| mismatch("i64")),
        FlagKind::Float => raw
            .parse::<f64>()
            .map(ConfigValue::Float)
            .map_err(|_| mismatch("f64")),
        FlagKind::Bool => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(ConfigValue::Bool(true)),
            "false" | "0" | "no" => Ok(ConfigValue::Bool(false)),
            _ => Err(mismatch("bool")),
        },
        FlagKind::Duration => parse_duration(raw)
            .map(|_| ConfigValue::String(raw.to_string()))
            .map_err(|_| mismatch("duration (e.g. \"1h30m\")")),
    }
}

/// Map a flag name onto its dotted config key (`scheduler-timezone` ->
/// `scheduler.timezone`).
pub(crate) fn flag_key(name: &str) -> String {
    name.replace('-', ".")
}

fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

// ── Provider config contracts ──────────────────────────────────────────────

/// One namespaced config key declared by a provider.
#[derive(Debug, Clone)]
pub struct ConfigFlag {
    pub key: &'static str,
    pub kind: FlagKind,
    pub default: Option<ConfigValue>,
    pub required: bool,
    pub description: &'static str,
}

impl ConfigFlag {
    pub fn new(key: &'static str, kind: FlagKind) -> Self {
        Self {
            key,
            kind,
            default: None,
            required: false,
            description: "",
        }
    }

    pub fn default_value(mut self, value: ConfigValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }
}

/// Contract for services that declare namespaced config keys.
///
/// Recorded via [`Binding::with_config`](crate::container::Binding::with_config);
/// `App::build` aggregates the contracts, installs defaults, and enforces
/// `required` before any provider runs.
pub trait ConfigProvider {
    /// Dotted prefix for this provider's keys (e.g. `"scheduler"`).
    fn config_namespace() -> &'static str;

    /// The keys this provider reads, relative to its namespace.
    fn config_flags() -> Vec<ConfigFlag>;
}
