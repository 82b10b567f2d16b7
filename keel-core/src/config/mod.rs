//! Configuration composition: flag descriptors, file/env loading, and the
//! [`ProviderValues`] view that providers resolve during build.
//!
//! Precedence, lowest to highest: flag defaults < config file < environment
//! variables < explicitly-set flags. The composed [`ProviderValues`] is
//! registered into the container as an eager instance before any provider
//! runs, so providers read their namespaced keys at construction time.

pub mod duration;
mod flags;
mod loader;
mod value;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use duration::{parse_duration, DurationParseError};
pub use flags::{ConfigFlag, ConfigProvider, FlagKind, FlagSet, FlagSpec};
pub use value::{ConfigValue, FromConfigValue};

use crate::error::CoreError;

/// Typed, namespaced view of the effective configuration.
///
/// Cheap to clone; all clones observe the same underlying map. Mutation is
/// crate-internal and happens only during `App::build`.
#[derive(Clone, Default)]
pub struct ProviderValues {
    inner: Arc<RwLock<HashMap<String, ConfigValue>>>,
}

impl std::fmt::Debug for ProviderValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.read().expect("config lock poisoned");
        f.debug_struct("ProviderValues")
            .field("key_count", &guard.len())
            .finish()
    }
}

impl ProviderValues {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a view from literal key/value pairs (useful in tests).
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, ConfigValue)>,
        K: Into<String>,
    {
        let values = Self::empty();
        values.overlay(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect());
        values
    }

    /// Insert every entry, overwriting existing keys. Higher-precedence layers
    /// are overlaid later.
    pub(crate) fn overlay(&self, entries: HashMap<String, ConfigValue>) {
        let mut guard = self.inner.write().expect("config lock poisoned");
        guard.extend(entries);
    }

    /// Insert a value only when the key is absent (provider contract defaults
    /// must not shadow file/env/flag values).
    pub(crate) fn set_default(&self, key: &str, value: ConfigValue) {
        let mut guard = self.inner.write().expect("config lock poisoned");
        guard.entry(key.to_string()).or_insert(value);
    }

    /// Load a YAML config file and overlay its flattened keys.
    pub(crate) fn overlay_file(&self, path: &Path) -> Result<(), CoreError> {
        let mut values = HashMap::new();
        loader::load_yaml_file(path, &mut values)?;
        self.overlay(values);
        Ok(())
    }

    /// Overlay environment variables.
    ///
    /// A key `a.b.c` corresponds to `A_B_C`; with a prefix `KEEL`, to
    /// `KEEL_A_B_C` (non-prefixed variables are then ignored).
    pub(crate) fn overlay_env(&self, prefix: Option<&str>) {
        let mut entries = HashMap::new();
        for (name, value) in std::env::vars() {
            let name = match prefix {
                Some(p) => match name.strip_prefix(&format!("{p}_")) {
                    Some(rest) => rest.to_string(),
                    None => continue,
                },
                None => name,
            };
            let key = name.to_lowercase().replace('_', ".");
            entries.insert(key, ConfigValue::String(value));
        }
        self.overlay(entries);
    }

    pub fn contains(&self, key: &str) -> bool {
        let guard = self.inner.read().expect("config lock poisoned");
        guard.contains_key(key)
    }

    /// Get a typed value for the given dot-separated key.
    pub fn get<V: FromConfigValue>(&self, key: &str) -> Result<V, CoreError> {
        let guard = self.inner.read().expect("config lock poisoned");
        let value = guard.get(key).ok_or_else(|| CoreError::NotFound {
            key: key.to_string(),
        })?;
        V::from_config_value(value, key)
    }

    /// Get a typed value, falling back to a default when the key is missing.
    pub fn get_or<V: FromConfigValue>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Result<String, CoreError> {
        self.get(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64, CoreError> {
        self.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, CoreError> {
        self.get(key)
    }

    pub fn get_duration(&self, key: &str) -> Result<Duration, CoreError> {
        self.get(key)
    }

    pub fn get_float(&self, key: &str) -> Result<f64, CoreError> {
        self.get(key)
    }

    /// Deserialize every key under `namespace` into a struct.
    ///
    /// Dotted keys are re-nested first, so `http.tls.cert` becomes
    /// `{ "tls": { "cert": ... } }` for `namespace = "http"`.
    pub fn unmarshal_key<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
    ) -> Result<T, CoreError> {
        let guard = self.inner.read().expect("config lock poisoned");
        let prefix = format!("{namespace}.");
        let mut root = serde_json::Map::new();

        for (key, value) in guard.iter() {
            let rest = if key == namespace {
                // A whole map stored directly under the namespace key.
                if let ConfigValue::Map(map) = value {
                    for (k, v) in map {
                        root.insert(k.clone(), v.to_json());
                    }
                }
                continue;
            } else if let Some(rest) = key.strip_prefix(&prefix) {
                rest
            } else {
                continue;
            };

            let mut node = &mut root;
            let parts: Vec<&str> = rest.split('.').collect();
            for part in &parts[..parts.len() - 1] {
                let slot = node
                    .entry(part.to_string())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
                if !slot.is_object() {
                    // A scalar and a nested key collide; the nested form wins.
                    *slot = serde_json::Value::Object(serde_json::Map::new());
                }
                node = slot.as_object_mut().expect("slot was just made an object");
            }
            node.insert(parts[parts.len() - 1].to_string(), value.to_json());
        }

        serde_json::from_value(serde_json::Value::Object(root)).map_err(|e| {
            CoreError::NotSettable {
                key: namespace.to_string(),
                reason: format!("cannot deserialize namespace: {e}"),
            }
        })
    }
}
