//! Process-global typed configuration variables.
//!
//! A variable is registered once with [`lookup`] (name, default,
//! description) and read with [`ConfigVar::value`]. Updates go through
//! [`ConfigVar::set_value`] or a bulk [`load`] from a JSON document and
//! notify every registered `(old, new)` listener, which is how long-lived
//! subsystems pick up live changes (e.g. the hooked `connect` timeout).
//!
//! Values travel through `serde_json`, so any `Serialize + Deserialize`
//! type works, from plain integers to structured tables.
//!
//! ```
//! use weft::config;
//!
//! let stack = config::lookup::<u32>("fiber.stack_size", 1024 * 1024, "per-fiber stack");
//! assert_eq!(stack.value(), 1024 * 1024);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Marker for types storable in a [`ConfigVar`].
pub trait ConfigValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> ConfigValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A named, typed configuration value with change listeners.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: String, default: T, description: &str) -> Self {
        Self {
            name,
            description: description.into(),
            value: RwLock::new(default),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value (cloned out from under the lock).
    pub fn value(&self) -> T {
        self.value.read().expect("config lock poisoned").clone()
    }

    /// Replaces the value, invoking listeners with `(old, new)` when it
    /// actually changed.
    pub fn set_value(&self, new: T) {
        let old = {
            let mut slot = self.value.write().expect("config lock poisoned");
            if *slot == new {
                return;
            }
            std::mem::replace(&mut *slot, new.clone())
        };
        for listener in self.listeners.read().expect("config lock poisoned").iter() {
            listener(&old, &new);
        }
    }

    /// Registers a callback fired on every effective [`set_value`].
    ///
    /// [`set_value`]: Self::set_value
    pub fn add_listener(&self, f: impl Fn(&T, &T) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("config lock poisoned")
            .push(Box::new(f));
    }
}

/// Object-safe view of a variable, for the registry and the bulk loader.
trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn load_json(&self, value: &serde_json::Value) -> Result<()>;
    fn dump_json(&self) -> serde_json::Value;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

impl<T: ConfigValue> ConfigVarBase for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn load_json(&self, value: &serde_json::Value) -> Result<()> {
        let parsed: T = serde_json::from_value(value.clone())?;
        self.set_value(parsed);
        Ok(())
    }

    fn dump_json(&self) -> serde_json::Value {
        serde_json::to_value(self.value()).unwrap_or(serde_json::Value::Null)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

/// Looks up a variable by name, registering it with `default` on first use.
///
/// Names are lowercased and restricted to `[a-z0-9._]`. Re-looking-up an
/// existing name with a different `T` is a configuration bug and fails
/// construction.
///
/// # Panics
///
/// On an invalid name or on a type mismatch with a previous registration.
pub fn lookup<T: ConfigValue>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>> {
    let name = name.to_ascii_lowercase();
    assert!(valid_name(&name), "invalid config name {:?}", name);

    loop {
        // panics happen outside the registry locks so a misuse cannot
        // poison the global registry
        let existing = {
            let registry = REGISTRY.read().expect("config lock poisoned");
            registry.get(&name).cloned()
        };
        if let Some(existing) = existing {
            let type_name = existing.type_name();
            return existing
                .as_any_arc()
                .downcast::<ConfigVar<T>>()
                .unwrap_or_else(|_| {
                    panic!(
                        "config name {:?} already registered with type {}, requested {}",
                        name,
                        type_name,
                        std::any::type_name::<T>()
                    )
                });
        }

        let mut registry = REGISTRY.write().expect("config lock poisoned");
        if registry.contains_key(&name) {
            continue;
        }
        let var = Arc::new(ConfigVar::new(name.clone(), default, description));
        registry.insert(name.clone(), var.clone());
        return var;
    }
}

/// Applies a JSON document to the registry.
///
/// Nested objects are flattened with `.` separators, so
/// `{"fiber": {"stack_size": 65536}}` updates `fiber.stack_size`. Keys
/// without a registered variable are reported at debug level and skipped;
/// a value that does not decode into the variable's type is an error.
pub fn load(doc: &serde_json::Value) -> Result<()> {
    let mut flat = Vec::new();
    flatten("", doc, &mut flat);
    for (key, value) in flat {
        let var = {
            let registry = REGISTRY.read().expect("config lock poisoned");
            registry.get(&key).cloned()
        };
        match var {
            Some(var) => var.load_json(value).map_err(|e| {
                Error::Config(format!("key {:?}: {}", key, e))
            })?,
            None => log::debug!("config key {:?} has no registered variable, skipped", key),
        }
    }
    Ok(())
}

/// Serializes every registered variable into a flat JSON object.
pub fn dump() -> serde_json::Value {
    let registry = REGISTRY.read().expect("config lock poisoned");
    let map = registry
        .iter()
        .map(|(name, var)| (name.clone(), var.dump_json()))
        .collect();
    serde_json::Value::Object(map)
}

fn flatten<'a>(
    prefix: &str,
    value: &'a serde_json::Value,
    out: &mut Vec<(String, &'a serde_json::Value)>,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let full = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&full, nested, out);
            }
        }
        other => out.push((prefix.to_string(), other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn lookup_registers_and_returns_same_var() {
        let a = lookup::<u32>("test.lookup.v", 7, "test value");
        let b = lookup::<u32>("TEST.LOOKUP.V", 0, "ignored default");
        assert_eq!(b.value(), 7);
        a.set_value(9);
        assert_eq!(b.value(), 9);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn lookup_type_mismatch_panics() {
        lookup::<u32>("test.mismatch.v", 1, "");
        lookup::<String>("test.mismatch.v", String::new(), "");
    }

    #[test]
    #[should_panic(expected = "invalid config name")]
    fn lookup_rejects_bad_names() {
        lookup::<u32>("no spaces allowed", 1, "");
    }

    #[test]
    fn listeners_observe_old_and_new() {
        let var = lookup::<u64>("test.listener.v", 100, "");
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        var.add_listener(move |old, new| {
            seen2.store(old * 1000 + new, Ordering::SeqCst);
        });

        var.set_value(100); // unchanged, must not notify
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        var.set_value(42);
        assert_eq!(seen.load(Ordering::SeqCst), 100_042);
    }

    #[test]
    fn load_applies_nested_document() {
        let var = lookup::<u32>("test.load.inner", 1, "");
        let doc: serde_json::Value =
            serde_json::from_str(r#"{"test": {"load": {"inner": 33}}}"#).unwrap();
        load(&doc).unwrap();
        assert_eq!(var.value(), 33);

        let bad: serde_json::Value =
            serde_json::from_str(r#"{"test": {"load": {"inner": "nope"}}}"#).unwrap();
        assert!(load(&bad).is_err());
        assert_eq!(var.value(), 33);
    }
}
