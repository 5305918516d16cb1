use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use super::{PrefValue, Preference, PreferenceError};
use crate::persist::write_atomic;

/// Live preference values backed by the default table.
///
/// Only preferences that were read or set are stored; everything else
/// resolves to its default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceTable {
    values: BTreeMap<Preference, PrefValue>,
}

impl PreferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name`.
    ///
    /// Falls back to the default and stores it. Fails with `Unknown` for names
    /// outside the default table.
    pub fn get(&mut self, name: &str) -> Result<PrefValue, PreferenceError> {
        let pref: Preference = name.parse()?;
        Ok(self.value(pref))
    }

    /// Current value of `pref`, storing the default if absent.
    pub fn value(&mut self, pref: Preference) -> PrefValue {
        self.values
            .entry(pref)
            .or_insert_with(|| pref.default_value())
            .clone()
    }

    /// Current value of `pref` without touching the table.
    pub fn current(&self, pref: Preference) -> PrefValue {
        self.values
            .get(&pref)
            .cloned()
            .unwrap_or_else(|| pref.default_value())
    }

    /// Store `value` under `name`. The table is unchanged on error.
    pub fn set(&mut self, name: &str, value: PrefValue) -> Result<Preference, PreferenceError> {
        let pref: Preference = name.parse()?;
        self.set_value(pref, value)?;
        Ok(pref)
    }

    pub fn set_value(&mut self, pref: Preference, value: PrefValue) -> Result<(), PreferenceError> {
        let value = pref.conform(value)?;
        self.values.insert(pref, value);
        Ok(())
    }

    /// Whether `pref` has a stored value.
    pub fn is_stored(&self, pref: Preference) -> bool {
        self.values.contains_key(&pref)
    }

    /// Effective value of every preference, in declaration order.
    pub fn effective(&self) -> Vec<(Preference, PrefValue)> {
        Preference::ALL
            .into_iter()
            .map(|pref| (pref, self.current(pref)))
            .collect()
    }

    /// Serialize the stored values as a JSON object keyed by name.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let map: BTreeMap<&'static str, &PrefValue> = self
            .values
            .iter()
            .map(|(pref, value)| (pref.name(), value))
            .collect();
        serde_json::to_string_pretty(&map)
    }

    /// Parse a JSON object keyed by name.
    ///
    /// Unknown keys and values of the wrong kind are dropped with a warning;
    /// a newer client may have written them.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut table = Self::new();

        for (name, raw_value) in raw {
            let pref = match name.parse::<Preference>() {
                Ok(pref) => pref,
                Err(_) => {
                    warn!(preference = %name, "Ignoring unknown saved preference");
                    continue;
                }
            };

            let value = match serde_json::from_value::<PrefValue>(raw_value) {
                Ok(value) => value,
                Err(e) => {
                    warn!(preference = %pref, error = %e, "Ignoring unreadable saved preference");
                    continue;
                }
            };

            if let Err(e) = table.set_value(pref, value) {
                warn!(preference = %pref, error = %e, "Ignoring saved preference");
            }
        }

        Ok(table)
    }

    /// Read a table from `path`.
    pub fn load(path: &Path) -> Result<Self, PreferenceError> {
        let text = std::fs::read_to_string(path).map_err(|source| PreferenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|e| PreferenceError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Read a table from `path`, starting from defaults if it is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(table) => {
                info!(path = %path.display(), "Loaded preferences");
                table
            }
            Err(e) if e.is_not_found() => {
                info!(path = %path.display(), "No saved preferences, using defaults");
                Self::new()
            }
            Err(e) => {
                warn!(error = %e, "Saved preferences unusable, using defaults");
                Self::new()
            }
        }
    }

    /// Atomically write the table to `path`.
    pub fn save(&self, path: &Path) -> Result<(), PreferenceError> {
        let json = self.to_json().map_err(|e| PreferenceError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(path, json.as_bytes()).map_err(|source| PreferenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
