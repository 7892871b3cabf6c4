//! Fixed-schema extension slots (`field1`..`field50`) carried by every article.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};

pub const EXTENSION_SLOTS: usize = 50;

/// Column / key name of every slot, in slot order.
pub const EXTENSION_FIELD_NAMES: [&str; EXTENSION_SLOTS] = [
    "field1", "field2", "field3", "field4", "field5", "field6", "field7", "field8", "field9",
    "field10", "field11", "field12", "field13", "field14", "field15", "field16", "field17",
    "field18", "field19", "field20", "field21", "field22", "field23", "field24", "field25",
    "field26", "field27", "field28", "field29", "field30", "field31", "field32", "field33",
    "field34", "field35", "field36", "field37", "field38", "field39", "field40", "field41",
    "field42", "field43", "field44", "field45", "field46", "field47", "field48", "field49",
    "field50",
];

#[derive(Clone, PartialEq, Eq)]
pub struct ExtensionFields {
    slots: [String; EXTENSION_SLOTS],
}

impl Default for ExtensionFields {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| String::new()),
        }
    }
}

impl fmt::Debug for ExtensionFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().filter(|(_, v)| !v.is_empty()))
            .finish()
    }
}

impl ExtensionFields {
    pub fn slot_index(name: &str) -> Option<usize> {
        EXTENSION_FIELD_NAMES.iter().position(|n| *n == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        Self::slot_index(name).map(|i| self.slots[i].as_str())
    }

    /// Returns false when `name` is not one of the fifty slot names.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        match Self::slot_index(name) {
            Some(i) => {
                self.slots[i] = value.into();
                true
            }
            None => false,
        }
    }

    pub fn slot(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        EXTENSION_FIELD_NAMES
            .iter()
            .copied()
            .zip(self.slots.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(String::is_empty)
    }

    /// Flattens every slot, empty ones included, to a `fieldN -> value` map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Keys that are not slot names are dropped.
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut fields = Self::default();
        for (k, v) in entries {
            fields.set(k.as_ref(), v);
        }
        fields
    }
}

impl Serialize for ExtensionFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let populated = self.iter().filter(|(_, v)| !v.is_empty()).collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(populated.len()))?;
        for (k, v) in populated {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExtensionFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(Self::from_map(raw))
    }
}
