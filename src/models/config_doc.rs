//! Two-level configuration document: section → key → JSON value.
//! The storage layer enforces no schema beyond the nesting.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::{Result, StorageError};

pub type ConfigSection = Map<String, Value>;
pub type ConfigDocument = BTreeMap<String, ConfigSection>;

/// Decode a document, skipping top-level entries that are not sections.
pub fn config_from_value(value: Value) -> Result<ConfigDocument> {
    let Value::Object(map) = value else {
        return Err(StorageError::Malformed("config document must be an object".into()));
    };
    let mut doc = ConfigDocument::new();
    for (section, items) in map {
        match items {
            Value::Object(items) => {
                doc.insert(section, items);
            }
            _ => tracing::warn!(section = %section, "skipping config entry that is not a section"),
        }
    }
    Ok(doc)
}

/// `override_doc` wins; nested objects are merged key by key.
pub fn deep_merge(base: &ConfigDocument, override_doc: &ConfigDocument) -> ConfigDocument {
    let mut merged = base.clone();
    for (section, items) in override_doc {
        let target = merged.entry(section.clone()).or_default();
        for (key, value) in items {
            match (target.get_mut(key), value) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    merge_objects(existing, incoming);
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
    merged
}

fn merge_objects(base: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_objects(existing, nested),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
