//! In-memory collection with unique secondary indexes
//!
//! Documents are JSON objects keyed by an integer `_id`, which is also the
//! shard key. Indexes are on dotted paths and are multikey: an array on the
//! path contributes one key per element, and a numeric path component matches
//! both an array position and a field literally named by that number.
//! Documents with no value on the path are not indexed.

use crate::common::{ChunkRange, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// How constraint violations are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Enforce unique indexes
    Primary,
    /// Store the document and skip conflicting index entries
    Replay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone)]
struct Index {
    spec: IndexSpec,
    // Canonical JSON of the key -> ids carrying it
    entries: BTreeMap<String, BTreeSet<i64>>,
}

impl Index {
    fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    /// First key of `keys` already held by a different document
    fn conflict(&self, id: i64, keys: &[String]) -> Option<String> {
        if !self.spec.unique {
            return None;
        }
        keys.iter()
            .find(|k| {
                self.entries
                    .get(*k)
                    .is_some_and(|ids| ids.iter().any(|other| *other != id))
            })
            .cloned()
    }

    /// Add the entries, skipping those that would break uniqueness. Returns
    /// the number skipped.
    fn add(&mut self, id: i64, keys: Vec<String>) -> u64 {
        let mut skipped = 0;
        for key in keys {
            let ids = self.entries.entry(key).or_default();
            if self.spec.unique && ids.iter().any(|other| *other != id) {
                skipped += 1;
                continue;
            }
            ids.insert(id);
        }
        skipped
    }

    fn remove(&mut self, id: i64, keys: &[String]) {
        for key in keys {
            if let Some(ids) = self.entries.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
    }
}

/// Every key `doc` contributes to an index on `path`, deduplicated
pub fn index_keys(doc: &Value, path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut values = Vec::new();
    collect_path_values(doc, &parts, &mut values);
    let keys: BTreeSet<String> = values.iter().map(|v| v.to_string()).collect();
    keys.into_iter().collect()
}

fn collect_path_values<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        match value {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(other),
        }
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect_path_values(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(position) = head.parse::<usize>() {
                if let Some(item) = items.get(position) {
                    collect_path_values(item, rest, out);
                }
            }
            for item in items.iter().filter(|i| i.is_object()) {
                collect_path_values(item, parts, out);
            }
        }
        _ => {}
    }
}

/// Shard key of a document
pub fn document_id(doc: &Value) -> Result<i64> {
    if !doc.is_object() {
        return Err(Error::InvalidDocument("document must be an object".into()));
    }
    doc.get("_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::InvalidDocument("document needs an integer _id".into()))
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    docs: BTreeMap<i64, Value>,
    indexes: BTreeMap<String, Index>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Value> {
        self.docs.get(&id)
    }

    pub fn count_in_range(&self, range: &ChunkRange) -> usize {
        self.docs.range(range.min..range.max).count()
    }

    pub fn fetch_range(&self, range: &ChunkRange) -> Vec<Value> {
        self.docs
            .range(range.min..range.max)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Insert a new document. Returns the number of index entries skipped
    /// (always 0 in `Primary` mode).
    pub fn insert(&mut self, doc: Value, mode: WriteMode) -> Result<u64> {
        let id = document_id(&doc)?;
        if self.docs.contains_key(&id) {
            return Err(Error::DuplicateKey {
                index: "_id_".into(),
                key: id.to_string(),
            });
        }
        self.write(id, doc, mode)
    }

    /// Insert or replace by `_id`
    pub fn upsert(&mut self, doc: Value, mode: WriteMode) -> Result<u64> {
        let id = document_id(&doc)?;
        self.write(id, doc, mode)
    }

    fn write(&mut self, id: i64, doc: Value, mode: WriteMode) -> Result<u64> {
        let new_keys: Vec<(String, Vec<String>)> = self
            .indexes
            .iter()
            .map(|(name, index)| (name.clone(), index_keys(&doc, &index.spec.path)))
            .collect();

        if mode == WriteMode::Primary {
            for (name, keys) in &new_keys {
                if let Some(key) = self.indexes[name].conflict(id, keys) {
                    return Err(Error::DuplicateKey {
                        index: name.clone(),
                        key,
                    });
                }
            }
        }

        if let Some(old) = self.docs.remove(&id) {
            self.unindex(id, &old);
        }
        let mut skipped = 0;
        for (name, keys) in new_keys {
            if let Some(index) = self.indexes.get_mut(&name) {
                skipped += index.add(id, keys);
            }
        }
        self.docs.insert(id, doc);
        Ok(skipped)
    }

    fn unindex(&mut self, id: i64, doc: &Value) {
        for index in self.indexes.values_mut() {
            let keys = index_keys(doc, &index.spec.path);
            index.remove(id, &keys);
        }
    }

    /// Delete every document in `range`; deleting nothing is not an error
    pub fn delete_range(&mut self, range: &ChunkRange) -> u64 {
        let ids: Vec<i64> = self
            .docs
            .range(range.min..range.max)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(doc) = self.docs.remove(id) {
                self.unindex(*id, &doc);
            }
        }
        ids.len() as u64
    }

    /// Build an index over the existing documents. In `Primary` mode a
    /// uniqueness violation fails the build; in `Replay` mode the conflicting
    /// entries are skipped and counted.
    pub fn create_index(&mut self, spec: IndexSpec, mode: WriteMode) -> Result<u64> {
        if let Some(existing) = self.indexes.get(&spec.name) {
            if existing.spec == spec {
                return Ok(0);
            }
            return Err(Error::InvalidDocument(format!(
                "index {} already exists with a different definition",
                spec.name
            )));
        }
        let mut index = Index::new(spec);
        let mut skipped = 0;
        for (id, doc) in &self.docs {
            let keys = index_keys(doc, &index.spec.path);
            if mode == WriteMode::Primary {
                if let Some(key) = index.conflict(*id, &keys) {
                    return Err(Error::DuplicateKey {
                        index: index.spec.name.clone(),
                        key,
                    });
                }
            }
            skipped += index.add(*id, keys);
        }
        self.indexes.insert(index.spec.name.clone(), index);
        Ok(skipped)
    }

    pub fn drop_index(&mut self, name: &str) -> bool {
        self.indexes.remove(name).is_some()
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.indexes.values().map(|i| i.spec.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unique(path: &str) -> IndexSpec {
        IndexSpec {
            name: format!("{}_1", path),
            path: path.to_string(),
            unique: true,
        }
    }

    #[test]
    fn test_multikey_numeric_component() {
        // Positional match on an array
        assert_eq!(index_keys(&json!({"a": [7, 8]}), "a.0"), vec!["7"]);
        // Field literally named "0"
        assert_eq!(index_keys(&json!({"a": {"0": 7}}), "a.0"), vec!["7"]);
        // Both, through an array of objects
        assert_eq!(
            index_keys(&json!({"a": [{"0": 1}, {"0": 2}]}), "a.0"),
            vec!["1", "2", "{\"0\":1}"]
        );
        // Array leaf is multikey
        assert_eq!(index_keys(&json!({"b": [3, 3, 4]}), "b"), vec!["3", "4"]);
        assert!(index_keys(&json!({"c": 1}), "b").is_empty());
    }

    #[test]
    fn test_unique_index_enforced_in_primary_mode() {
        let mut coll = Collection::new();
        coll.create_index(unique("a.0"), WriteMode::Primary).unwrap();
        coll.insert(json!({"_id": 1, "a": [5]}), WriteMode::Primary)
            .unwrap();
        let err = coll
            .insert(json!({"_id": 2, "a": {"0": 5}}), WriteMode::Primary)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        assert_eq!(coll.len(), 1);
    }

    #[test]
    fn test_replay_mode_stores_and_skips_entry() {
        let mut coll = Collection::new();
        coll.create_index(unique("a.0"), WriteMode::Primary).unwrap();
        coll.insert(json!({"_id": 1, "a": [5]}), WriteMode::Replay)
            .unwrap();
        let skipped = coll
            .insert(json!({"_id": 2, "a": {"0": 5}}), WriteMode::Replay)
            .unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(coll.len(), 2);
    }

    #[test]
    fn test_upsert_reindexes() {
        let mut coll = Collection::new();
        coll.create_index(unique("k"), WriteMode::Primary).unwrap();
        coll.insert(json!({"_id": 1, "k": "x"}), WriteMode::Primary)
            .unwrap();
        // Same document, same key: not a conflict with itself
        coll.upsert(json!({"_id": 1, "k": "x", "v": 2}), WriteMode::Primary)
            .unwrap();
        coll.upsert(json!({"_id": 1, "k": "y"}), WriteMode::Primary)
            .unwrap();
        // "x" is free again
        coll.insert(json!({"_id": 2, "k": "x"}), WriteMode::Primary)
            .unwrap();
    }

    #[test]
    fn test_delete_range_is_half_open_and_idempotent() {
        let mut coll = Collection::new();
        for id in 0..10 {
            coll.insert(json!({"_id": id}), WriteMode::Primary).unwrap();
        }
        let range = ChunkRange::new(3, 6).unwrap();
        assert_eq!(coll.count_in_range(&range), 3);
        assert_eq!(coll.delete_range(&range), 3);
        assert_eq!(coll.delete_range(&range), 0);
        assert_eq!(coll.len(), 7);
        assert!(coll.get(6).is_some());
    }

    #[test]
    fn test_create_index_over_conflicting_data() {
        let mut coll = Collection::new();
        coll.insert(json!({"_id": 1, "k": 1}), WriteMode::Primary)
            .unwrap();
        coll.insert(json!({"_id": 2, "k": 1}), WriteMode::Primary)
            .unwrap();
        assert!(coll.create_index(unique("k"), WriteMode::Primary).is_err());
        assert_eq!(coll.create_index(unique("k"), WriteMode::Replay).unwrap(), 1);
        assert_eq!(coll.index_specs().len(), 1);
    }

    #[test]
    fn test_document_id_required() {
        let mut coll = Collection::new();
        assert!(coll.insert(json!({"a": 1}), WriteMode::Primary).is_err());
        assert!(coll.insert(json!([1]), WriteMode::Primary).is_err());
    }
}
