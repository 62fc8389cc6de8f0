//! Key-path patches ("mods").
//!
//! A mods map sends dotted key paths to new values. `null` removes the
//! addressed key. Paths never address array elements.

use serde_json::{Map, Value};

/// A key-path patch.
pub type Mods = Map<String, Value>;

/// Client-local fields never diffed into mods.
pub const EXCLUDED_FIELDS: [&str; 3] = ["__last_fetch", "__TASK_ID", "__COPYING"];

/// Diffs `changes` against `old`, one top-level key of `changes` at a time.
///
/// Nested objects are diffed recursively into dotted paths and keys
/// missing from a nested replacement become `null`. Excluded fields and
/// values deep-equal to their old counterpart produce nothing.
#[must_use]
pub fn diff_mods(old: &Value, changes: &Value) -> Mods {
    let mut mods = Mods::new();
    let Some(changes) = changes.as_object() else {
        return mods;
    };
    for (key, new) in changes {
        if EXCLUDED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        diff_value(key.clone(), old.get(key), new, &mut mods);
    }
    mods
}

fn diff_value(path: String, old: Option<&Value>, new: &Value, mods: &mut Mods) {
    match (old, new) {
        (Some(old), new) if old == new => {}
        (Some(Value::Object(old)), Value::Object(new)) => {
            for (key, value) in new {
                diff_value(format!("{path}.{key}"), old.get(key), value, mods);
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                mods.insert(format!("{path}.{key}"), Value::Null);
            }
        }
        // A null for a key that never existed is not a change.
        (None, Value::Null) => {}
        _ => {
            mods.insert(path, new.clone());
        }
    }
}

/// Applies every entry of `mods` to `obj`.
pub fn apply_mods(obj: &mut Value, mods: &Mods) {
    for (path, value) in mods {
        apply_path(obj, path, value);
    }
}

/// Sets (or, for `null`, deletes) one dotted path inside `target`.
///
/// Setting through a missing or non-object intermediate replaces it with an
/// object; deleting through one is a no-op.
pub fn apply_path(target: &mut Value, path: &str, value: &Value) {
    if value.is_null() {
        delete_path(target, path);
    } else {
        set_path(target, path, value.clone());
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let (parents, last) = match path.rsplit_once('.') {
        Some((parents, last)) => (Some(parents), last),
        None => (None, path),
    };
    let mut current = target;
    for segment in parents.into_iter().flat_map(|p| p.split('.')) {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

fn delete_path(target: &mut Value, path: &str) {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let mut current = target;
    if let Some(parent) = parent {
        for segment in parent.split('.') {
            match current.get_mut(segment) {
                Some(next) => current = next,
                None => return,
            }
        }
    }
    if let Value::Object(map) = current {
        map.remove(last);
    }
}

/// Folds `next` into `prev` so that applying the result equals applying
/// `prev` then `next`.
///
/// A path of `next` below an existing path of `prev` is written into that
/// entry's value. Any other path replaces its entry and drops the entries
/// of `prev` nested under it.
pub fn fold_mods(prev: &mut Mods, next: &Mods) {
    for (path, value) in next {
        let parent = prev
            .keys()
            .find(|existing| path.starts_with(&format!("{existing}.")))
            .cloned();
        match parent {
            Some(parent) => {
                let rest = &path[parent.len() + 1..];
                if let Some(slot) = prev.get_mut(&parent) {
                    apply_path(slot, rest, value);
                }
            }
            None => {
                let prefix = format!("{path}.");
                prev.retain(|existing, _| !existing.starts_with(&prefix));
                prev.insert(path.clone(), value.clone());
            }
        }
    }
}
