//! Attribute-level comparison.

use serde_json::Value;

use super::types::{AttributeChange, AttributeChangeType};
use crate::types::Attributes;

/// Compare two attribute maps.
///
/// Objects are walked recursively and reported with dotted paths; arrays and
/// scalars are compared as whole values. Output is ordered by path.
#[must_use]
pub fn diff_attributes(base: &Attributes, target: &Attributes) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    diff_maps("", base, target, &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn diff_maps(prefix: &str, base: &Attributes, target: &Attributes, out: &mut Vec<AttributeChange>) {
    for (key, old) in base {
        let path = join(prefix, key);
        match target.get(key) {
            None => out.push(AttributeChange {
                path,
                previous_value: Some(old.clone()),
                new_value: None,
                change_type: AttributeChangeType::Removed,
            }),
            Some(new) => diff_values(path, old, new, out),
        }
    }
    for (key, new) in target {
        if !base.contains_key(key) {
            out.push(AttributeChange {
                path: join(prefix, key),
                previous_value: None,
                new_value: Some(new.clone()),
                change_type: AttributeChangeType::Added,
            });
        }
    }
}

fn diff_values(path: String, old: &Value, new: &Value, out: &mut Vec<AttributeChange>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_maps(&path, a, b, out),
        _ if old == new => {}
        _ => out.push(AttributeChange {
            path,
            previous_value: Some(old.clone()),
            new_value: Some(new.clone()),
            change_type: AttributeChangeType::Modified,
        }),
    }
}
