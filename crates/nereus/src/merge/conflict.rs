//! Attribute conflict detection and resolution.

use std::collections::HashMap;

use serde_json::Value;

use super::types::{AttributeConflict, ConflictResolution};
use crate::types::{Attributes, GraphNode};

/// Resolved attributes of one match group.
pub(crate) struct Resolved {
    pub(crate) attributes: Attributes,
    pub(crate) conflicts: Vec<AttributeConflict>,
}

/// Most frequent value; ties go to the value seen first.
pub(crate) fn most_common<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, value) in values.into_iter().enumerate() {
        counts.entry(value).or_insert((0, position)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(value, _)| value)
}

/// Resolve attributes of `members` (in input order) with `strategy`.
pub(crate) fn resolve_attributes(members: &[&GraphNode], strategy: ConflictResolution) -> Resolved {
    let mut keys: Vec<&String> = Vec::new();
    for member in members {
        for key in member.attributes.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let mut attributes = Attributes::new();
    let mut conflicts = Vec::new();

    for key in keys {
        let present: Vec<&Value> = members
            .iter()
            .filter_map(|m| m.attributes.get(key))
            .filter(|v| !v.is_null())
            .collect();

        let mut distinct: Vec<&Value> = Vec::new();
        for &value in &present {
            if !distinct.contains(&value) {
                distinct.push(value);
            }
        }

        let resolved = match strategy {
            ConflictResolution::First => present.first().map(|v| (*v).clone()),
            ConflictResolution::Last => present.last().map(|v| (*v).clone()),
            ConflictResolution::Merge => present.iter().fold(None, |acc, value| match acc {
                None => Some((*value).clone()),
                Some(mut merged) => {
                    merge_value(&mut merged, value);
                    Some(merged)
                }
            }),
        }
        .unwrap_or(Value::Null);

        if distinct.len() > 1 {
            conflicts.push(AttributeConflict {
                key: key.clone(),
                values: distinct.into_iter().cloned().collect(),
                resolved: resolved.clone(),
            });
        }
        attributes.insert(key.clone(), resolved);
    }

    Resolved {
        attributes,
        conflicts,
    }
}

/// Merge `incoming` into `acc`.
///
/// Objects merge key by key, arrays take the union of their items, and a
/// non-null scalar already in `acc` is kept.
fn merge_value(acc: &mut Value, incoming: &Value) {
    match (acc, incoming) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(key) {
                    Some(existing) if !existing.is_null() => merge_value(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => {
            for item in source {
                if !target.contains(item) {
                    target.push(item.clone());
                }
            }
        }
        (slot @ Value::Null, value) => *slot = value.clone(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(attrs: Value) -> GraphNode {
        let mut node = GraphNode::new("n", "aws_s3_bucket", "b", "r", "s");
        if let Value::Object(map) = attrs {
            node.attributes = map;
        }
        node
    }

    #[test]
    fn most_common_breaks_ties_by_first_seen() {
        assert_eq!(most_common(["b", "a", "a", "b"]), Some("b"));
        assert_eq!(most_common(["x", "y", "y"]), Some("y"));
        assert_eq!(most_common(std::iter::empty()), None);
    }

    #[test]
    fn merge_strategy_unions_structures() {
        let a = node(json!({"tags": {"env": "prod"}, "ports": [80], "region": "us-east-1"}));
        let b = node(json!({"tags": {"team": "core"}, "ports": [80, 443], "region": "eu-west-1"}));

        let resolved = resolve_attributes(&[&a, &b], ConflictResolution::Merge);

        assert_eq!(
            Value::Object(resolved.attributes),
            json!({
                "tags": {"env": "prod", "team": "core"},
                "ports": [80, 443],
                "region": "us-east-1"
            })
        );
        let mut conflicting: Vec<&str> =
            resolved.conflicts.iter().map(|c| c.key.as_str()).collect();
        conflicting.sort_unstable();
        assert_eq!(conflicting, ["ports", "region", "tags"]);
    }

    #[test]
    fn first_and_last_pick_by_position() {
        let a = node(json!({"size": 1, "only_a": true}));
        let b = node(json!({"size": 2}));

        let first = resolve_attributes(&[&a, &b], ConflictResolution::First);
        let last = resolve_attributes(&[&a, &b], ConflictResolution::Last);

        assert_eq!(first.attributes["size"], json!(1));
        assert_eq!(last.attributes["size"], json!(2));
        assert_eq!(last.attributes["only_a"], json!(true));
        assert_eq!(first.conflicts.len(), 1);
    }

    #[test]
    fn nulls_are_not_conflicts() {
        let a = node(json!({"kms_key": null}));
        let b = node(json!({"kms_key": "key-1"}));

        let resolved = resolve_attributes(&[&a, &b], ConflictResolution::Merge);
        assert!(resolved.conflicts.is_empty());
        assert_eq!(resolved.attributes["kms_key"], json!("key-1"));
    }
}
