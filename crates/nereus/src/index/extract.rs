//! External reference extraction.
//!
//! Walks node attributes recursively and recognizes identifiers of resources
//! that live outside the repository: AWS ARNs and resource ids, Kubernetes
//! object references, GCP resource names and Azure resource ids. Kubernetes
//! nodes also reference themselves.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blast::Tool;
use crate::error::{Error, Result};
use crate::identity::hash_parts;
use crate::types::GraphNode;

/// Kind of external identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    /// `arn:partition:service:region:account:resource`
    Arn,
    /// AWS resource id such as `vpc-0a1b2c3d`
    ResourceId,
    /// `k8s://namespace/kind/name`
    K8sReference,
    /// `//service.googleapis.com/...` or `projects/...`
    GcpResource,
    /// `/subscriptions/...`
    AzureResource,
}

impl ReferenceType {
    /// All reference types.
    pub const ALL: [Self; 5] = [
        Self::Arn,
        Self::ResourceId,
        Self::K8sReference,
        Self::GcpResource,
        Self::AzureResource,
    ];

    /// Stored representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arn => "arn",
            Self::ResourceId => "resource_id",
            Self::K8sReference => "k8s_reference",
            Self::GcpResource => "gcp_resource",
            Self::AzureResource => "azure_resource",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown reference type: {s}")))
    }
}

/// Attribute keys whose values are authoritative identifiers.
const WELL_KNOWN_KEYS: &[&str] = &["arn", "id", "resource_id", "self_link"];

/// Confidence of a reference found under a well-known key.
pub const WELL_KNOWN_CONFIDENCE: f64 = 1.0;

/// Confidence of a reference found anywhere else.
pub const INCIDENTAL_CONFIDENCE: f64 = 0.8;

/// Context recorded for the reference a Kubernetes node makes to itself.
pub const SELF_CONTEXT: &str = "$node";

static ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:(aws[a-z-]*):([a-z0-9-]+):([a-z0-9-]*):([0-9]{12}|aws)?:(.+)$")
        .expect("valid ARN pattern")
});

static AWS_RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(i|vpc|subnet|sg|igw|eigw|nat|rtb|eni|vol|snap|ami|acl|eipalloc|lt|tgw|pcx|vpce|dopt|cgw|vgw)-([0-9a-f]{8}|[0-9a-f]{17})$",
    )
    .expect("valid AWS resource id pattern")
});

static K8S_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^k8s://([a-z0-9][-a-z0-9]*)/([a-z0-9]+)/([a-z0-9][-a-z0-9.]*)$")
        .expect("valid Kubernetes reference pattern")
});

static GCP_FULL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^//([a-z0-9-]+)\.googleapis\.com/(.+)$").expect("valid GCP full name pattern")
});

static GCP_SELF_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://www\.googleapis\.com/([a-z]+)/v[0-9a-z]+/(projects/.+)$")
        .expect("valid GCP self link pattern")
});

static GCP_RELATIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^projects/([a-z][-a-z0-9]{4,28}[a-z0-9])/([a-z]+)/(.+)$")
        .expect("valid GCP relative name pattern")
});

static AZURE_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/subscriptions/([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})(?:/resourcegroups/([^/]+))?(?:/providers/(.+))?$",
    )
    .expect("valid Azure resource pattern")
});

/// A recognized external identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReference {
    /// Kind of identifier.
    pub reference_type: ReferenceType,
    /// Canonical form used for hashing and reverse lookups.
    pub normalized_id: String,
    /// Named parts, e.g. `service` and `region` of an ARN.
    pub components: BTreeMap<String, String>,
}

impl ParsedReference {
    /// Lookup key of this reference.
    #[must_use]
    pub fn reference_hash(&self) -> String {
        reference_hash(self.reference_type, &self.normalized_id)
    }
}

/// Key of the hot lookup path: hash of the type and the normalized id.
#[must_use]
pub fn reference_hash(reference_type: ReferenceType, normalized_id: &str) -> String {
    hash_parts(&["external-object", reference_type.as_str(), normalized_id])
}

/// Trim and lowercase an identifier. ARNs keep the case of their resource
/// segment, which is case-sensitive for most services.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let is_arn = trimmed
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("arn:"));
    if !is_arn {
        return trimmed.to_lowercase();
    }
    let mut parts = trimmed.splitn(6, ':');
    let mut normalized = Vec::with_capacity(6);
    for _ in 0..5 {
        match parts.next() {
            Some(part) => normalized.push(part.to_lowercase()),
            None => return trimmed.to_lowercase(),
        }
    }
    match parts.next() {
        Some(resource) => normalized.push(resource.to_string()),
        None => return trimmed.to_lowercase(),
    }
    normalized.join(":")
}

fn components(pairs: &[(&str, Option<regex::Match<'_>>)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .filter_map(|&(name, value)| {
            value
                .filter(|m| !m.as_str().is_empty())
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect()
}

/// Recognize an external identifier.
#[must_use]
pub fn parse_reference(raw: &str) -> Option<ParsedReference> {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        return None;
    }

    let parsed = |reference_type, normalized_id: String, components| ParsedReference {
        reference_type,
        normalized_id,
        components,
    };

    if let Some(caps) = ARN.captures(&normalized) {
        let parts = components(&[
            ("partition", caps.get(1)),
            ("service", caps.get(2)),
            ("region", caps.get(3)),
            ("account", caps.get(4)),
            ("resource", caps.get(5)),
        ]);
        return Some(parsed(ReferenceType::Arn, normalized, parts));
    }
    if let Some(caps) = AWS_RESOURCE_ID.captures(&normalized) {
        let parts = components(&[("kind", caps.get(1))]);
        return Some(parsed(ReferenceType::ResourceId, normalized, parts));
    }
    if let Some(caps) = K8S_REFERENCE.captures(&normalized) {
        let parts = components(&[
            ("namespace", caps.get(1)),
            ("kind", caps.get(2)),
            ("name", caps.get(3)),
        ]);
        return Some(parsed(ReferenceType::K8sReference, normalized, parts));
    }
    if let Some(caps) = GCP_FULL_NAME.captures(&normalized) {
        let parts = components(&[("service", caps.get(1)), ("path", caps.get(2))]);
        return Some(parsed(ReferenceType::GcpResource, normalized, parts));
    }
    if let Some(caps) = GCP_SELF_LINK.captures(&normalized) {
        // self links name the same resource as the relative name they embed
        let relative = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let mut parts = components(&[("service", caps.get(1))]);
        if let Some(inner) = GCP_RELATIVE_NAME.captures(&relative) {
            parts.extend(components(&[("project", inner.get(1)), ("collection", inner.get(2))]));
        }
        return Some(parsed(ReferenceType::GcpResource, relative, parts));
    }
    if let Some(caps) = GCP_RELATIVE_NAME.captures(&normalized) {
        let parts = components(&[("project", caps.get(1)), ("collection", caps.get(2))]);
        return Some(parsed(ReferenceType::GcpResource, normalized, parts));
    }
    if let Some(caps) = AZURE_RESOURCE.captures(&normalized) {
        let parts = components(&[
            ("subscription", caps.get(1)),
            ("resourceGroup", caps.get(2)),
            ("provider", caps.get(3)),
        ]);
        return Some(parsed(ReferenceType::AzureResource, normalized, parts));
    }
    None
}

/// A reference found on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedReference {
    /// The identifier as written on the node, trimmed.
    pub external_id: String,
    /// Parsed form.
    #[serde(flatten)]
    pub parsed: ParsedReference,
    /// 0.0..=1.0
    pub confidence: f64,
    /// Attribute path the identifier was found at.
    pub context: String,
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn walk(value: &Value, path: &str, key: Option<&str>, out: &mut Vec<ExtractedReference>) {
    match value {
        Value::String(text) => {
            if let Some(parsed) = parse_reference(text) {
                let confidence = if key.is_some_and(|k| WELL_KNOWN_KEYS.contains(&k)) {
                    WELL_KNOWN_CONFIDENCE
                } else {
                    INCIDENTAL_CONFIDENCE
                };
                out.push(ExtractedReference {
                    external_id: text.trim().to_string(),
                    parsed,
                    confidence,
                    context: path.to_string(),
                });
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{path}[{i}]"), key, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                walk(v, &join_path(path, k), Some(k), out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// The reference a Kubernetes node makes to itself.
fn self_reference(node: &GraphNode) -> Option<ExtractedReference> {
    if Tool::of(&node.node_type) != Tool::Kubernetes {
        return None;
    }
    let kind = node
        .node_type
        .strip_prefix("kubernetes_")
        .or_else(|| node.node_type.strip_prefix("k8s_"))?;
    let namespace = node.namespace.as_deref().unwrap_or("default");
    let external_id = format!("k8s://{namespace}/{kind}/{}", node.name);
    let parsed = parse_reference(&external_id)
        .filter(|p| p.reference_type == ReferenceType::K8sReference)?;
    Some(ExtractedReference {
        external_id,
        parsed,
        confidence: WELL_KNOWN_CONFIDENCE,
        context: SELF_CONTEXT.to_string(),
    })
}

/// Every distinct external reference of a node.
///
/// When the same identifier appears at several paths, the most confident
/// occurrence is kept (the first one on ties).
#[must_use]
pub fn extract_references(node: &GraphNode) -> Vec<ExtractedReference> {
    let mut found = Vec::new();
    if let Some(reference) = self_reference(node) {
        found.push(reference);
    }
    for (key, value) in &node.attributes {
        walk(value, key, Some(key), &mut found);
    }

    let mut positions: HashMap<(ReferenceType, String), usize> = HashMap::new();
    let mut distinct: Vec<ExtractedReference> = Vec::with_capacity(found.len());
    for reference in found {
        let key = (
            reference.parsed.reference_type,
            reference.parsed.normalized_id.clone(),
        );
        match positions.get(&key) {
            Some(&i) if distinct[i].confidence < reference.confidence => distinct[i] = reference,
            Some(_) => {}
            None => {
                positions.insert(key, distinct.len());
                distinct.push(reference);
            }
        }
    }
    distinct
}
