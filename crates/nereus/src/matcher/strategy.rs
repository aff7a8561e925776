//! Matcher configurations and the keys they derive from nodes.
//!
//! Each strategy maps a node to an optional *match key*. Two nodes from
//! different graphs match under a strategy iff both have a key and the keys
//! are equal, so candidates are found by bucketing on the key instead of
//! comparing every pair.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::GraphNode;

/// Attribute carrying a node's ARN.
const ARN_ATTRIBUTE: &str = "arn";

/// Attribute carrying a node's tags.
const TAGS_ATTRIBUTE: &str = "tags";

fn default_id_attribute() -> String {
    "id".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    50
}

fn default_confidence() -> u8 {
    100
}

/// How a matcher decides two nodes are the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MatchStrategy {
    /// Equal ARNs, optionally restricted to ARNs matching a wildcard pattern.
    Arn {
        /// `*` matches any run of characters, `?` exactly one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// Equal non-empty values of a resource id attribute.
    ResourceId {
        /// Attribute holding the provider resource id.
        #[serde(default = "default_id_attribute")]
        attribute: String,
    },
    /// Same type and name, and equal values for every required tag.
    NameTag {
        /// Tags that must be present with equal values on both nodes.
        #[serde(default)]
        required_tags: Vec<String>,
    },
}

/// Short name of a strategy, reported on each match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherType {
    /// See [`MatchStrategy::Arn`].
    Arn,
    /// See [`MatchStrategy::ResourceId`].
    ResourceId,
    /// See [`MatchStrategy::NameTag`].
    NameTag,
}

impl MatcherType {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arn => "arn",
            Self::ResourceId => "resource_id",
            Self::NameTag => "name_tag",
        }
    }
}

/// One configured matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherConfig {
    /// Matching strategy and its parameters.
    #[serde(flatten)]
    pub strategy: MatchStrategy,
    /// Disabled matchers are validated but never run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Wins over lower priorities when two matchers pair the same nodes.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Confidence (0..=100) assigned to matches from this matcher.
    #[serde(default = "default_confidence")]
    pub confidence: u8,
}

impl MatcherConfig {
    /// An enabled matcher with default priority and full confidence.
    #[must_use]
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            strategy,
            enabled: true,
            priority: default_priority(),
            confidence: default_confidence(),
        }
    }

    /// ARN matcher without a pattern.
    #[must_use]
    pub fn arn() -> Self {
        Self::new(MatchStrategy::Arn { pattern: None })
    }

    /// Resource id matcher on the `id` attribute.
    #[must_use]
    pub fn resource_id() -> Self {
        Self::new(MatchStrategy::ResourceId {
            attribute: default_id_attribute(),
        })
    }

    /// Name + tag matcher.
    #[must_use]
    pub fn name_tag(required_tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(MatchStrategy::NameTag {
            required_tags: required_tags.into_iter().map(Into::into).collect(),
        })
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence;
        self
    }

    /// Enable or disable the matcher.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Strategy name.
    #[must_use]
    pub fn matcher_type(&self) -> MatcherType {
        match self.strategy {
            MatchStrategy::Arn { .. } => MatcherType::Arn,
            MatchStrategy::ResourceId { .. } => MatcherType::ResourceId,
            MatchStrategy::NameTag { .. } => MatcherType::NameTag,
        }
    }
}

/// Why an ARN pattern was rejected.
pub(crate) fn check_arn_pattern(pattern: &str) -> std::result::Result<(), String> {
    if pattern.trim().is_empty() {
        return Err("pattern must not be empty".to_string());
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(format!("pattern '{pattern}' contains whitespace"));
    }
    if !(pattern.starts_with("arn:") || pattern.starts_with('*')) {
        return Err(format!("pattern '{pattern}' must start with 'arn:' or '*'"));
    }
    Ok(())
}

/// Translate a wildcard pattern into an anchored regex.
pub(crate) fn compile_arn_pattern(pattern: &str) -> std::result::Result<Regex, String> {
    check_arn_pattern(pattern)?;
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| format!("pattern '{pattern}' does not compile: {e}"))
}

/// A matcher ready to derive keys.
#[derive(Debug)]
pub(crate) struct CompiledMatcher {
    pub(crate) config: MatcherConfig,
    arn_pattern: Option<Regex>,
}

impl CompiledMatcher {
    pub(crate) fn compile(config: &MatcherConfig) -> std::result::Result<Self, String> {
        let arn_pattern = match &config.strategy {
            MatchStrategy::Arn {
                pattern: Some(pattern),
            } => Some(compile_arn_pattern(pattern)?),
            _ => None,
        };
        Ok(Self {
            config: config.clone(),
            arn_pattern,
        })
    }

    /// Key under which `node` is bucketed, `None` if the strategy does not apply.
    pub(crate) fn key(&self, node: &GraphNode) -> Option<String> {
        match &self.config.strategy {
            MatchStrategy::Arn { .. } => {
                let arn = node.attribute_str(ARN_ATTRIBUTE)?.trim();
                if !arn.starts_with("arn:") {
                    return None;
                }
                if let Some(pattern) = &self.arn_pattern {
                    if !pattern.is_match(arn) {
                        return None;
                    }
                }
                Some(arn.to_string())
            }
            MatchStrategy::ResourceId { attribute } => {
                let value = node.attributes.get(attribute)?;
                let id = match value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                (!id.is_empty()).then_some(id)
            }
            MatchStrategy::NameTag { required_tags } => {
                let mut key = format!("{}\u{0}{}", node.node_type, node.name);
                if !required_tags.is_empty() {
                    let tags = node.attributes.get(TAGS_ATTRIBUTE)?.as_object()?;
                    for tag in required_tags {
                        let value = tags.get(tag).filter(|v| !v.is_null())?;
                        key.push('\u{0}');
                        key.push_str(tag);
                        key.push('=');
                        key.push_str(&value.to_string());
                    }
                }
                Some(key)
            }
        }
    }
}
