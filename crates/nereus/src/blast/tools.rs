//! Tool classification of node types and the cross-tool edge taxonomy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Infrastructure tool that owns a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Terraform and Terragrunt, the default for unrecognized types.
    Terraform,
    /// Helm charts and releases.
    Helm,
    /// Kubernetes manifests.
    Kubernetes,
    /// CI/CD pipelines.
    Ci,
    /// Argo CD applications.
    Argocd,
}

/// Node type prefixes, checked in order. Unlisted types are Terraform.
const PREFIXES: &[(&str, Tool)] = &[
    ("helm_", Tool::Helm),
    ("k8s_", Tool::Kubernetes),
    ("kubernetes_", Tool::Kubernetes),
    ("ci_", Tool::Ci),
    ("github_actions_", Tool::Ci),
    ("gitlab_ci_", Tool::Ci),
    ("pipeline", Tool::Ci),
    ("argocd_", Tool::Argocd),
];

/// Edge types that connect resources of different tools.
pub const CROSS_TOOL_EDGE_TYPES: &[&str] = &[
    "FEEDS_INTO",
    "OPERATES_ON",
    "PIPELINE_CONTAINS",
    "TG_SOURCES",
    "TG_DEPENDS_ON",
];

impl Tool {
    /// Every tool, in reporting order.
    pub const ALL: [Self; 5] = [
        Self::Terraform,
        Self::Helm,
        Self::Kubernetes,
        Self::Ci,
        Self::Argocd,
    ];

    /// Tool owning nodes of `node_type`.
    #[must_use]
    pub fn of(node_type: &str) -> Self {
        let lowered = node_type.to_ascii_lowercase();
        PREFIXES
            .iter()
            .find(|(prefix, _)| lowered.starts_with(prefix))
            .map_or(Self::Terraform, |&(_, tool)| tool)
    }

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terraform => "terraform",
            Self::Helm => "helm",
            Self::Kubernetes => "kubernetes",
            Self::Ci => "ci",
            Self::Argocd => "argocd",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Config(format!("unknown tool: {s}")))
    }
}

/// `true` if an edge of `edge_type` between `from` and `to` crosses a tool
/// boundary. Same-tool edges never do, whatever their type.
#[must_use]
pub fn is_cross_tool_edge(edge_type: &str, from: Tool, to: Tool) -> bool {
    from != to && CROSS_TOOL_EDGE_TYPES.contains(&edge_type)
}
