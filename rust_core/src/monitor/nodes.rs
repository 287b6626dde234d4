//! Star-chart node names.
//!
//! Loaded from a `solNodes.json`-shaped file:
//! `{"SolNode1": {"value": "Galatea (Neptune)", "enemy": "Corpus"}}`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub planet: String,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    value: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: HashMap<String, NodeInfo>,
}

impl NodeDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read node file {}", path.display()))?;
        let directory = Self::from_json(&raw)
            .with_context(|| format!("Failed to parse node file {}", path.display()))?;
        info!("Loaded {} star-chart nodes from {}", directory.len(), path.display());
        Ok(directory)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: HashMap<String, RawNode> = serde_json::from_str(raw)?;
        let nodes = parsed
            .into_iter()
            .map(|(id, node)| (id, split_label(&node.value)))
            .collect();
        Ok(Self { nodes })
    }

    /// Name and planet for a node id. Unknown ids resolve to themselves on
    /// an empty planet.
    pub fn resolve(&self, node_id: &str) -> NodeInfo {
        self.nodes.get(node_id).cloned().unwrap_or_else(|| NodeInfo {
            name: node_id.to_string(),
            planet: String::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// "Galatea (Neptune)" -> ("Galatea", "Neptune")
fn split_label(label: &str) -> NodeInfo {
    let label = label.trim();
    match (label.rfind('('), label.ends_with(')')) {
        (Some(open), true) if open > 0 => NodeInfo {
            name: label[..open].trim().to_string(),
            planet: label[open + 1..label.len() - 1].trim().to_string(),
        },
        _ => NodeInfo {
            name: label.to_string(),
            planet: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "SolNode1": {"value": "Galatea (Neptune)", "enemy": "Corpus"},
        "SolNode231": {"value": "Tuvul Commons (Zariman)"},
        "MercuryHUB": {"value": "Larunda Relay"}
    }"#;

    #[test]
    fn test_resolve_known_nodes() {
        let nodes = NodeDirectory::from_json(SAMPLE).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(
            nodes.resolve("SolNode1"),
            NodeInfo {
                name: "Galatea".to_string(),
                planet: "Neptune".to_string()
            }
        );
        assert_eq!(nodes.resolve("SolNode231").planet, "Zariman");
        assert_eq!(nodes.resolve("MercuryHUB").name, "Larunda Relay");
        assert_eq!(nodes.resolve("MercuryHUB").planet, "");
    }

    #[test]
    fn test_unknown_node_resolves_to_id() {
        let info = NodeDirectory::empty().resolve("SolNode999");
        assert_eq!(info.name, "SolNode999");
        assert!(info.planet.is_empty());
    }

    #[test]
    fn test_rejects_malformed_file() {
        assert!(NodeDirectory::from_json(r#"{"SolNode1": 4}"#).is_err());
    }
}
