use std::collections::HashMap;
use std::{error, fmt};

use serde::Deserialize;

/// Document-level metadata. Free-form; carried into the header comment
/// of the generated assembly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub name: String,
    pub author: String,
    pub description: String,
}

/// A parameter value as it appears in the document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => value.fmt(f),
            Self::Number(value) => value.fmt(f),
            Self::Text(value) => value.fmt(f),
        }
    }
}

/// One block instance. `kind` selects a `BlockKind` from the registry;
/// `position` is editor state the compiler carries but never reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub position: serde_json::Value,
    #[serde(default)]
    pub parameters: HashMap<String, ParamValue>,
}

/// One endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRef {
    pub block_id: String,
    pub port_id: String,
}

/// A directed edge from an output port to an input port.
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    pub from: PortRef,
    pub to: PortRef,
}

/// The block-diagram document: blocks in document order plus the
/// connection list. Document order is preserved so compilation is
/// deterministic for a given file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockGraph {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug)]
pub struct ParseError(serde_json::Error);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed block diagram: {}", self.0)
    }
}

impl error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(error: serde_json::Error) -> Self {
        Self(error)
    }
}

impl BlockGraph {
    /// Parse the JSON document format. Unknown fields are ignored.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// The connection feeding `(block, port)`, if any. Validation
    /// guarantees there is at most one.
    #[must_use]
    pub fn connection_to(&self, block: &str, port: &str) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.to.block_id == block && c.to.port_id == port)
    }

    /// True when `(block, port)` drives at least one connection.
    #[must_use]
    pub fn is_source(&self, block: &str, port: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.from.block_id == block && c.from.port_id == port)
    }

    /// Connections leaving any output of `block`, in document order.
    pub fn connections_from(&self, block: &str) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(move |c| c.from.block_id == block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "metadata": {"name": "probe", "author": "t", "description": ""},
        "blocks": [
            {"id": "a", "type": "input", "position": {"x": 0, "y": 0},
             "parameters": {"channel": "left"}},
            {"id": "b", "type": "output", "parameters": {"muted": false, "level": -3.5}}
        ],
        "connections": [
            {"id": "c1", "from": {"blockId": "a", "portId": "out"},
             "to": {"blockId": "b", "portId": "in"}}
        ],
        "editorZoom": 1.5
    }"#;

    #[test]
    fn parses_document_and_ignores_unknown_fields() {
        let graph = BlockGraph::from_json(DOC).unwrap();
        assert_eq!("probe", graph.metadata.name);
        assert_eq!(2, graph.blocks.len());
        assert_eq!("input", graph.block("a").unwrap().kind);
        assert_eq!(
            Some("left"),
            graph.blocks[0].parameters["channel"].as_text()
        );
        assert_eq!(Some(false), graph.blocks[1].parameters["muted"].as_bool());
        assert_eq!(Some(-3.5), graph.blocks[1].parameters["level"].as_number());
    }

    #[test]
    fn connection_lookups() {
        let graph = BlockGraph::from_json(DOC).unwrap();
        assert!(graph.is_source("a", "out"));
        assert!(!graph.is_source("b", "in"));
        let connection = graph.connection_to("b", "in").unwrap();
        assert_eq!("a", connection.from.block_id);
        assert_eq!(1, graph.connections_from("a").count());
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(BlockGraph::from_json("{not json").is_err());
    }
}
