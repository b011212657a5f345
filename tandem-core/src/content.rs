//! Block tree view of a document.
//!
//! The sequence of visible atoms is folded into nodes: every block marker
//! starts a node, characters append to the current node's text.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::{AtomId, DEFAULT_BLOCK};

/// One block of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: AtomId,
    pub kind: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
}

/// Visible content of a document, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub blocks: Vec<Node>,
}

impl Content {
    /// The canonical empty document: the genesis paragraph, no text, no
    /// attributes.
    pub fn empty() -> Self {
        Self {
            blocks: vec![Node {
                id: AtomId::GENESIS,
                kind: DEFAULT_BLOCK.to_string(),
                attrs: BTreeMap::new(),
                text: String::new(),
            }],
        }
    }

    /// Whether the JSON export equals that of [`Content::empty`]. A second
    /// blank paragraph or an attribute on the genesis block makes the
    /// document non-empty.
    pub fn is_empty_document(&self) -> bool {
        self.to_json() == Self::empty().to_json()
    }

    /// Plain text, one line per block.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Editor-style JSON: `{"type":"doc","content":[{"type":"paragraph",…}]}`.
    pub fn to_json(&self) -> Value {
        let blocks: Vec<Value> = self
            .blocks
            .iter()
            .map(|node| {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::String(node.kind.clone()));
                if !node.attrs.is_empty() {
                    obj.insert("attrs".into(), json!(node.attrs));
                }
                if !node.text.is_empty() {
                    obj.insert(
                        "content".into(),
                        json!([{ "type": "text", "text": node.text }]),
                    );
                }
                Value::Object(obj)
            })
            .collect();
        json!({ "type": "doc", "content": blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OpId, ReplicaId};

    #[test]
    fn test_empty_json_shape() {
        let expected = json!({ "type": "doc", "content": [{ "type": "paragraph" }] });
        assert_eq!(Content::empty().to_json(), expected);
        assert!(Content::empty().is_empty_document());
    }

    #[test]
    fn test_text_joins_blocks() {
        let mut content = Content::empty();
        content.blocks[0].text = "Hello".into();
        content.blocks.push(Node {
            id: AtomId::new(OpId::new(ReplicaId::random(), 1), 0),
            kind: "heading".into(),
            attrs: BTreeMap::from([("level".to_string(), "2".to_string())]),
            text: "World".into(),
        });
        assert_eq!(content.text(), "Hello\nWorld");
        assert!(!content.is_empty_document());

        let json = content.to_json();
        assert_eq!(json["content"][1]["attrs"]["level"], "2");
        assert_eq!(json["content"][0]["content"][0]["text"], "Hello");
    }

    #[test]
    fn test_blank_second_paragraph_is_not_empty() {
        let mut content = Content::empty();
        content.blocks.push(Node {
            id: AtomId::new(OpId::new(ReplicaId::random(), 1), 0),
            kind: DEFAULT_BLOCK.into(),
            attrs: BTreeMap::new(),
            text: String::new(),
        });
        assert!(!content.is_empty_document());
    }

    #[test]
    fn test_empty_check_matches_json_export() {
        let mut content = Content::empty();
        content.blocks[0].attrs.insert("align".into(), "left".into());
        assert_eq!(
            content.to_json(),
            json!({ "type": "doc", "content": [{ "type": "paragraph", "attrs": { "align": "left" } }] })
        );
        assert!(!content.is_empty_document());

        content.blocks[0].attrs.clear();
        assert!(content.is_empty_document());
    }
}
