//! Java method syntax trees and their flattened token form.
//!
//! Methods are parsed with tree-sitter and copied into an owned arena so the
//! rest of the pipeline never holds parser lifetimes. Arena order is the
//! pre-order walk, which is also the flattening order.

pub mod change_tree;
pub mod corpus;

use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::fingerprint::stable_hash_str;

pub use change_tree::ChangeTree;

const WRAPPER_OPEN: &str = "class VichangeWrapper {\n";
const WRAPPER_CLOSE: &str = "\n}\n";
const METHOD_KINDS: [&str; 2] = ["method_declaration", "constructor_declaration"];
const COMMENT_KINDS: [&str; 2] = ["line_comment", "block_comment"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("java grammar could not be loaded: {0}")]
    Language(String),
    #[error("source has syntax errors")]
    Unparsable,
    #[error("no method or constructor declaration found")]
    NoMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxNode {
    pub kind: String,
    /// Source text, kept for leaves only.
    pub text: Option<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Structural id: hash of the node's depth, rank among same-kind
    /// siblings, kind and leaf text, chained with its parent's id.
    pub id: u64,
}

impl SyntaxNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxTree {
    nodes: Vec<SyntaxNode>,
}

impl SyntaxTree {
    pub fn root(&self) -> &SyntaxNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &SyntaxNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn flatten(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for node in &self.nodes {
            push_node_tokens(&node.kind, node.text.as_deref(), node.is_leaf(), &mut tokens);
        }
        tokens
    }

    /// Root-to-leaf index paths, in pre-order of their leaves.
    pub fn root_paths(&self, limit: usize) -> Vec<Vec<usize>> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf())
            .take(limit)
            .map(|(idx, _)| {
                let mut path = vec![idx];
                let mut current = self.nodes[idx].parent;
                while let Some(parent) = current {
                    path.push(parent);
                    current = self.nodes[parent].parent;
                }
                path.reverse();
                path
            })
            .collect()
    }

    fn from_ts_node(root: Node<'_>, source: &[u8]) -> Self {
        let mut nodes: Vec<SyntaxNode> = Vec::new();
        let mut stack: Vec<(Node<'_>, Option<usize>, usize)> = vec![(root, None, 0)];

        while let Some((node, parent, depth)) = stack.pop() {
            let idx = nodes.len();
            let kind = node.kind().to_string();
            let text = if node.child_count() == 0 {
                node.utf8_text(source).ok().map(ToOwned::to_owned)
            } else {
                None
            };

            let (rank, parent_id) = match parent {
                Some(parent_idx) => {
                    let siblings = &nodes[parent_idx].children;
                    let rank = siblings
                        .iter()
                        .filter(|sibling| nodes[**sibling].kind == kind)
                        .count();
                    (rank, nodes[parent_idx].id)
                }
                None => (0, 0),
            };
            let mut relative = format!("{depth}_{rank}_{kind}");
            if let Some(text) = text.as_deref().filter(|text| !text.is_empty()) {
                relative.push('_');
                relative.push_str(text);
            }
            let id = stable_hash_str(&format!("{parent_id:016x}/{relative}"));

            nodes.push(SyntaxNode {
                kind,
                text,
                parent,
                children: Vec::new(),
                id,
            });
            if let Some(parent_idx) = parent {
                nodes[parent_idx].children.push(idx);
            }

            for child_idx in (0..node.child_count()).rev() {
                if let Some(child) = node.child(child_idx) {
                    stack.push((child, Some(idx), depth + 1));
                }
            }
        }

        Self { nodes }
    }
}

/// Parses one method (or constructor) given as bare source. Empty source is
/// an absent side of the change, not an error.
pub fn parse_method(source: &str) -> Result<Option<SyntaxTree>, SyntaxError> {
    if source.trim().is_empty() {
        return Ok(None);
    }

    let wrapped = format!("{WRAPPER_OPEN}{source}{WRAPPER_CLOSE}");
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_java::language())
        .map_err(|err| SyntaxError::Language(err.to_string()))?;
    let tree = parser
        .parse(&wrapped, None)
        .ok_or(SyntaxError::Unparsable)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(SyntaxError::Unparsable);
    }

    let method = first_method(root).ok_or(SyntaxError::NoMethod)?;
    Ok(Some(SyntaxTree::from_ts_node(method, wrapped.as_bytes())))
}

/// Parses a whole compilation unit. Each method found comes back on its
/// own, so one broken method does not hide the rest of the file.
pub fn parse_file_methods(
    source: &str,
) -> Result<Vec<Result<SyntaxTree, SyntaxError>>, SyntaxError> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_java::language())
        .map_err(|err| SyntaxError::Language(err.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or(SyntaxError::Unparsable)?;

    let mut methods = Vec::new();
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        if METHOD_KINDS.contains(&node.kind()) {
            methods.push(if node.has_error() {
                Err(SyntaxError::Unparsable)
            } else {
                Ok(SyntaxTree::from_ts_node(node, source.as_bytes()))
            });
            continue;
        }
        for idx in (0..node.child_count()).rev() {
            if let Some(child) = node.child(idx) {
                stack.push(child);
            }
        }
    }
    Ok(methods)
}

fn first_method(root: Node<'_>) -> Option<Node<'_>> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if METHOD_KINDS.contains(&node.kind()) {
            return Some(node);
        }
        for idx in (0..node.child_count()).rev() {
            if let Some(child) = node.child(idx) {
                stack.push(child);
            }
        }
    }
    None
}

pub(crate) fn push_node_tokens(kind: &str, text: Option<&str>, is_leaf: bool, out: &mut Vec<String>) {
    if COMMENT_KINDS.contains(&kind) {
        return;
    }
    out.push(normalize_token(kind));
    if !is_leaf {
        return;
    }
    if let Some(text) = text.filter(|text| !text.is_empty() && *text != kind) {
        out.push(normalize_token(text));
    }
}

/// Makes a token safe to store as one CSV field and case-folds it the same
/// way the dictionary does.
pub fn normalize_token(raw: &str) -> String {
    raw.trim()
        .replace(',', ";")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
        .to_lowercase()
}
