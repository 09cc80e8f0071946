use std::collections::HashSet;

use crate::syntax::{SyntaxTree, push_node_tokens};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChangeNode {
    id: u64,
    kind: String,
    text: Option<String>,
    children: Vec<usize>,
}

/// The part of one method version that the other version lacks: every
/// root-to-leaf path whose leaf id is absent on the other side, merged back
/// into a tree that shares prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeTree {
    nodes: Vec<ChangeNode>,
}

impl ChangeTree {
    /// Builds the change tree of `base` relative to `other`. Paths are added
    /// in `base`'s leaf order; at most `max_paths` leaves per side are
    /// considered.
    pub fn between(base: &SyntaxTree, other: &SyntaxTree, max_paths: usize) -> Self {
        let other_leaves = other
            .root_paths(max_paths)
            .iter()
            .filter_map(|path| path.last().map(|idx| other.node(*idx).id))
            .collect::<HashSet<_>>();

        let mut tree = Self::default();
        for path in base.root_paths(max_paths) {
            let Some(leaf) = path.last() else {
                continue;
            };
            if !other_leaves.contains(&base.node(*leaf).id) {
                tree.add_path(base, &path);
            }
        }
        tree
    }

    fn add_path(&mut self, source: &SyntaxTree, path: &[usize]) {
        let Some((first, rest)) = path.split_first() else {
            return;
        };
        if self.nodes.is_empty() {
            self.nodes.push(Self::copy_node(source, *first));
        }

        let mut current = 0;
        for idx in rest {
            let id = source.node(*idx).id;
            let existing = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|child| self.nodes[*child].id == id);
            current = match existing {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Self::copy_node(source, *idx));
                    self.nodes[current].children.push(child);
                    child
                }
            };
        }
    }

    fn copy_node(source: &SyntaxTree, idx: usize) -> ChangeNode {
        let node = source.node(idx);
        ChangeNode {
            id: node.id,
            kind: node.kind.clone(),
            text: node.text.clone(),
            children: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.children.is_empty()).count()
    }

    pub fn flatten(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        if self.nodes.is_empty() {
            return tokens;
        }
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            push_node_tokens(
                &node.kind,
                node.text.as_deref(),
                node.children.is_empty(),
                &mut tokens,
            );
            stack.extend(node.children.iter().rev());
        }
        tokens
    }
}

/// Change trees for both sides of a method change: (removed, added).
pub fn change_trees(
    before: &SyntaxTree,
    after: &SyntaxTree,
    max_paths: usize,
) -> (ChangeTree, ChangeTree) {
    (
        ChangeTree::between(before, after, max_paths),
        ChangeTree::between(after, before, max_paths),
    )
}
