//! Snapshot hierarchy
//!
//! Snapshots form a tree: each new snapshot is a child of the current one.
//! Nodes live in an arena and refer to each other by index, so the structure
//! owns every node and cannot contain cycles. Removed nodes leave a tombstone
//! so live indices stay stable; the next push reuses the slot. Lookups walk the tree depth-first with an explicit
//! stack.

use crate::capabilities::{SnapshotDisk, SnapshotRef};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arena index of a snapshot node
pub type SnapshotId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub parent: Option<SnapshotId>,
    pub children: Vec<SnapshotId>,
    pub disks: BTreeMap<String, SnapshotDisk>,
}

impl SnapshotNode {
    pub fn to_ref(&self) -> SnapshotRef {
        SnapshotRef {
            id: self.id.clone(),
            name: self.name.clone(),
            disks: self.disks.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    nodes: Vec<Option<SnapshotNode>>,
    roots: Vec<SnapshotId>,
    current: Option<SnapshotId>,
    /// Tombstoned slots, reused by `push`
    #[serde(default)]
    free: Vec<SnapshotId>,
}

impl SnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: SnapshotId) -> Option<&SnapshotNode> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn current(&self) -> Option<SnapshotId> {
        self.current
    }

    /// Add a snapshot below the current one and make it current
    pub fn push(&mut self, id: String, name: String, created_at: String, disks: BTreeMap<String, SnapshotDisk>) -> SnapshotId {
        let parent = self.current;
        let node = Some(SnapshotNode {
            id,
            name,
            created_at,
            parent,
            children: Vec::new(),
            disks,
        });
        let index = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        match parent.and_then(|p| self.nodes[p].as_mut()) {
            Some(parent) => parent.children.push(index),
            None => self.roots.push(index),
        }
        self.current = Some(index);
        index
    }

    /// Depth-first pre-order walk over live nodes
    pub fn iter_dfs(&self) -> DfsIter<'_> {
        let mut stack: Vec<SnapshotId> = self.roots.clone();
        stack.reverse();
        DfsIter { tree: self, stack }
    }

    /// First snapshot named `name` in depth-first order
    pub fn find_by_name(&self, name: &str) -> Option<SnapshotId> {
        self.iter_dfs()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
    }

    /// Remove one snapshot. Its children move up to its parent.
    pub fn remove(&mut self, id: SnapshotId) -> Option<SnapshotNode> {
        let node = self.nodes.get_mut(id)?.take()?;

        let siblings = match node.parent.and_then(|p| self.nodes[p].as_mut()) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        let position = siblings.iter().position(|c| *c == id).unwrap_or(siblings.len());
        siblings.splice(position..(position + 1).min(siblings.len()), node.children.iter().copied());

        for child in &node.children {
            if let Some(c) = self.nodes[*child].as_mut() {
                c.parent = node.parent;
            }
        }
        if self.current == Some(id) {
            self.current = node.parent;
        }
        self.free.push(id);
        Some(node)
    }

    /// Drop every snapshot, returning them in depth-first order
    pub fn clear(&mut self) -> Vec<SnapshotNode> {
        let order: Vec<SnapshotId> = self.iter_dfs().map(|(id, _)| id).collect();
        let removed = order
            .into_iter()
            .filter_map(|id| self.nodes[id].take())
            .collect();
        self.nodes.clear();
        self.roots.clear();
        self.free.clear();
        self.current = None;
        removed
    }
}

pub struct DfsIter<'a> {
    tree: &'a SnapshotTree,
    stack: Vec<SnapshotId>,
}

impl<'a> Iterator for DfsIter<'a> {
    type Item = (SnapshotId, &'a SnapshotNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if let Some(node) = self.tree.get(id) {
                self.stack.extend(node.children.iter().rev().copied());
                return Some((id, node));
            }
        }
        None
    }
}
