// src/transfer/snapshot.rs

//! Repository snapshot trie
//!
//! Models the directory tree of a repository while it is being migrated.
//! Every directory is one node in an arena addressed by `NodeId`; parent
//! and children are stored as ids, so the tree serialises flat and loads
//! without a back-reference fixup pass.
//!
//! Each node is in one of three states:
//!  1. Unexplored / partially explored - not all contents of the directory
//!     were found yet (`!done_exploring`).
//!  2. Fully explored - all contents found, not all handled
//!     (`done_exploring && !completed`).
//!  3. Completed - all contents found and handled (`completed`).
//!
//! When a node completes, the tree collapses: the node clears its contents,
//! detaches from its parent's children map and asks the parent to check
//! completion as well. `check_completed` is the only source of collapsing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Index of a node inside the snapshot arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) usize);

pub const ROOT: NodeId = NodeId(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    name: String,
    parent: Option<NodeId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, NodeId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    files: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    done_exploring: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    completed: bool,
}

impl Node {
    fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: BTreeMap::new(),
            files: BTreeSet::new(),
            done_exploring: false,
            completed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSnapshot {
    nodes: Vec<Node>,
}

impl Default for RepoSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl RepoSnapshot {
    /// Create a fresh snapshot holding only the root node "."
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(".", None)],
        }
    }

    /// Load a snapshot from `path` if one exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&content).map_err(|e| {
            Error::StateCorruption(format!(
                "snapshot file {} failed to parse: {e}",
                path.display()
            ))
        })?;
        if snapshot.nodes.is_empty() {
            return Err(Error::StateCorruption(format!(
                "snapshot file {} has no root node",
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    /// Persist the snapshot atomically (write to temp, rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Resolve a slash-separated relative path to its node. "." denotes the
    /// root; trailing slashes are tolerated. Fails with `PathNotFound` when
    /// any segment is absent from the live tree.
    pub fn look_up(&self, relative_path: &str) -> Result<NodeId> {
        if relative_path.is_empty() {
            return Err(Error::PathNotFound(relative_path.to_owned()));
        }
        let trimmed = relative_path.trim_end_matches('/');
        if trimmed == "." {
            return Ok(ROOT);
        }
        let mut current = ROOT;
        for segment in trimmed.split('/') {
            match self.nodes[current.0].children.get(segment) {
                Some(&child) => current = child,
                None => return Err(Error::PathNotFound(relative_path.to_owned())),
            }
        }
        Ok(current)
    }

    /// Attach a child directory node, adopting an already-known child of
    /// the same name (the pool left behind by a previous exploration).
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(&existing) = self.nodes[parent.0].children.get(name) {
            return existing;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, Some(parent)));
        self.nodes[parent.0].children.insert(name.to_owned(), id);
        id
    }

    /// Record a file as pending in its directory node
    pub fn add_file(&mut self, node: NodeId, file_name: &str) {
        self.nodes[node.0].files.insert(file_name.to_owned());
    }

    /// Remove a handled file from its directory node
    pub fn file_completed(&mut self, node: NodeId, file_name: &str) -> Result<()> {
        if self.nodes[node.0].files.remove(file_name) {
            return Ok(());
        }
        Err(Error::UnknownFile {
            dir: self.nodes[node.0].name.clone(),
            name: file_name.to_owned(),
        })
    }

    /// Restart exploring a partially-explored directory: pending files are
    /// dropped (they will be re-discovered), known children stay and are
    /// adopted by `add_child` to preserve their subtree state.
    pub fn begin_explore(&mut self, node: NodeId) {
        self.nodes[node.0].files.clear();
    }

    /// Mark that every child of this directory has been enumerated
    pub fn mark_done_exploring(&mut self, node: NodeId) {
        self.nodes[node.0].done_exploring = true;
    }

    pub fn is_completed(&self, node: NodeId) -> bool {
        self.nodes[node.0].completed
    }

    pub fn is_done_exploring(&self, node: NodeId) -> bool {
        self.nodes[node.0].done_exploring
    }

    /// Names and ids of the node's live (non-collapsed) children
    pub fn children(&self, node: NodeId) -> Vec<(String, NodeId)> {
        self.nodes[node.0]
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    /// Files still pending in this directory
    pub fn pending_files(&self, node: NodeId) -> Vec<String> {
        self.nodes[node.0].files.iter().cloned().collect()
    }

    /// Reconstruct the node's relative path inside its repository
    pub fn node_path(&self, node: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let n = &self.nodes[id.0];
            if n.parent.is_some() {
                segments.push(n.name.clone());
            }
            current = n.parent;
        }
        if segments.is_empty() {
            return ".".to_owned();
        }
        segments.reverse();
        segments.join("/")
    }

    /// Collapse the subtree if it is finished: a node completes once it is
    /// done exploring, holds no pending files and all children completed
    /// (completed children detach themselves, so the map is empty). On
    /// completion the node releases its storage, detaches from its parent
    /// and the check continues upward.
    pub fn check_completed(&mut self, node: NodeId) {
        let mut current = Some(node);
        while let Some(id) = current {
            let n = &self.nodes[id.0];
            if n.completed
                || !n.done_exploring
                || !n.files.is_empty()
                || !n.children.is_empty()
            {
                return;
            }
            let parent = n.parent;
            let name = n.name.clone();
            {
                let n = &mut self.nodes[id.0];
                n.completed = true;
                n.children.clear();
                n.files.clear();
                n.parent = None;
            }
            if let Some(parent) = parent {
                self.nodes[parent.0].children.remove(&name);
            }
            current = parent;
        }
    }
}
