//! Parent/child hierarchy
//!
//! TigerStyle: Cycles are prevented structurally, before an edge is
//! committed.
//!
//! [`Hierarchy`] is the per-agent view (one parent, a set of children),
//! owned by the agent's shell. [`HierarchyDirectory`] is the shared index of
//! child-to-parent edges that `set_parent` consults to reject cycles; the
//! router itself has no cycle breaker beyond the hop ceiling.

use arbor_core::agent::AgentId;
use arbor_core::constants::{AGENT_CHILDREN_COUNT_MAX, HIERARCHY_DEPTH_MAX};
use arbor_core::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

// =============================================================================
// Hierarchy
// =============================================================================

/// One agent's parent reference and child set
///
/// Setting a child's parent and adding the child to the parent are separate
/// calls; both must complete before routing relies on the relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    parent: Option<AgentId>,
    children: HashSet<AgentId>,
}

impl Hierarchy {
    /// Empty hierarchy (no parent, no children)
    pub fn new() -> Self {
        Self::default()
    }

    /// Current parent
    pub fn parent(&self) -> Option<&AgentId> {
        self.parent.as_ref()
    }

    /// Replace the parent, returning the previous one
    pub fn set_parent(&mut self, parent: AgentId) -> Option<AgentId> {
        self.parent.replace(parent)
    }

    /// Remove the parent, returning the previous one
    pub fn clear_parent(&mut self) -> Option<AgentId> {
        self.parent.take()
    }

    /// Add a child; returns `false` if it was already present
    pub fn add_child(&mut self, owner: &AgentId, child: AgentId) -> Result<bool> {
        if &child == owner {
            return Err(Error::HierarchyCycle {
                child: child.to_string(),
                parent: owner.to_string(),
            });
        }
        if !self.children.contains(&child) && self.children.len() >= AGENT_CHILDREN_COUNT_MAX {
            return Err(Error::TooManyChildren {
                id: owner.to_string(),
                count: self.children.len(),
                limit: AGENT_CHILDREN_COUNT_MAX,
            });
        }
        Ok(self.children.insert(child))
    }

    /// Remove a child; returns `false` if it was not present
    pub fn remove_child(&mut self, child: &AgentId) -> bool {
        self.children.remove(child)
    }

    /// Whether `id` is a child
    pub fn has_child(&self, id: &AgentId) -> bool {
        self.children.contains(id)
    }

    /// Children, sorted for stable output
    pub fn children(&self) -> Vec<AgentId> {
        let mut children: Vec<AgentId> = self.children.iter().cloned().collect();
        children.sort();
        children
    }

    /// Number of children
    pub fn children_count(&self) -> usize {
        self.children.len()
    }
}

// =============================================================================
// HierarchyDirectory
// =============================================================================

/// Shared, thread-safe index of child-to-parent edges
#[derive(Debug, Default)]
pub struct HierarchyDirectory {
    parents: RwLock<HashMap<AgentId, AgentId>>,
}

impl HierarchyDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `child -> parent`, rejecting cycles
    ///
    /// The ancestor chain of `parent` is walked under the write lock, so two
    /// concurrent links cannot together form a cycle.
    ///
    /// # Errors
    /// - `HierarchyCycle` if `parent` is `child` or descends from it
    /// - `HierarchyTooDeep` if the chain exceeds `HIERARCHY_DEPTH_MAX`
    pub fn link(&self, child: &AgentId, parent: &AgentId) -> Result<Option<AgentId>> {
        let mut parents = self.parents.write().unwrap_or_else(|e| e.into_inner());

        let mut cursor = Some(parent);
        let mut depth = 0usize;
        while let Some(current) = cursor {
            if current == child {
                return Err(Error::HierarchyCycle {
                    child: child.to_string(),
                    parent: parent.to_string(),
                });
            }
            depth += 1;
            if depth > HIERARCHY_DEPTH_MAX {
                return Err(Error::HierarchyTooDeep {
                    id: parent.to_string(),
                    limit: HIERARCHY_DEPTH_MAX,
                });
            }
            cursor = parents.get(current);
        }

        Ok(parents.insert(child.clone(), parent.clone()))
    }

    /// Remove the edge leaving `child`
    pub fn unlink(&self, child: &AgentId) -> Option<AgentId> {
        self.parents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(child)
    }

    /// Recorded parent of `child`
    pub fn parent_of(&self, child: &AgentId) -> Option<AgentId> {
        self.parents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(child)
            .cloned()
    }

    /// Ancestors of `id`, nearest first
    pub fn ancestors(&self, id: &AgentId) -> Vec<AgentId> {
        let parents = self.parents.read().unwrap_or_else(|e| e.into_inner());
        let mut chain = Vec::new();
        let mut cursor = parents.get(id);
        while let Some(current) = cursor {
            if chain.len() >= HIERARCHY_DEPTH_MAX {
                break;
            }
            chain.push(current.clone());
            cursor = parents.get(current);
        }
        chain
    }

    /// Number of recorded edges
    pub fn len(&self) -> usize {
        self.parents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no edges are recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::new("agents", name).unwrap()
    }

    #[test]
    fn test_parent_set_and_clear() {
        let mut h = Hierarchy::new();
        assert!(h.parent().is_none());
        assert_eq!(h.set_parent(agent("p1")), None);
        assert_eq!(h.set_parent(agent("p2")), Some(agent("p1")));
        assert_eq!(h.parent(), Some(&agent("p2")));
        assert_eq!(h.clear_parent(), Some(agent("p2")));
        assert!(h.parent().is_none());
    }

    #[test]
    fn test_children_add_remove() {
        let owner = agent("p");
        let mut h = Hierarchy::new();
        assert!(h.add_child(&owner, agent("b")).unwrap());
        assert!(h.add_child(&owner, agent("a")).unwrap());
        assert!(!h.add_child(&owner, agent("a")).unwrap());

        assert_eq!(h.children(), vec![agent("a"), agent("b")]);
        assert!(h.remove_child(&agent("a")));
        assert!(!h.remove_child(&agent("a")));
        assert_eq!(h.children_count(), 1);
    }

    #[test]
    fn test_self_child_rejected() {
        let owner = agent("p");
        let mut h = Hierarchy::new();
        assert!(matches!(
            h.add_child(&owner, owner.clone()),
            Err(Error::HierarchyCycle { .. })
        ));
    }

    #[test]
    fn test_directory_rejects_self_parent() {
        let dir = HierarchyDirectory::new();
        let result = dir.link(&agent("a"), &agent("a"));
        assert!(matches!(result, Err(Error::HierarchyCycle { .. })));
    }

    #[test]
    fn test_directory_rejects_cycle() {
        let dir = HierarchyDirectory::new();
        // root <- mid <- leaf
        dir.link(&agent("mid"), &agent("root")).unwrap();
        dir.link(&agent("leaf"), &agent("mid")).unwrap();

        let result = dir.link(&agent("root"), &agent("leaf"));
        assert!(matches!(result, Err(Error::HierarchyCycle { .. })));
        // Nothing committed
        assert_eq!(dir.parent_of(&agent("root")), None);
        assert_eq!(dir.ancestors(&agent("leaf")), vec![agent("mid"), agent("root")]);
    }

    #[test]
    fn test_directory_relink_returns_previous() {
        let dir = HierarchyDirectory::new();
        assert_eq!(dir.link(&agent("c"), &agent("p1")).unwrap(), None);
        assert_eq!(dir.link(&agent("c"), &agent("p2")).unwrap(), Some(agent("p1")));
        assert_eq!(dir.unlink(&agent("c")), Some(agent("p2")));
        assert!(dir.is_empty());
    }
}
