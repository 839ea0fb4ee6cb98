// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The ordered name tree underlying the database.
//!
//! Nodes live in a [`Slab`] and are addressed by [`NodeId`]; an
//! ordered index maps canonical names to ids. The tree supports the
//! operations the rest of the server is built on: exact search,
//! predecessor search, closest-encloser search, and ordered iteration.
//!
//! Every node also carries a dense `number`, assigned in insertion
//! order. Deletion keeps the numbering dense by first swapping the
//! doomed node to the tail of an insertion-order list threaded through
//! the nodes and then popping it.

use std::collections::BTreeMap;
use std::ops::Bound;

use slab::Slab;

use crate::name::Dname;
use crate::rr::Type;

use super::rrstore::Rrset;
use super::ZoneId;

/// Identifies a node in a [`NameTree`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeId(u32);

impl NodeId {
    pub(super) fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Precomputed NSEC3 references of a node (see the `nsec3` module).
#[derive(Clone, Copy, Debug, Default)]
pub struct Nsec3Refs {
    /// The NSEC3 owner covering this name's hash.
    pub cover: Option<NodeId>,

    /// The NSEC3 owner covering the hash of `*.<this name>`.
    pub wcard_child_cover: Option<NodeId>,

    /// The NSEC3 owner whose name equals this name's hash, if any.
    pub exact: Option<NodeId>,

    /// Like `cover`, but hashed under the parent zone's parameters
    /// (serves DS queries at delegations).
    pub ds_parent_cover: Option<NodeId>,

    /// Like `exact`, but under the parent zone's parameters.
    pub ds_parent_exact: Option<NodeId>,
}

/// A node in the name tree.
#[derive(Debug)]
pub struct Node {
    pub(super) name: Dname,
    pub(super) parent: Option<NodeId>,
    pub(super) wildcard_child_closest_match: NodeId,
    pub(super) rrsets: Vec<Rrset>,
    pub(super) number: u32,
    numlist_prev: Option<NodeId>,
    numlist_next: Option<NodeId>,
    pub(super) usage: u32,
    pub(super) is_existing: bool,
    pub(super) is_apex: bool,
    pub(super) zone: Option<ZoneId>,
    pub(super) nsec3: Nsec3Refs,
}

impl Node {
    pub fn name(&self) -> &Dname {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_existing(&self) -> bool {
        self.is_existing
    }

    pub fn is_apex(&self) -> bool {
        self.is_apex
    }

    pub fn nsec3(&self) -> &Nsec3Refs {
        &self.nsec3
    }

    pub fn rrsets(&self) -> &[Rrset] {
        &self.rrsets
    }

    /// Scans the node's RRset list for the set of the given zone and
    /// type.
    pub fn find_rrset(&self, zone: ZoneId, rr_type: Type) -> Option<&Rrset> {
        self.rrsets
            .iter()
            .find(|rrset| rrset.zone == zone && rrset.rr_type == rr_type)
    }
}

/// The result of [`NameTree::search`].
#[derive(Clone, Copy, Debug)]
pub struct SearchResult {
    /// Whether the searched-for name exists in the tree.
    pub exact: bool,

    /// On an exact match, the matching node; otherwise the canonical
    /// predecessor of the searched-for name.
    pub closest_match: NodeId,

    /// The deepest existing ancestor of the searched-for name (the
    /// node itself on an exact match).
    pub closest_encloser: NodeId,
}

/// The ordered name tree. The root node always exists.
#[derive(Debug)]
pub struct NameTree {
    nodes: Slab<Node>,
    by_name: BTreeMap<Dname, NodeId>,
    root: NodeId,
    numlist_last: NodeId,
}

impl NameTree {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let root_index = nodes.insert(Node {
            name: Dname::root().clone(),
            parent: None,
            wildcard_child_closest_match: NodeId(0),
            rrsets: Vec::new(),
            number: 1,
            numlist_prev: None,
            numlist_next: None,
            usage: 1, // the root is never deleted
            is_existing: false,
            is_apex: false,
            zone: None,
            nsec3: Nsec3Refs::default(),
        });
        let root = NodeId::from_index(root_index);
        nodes[root_index].wildcard_child_closest_match = root;
        let mut by_name = BTreeMap::new();
        by_name.insert(Dname::root().clone(), root);
        Self {
            nodes,
            by_name,
            root,
            numlist_last: root,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The number of nodes in the tree (at least one, for the root).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Whether `id` still refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id.index())
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Finds the node with the given name, if it exists.
    pub fn find(&self, name: &Dname) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Replaces the node's precomputed NSEC3 references (see the
    /// `nsec3` module).
    pub fn set_nsec3(&mut self, id: NodeId, refs: Nsec3Refs) {
        self.node_mut(id).nsec3 = refs;
    }

    /// Searches for `name`, producing the exact match or its canonical
    /// predecessor, plus the closest encloser. The closest encloser is
    /// found by walking up from the predecessor until its depth does
    /// not exceed the number of labels it shares with `name`.
    pub fn search(&self, name: &Dname) -> SearchResult {
        let closest_match = self
            .by_name
            .range::<Dname, _>((Bound::Unbounded, Bound::Included(name)))
            .next_back()
            .map(|(_, &id)| id)
            .expect("the root node is always present");
        let exact = self.node(closest_match).name == *name;

        let mut closest_encloser = closest_match;
        if !exact {
            let match_count = self.node(closest_match).name.label_match_count(name);
            while self.node(closest_encloser).name.label_count() > match_count {
                closest_encloser = self.node(closest_encloser).parent.expect(
                    "walked above the root looking for a closest encloser",
                );
            }
        }

        SearchResult {
            exact,
            closest_match,
            closest_encloser,
        }
    }

    /// Returns the node with the given name, inserting it (and any
    /// missing ancestors, in one pass) if necessary.
    pub fn insert(&mut self, name: &Dname) -> NodeId {
        let result = self.search(name);
        if result.exact {
            return result.closest_encloser;
        }

        let mut encloser = result.closest_encloser;
        let encloser_labels = self.node(encloser).name.label_count();
        for depth in encloser_labels + 1..=name.label_count() {
            encloser = self.insert_child(encloser, name.suffix(depth));
        }
        encloser
    }

    /// Creates a node for `name` as a child of `parent`, updating the
    /// parent's wildcard closest match and the number list.
    fn insert_child(&mut self, parent: NodeId, name: Dname) -> NodeId {
        let number = self.node(self.numlist_last).number + 1;
        let index = self.nodes.insert(Node {
            name,
            parent: Some(parent),
            wildcard_child_closest_match: NodeId(0),
            rrsets: Vec::new(),
            number,
            numlist_prev: Some(self.numlist_last),
            numlist_next: None,
            usage: 0,
            is_existing: false,
            is_apex: false,
            zone: None,
            nsec3: Nsec3Refs::default(),
        });
        let id = NodeId::from_index(index);
        self.nodes[index].wildcard_child_closest_match = id;
        self.node_mut(self.numlist_last).numlist_next = Some(id);
        self.numlist_last = id;
        self.by_name.insert(self.node(id).name.clone(), id);

        // If the new name sorts at or before the wildcard label `*` at
        // this level, and after the parent's current closest match, it
        // becomes the parent's new wildcard closest match.
        let leftmost_sorts_before_star = {
            let name = &self.node(id).name;
            crate::util::cmp_caseless(name.label_from_root(name.label_count() - 1), b"*")
                != std::cmp::Ordering::Greater
        };
        if leftmost_sorts_before_star {
            let current = self.node(parent).wildcard_child_closest_match;
            if self.node(id).name > self.node(current).name {
                self.node_mut(parent).wildcard_child_closest_match = id;
            }
        }

        id
    }

    /// The canonical predecessor of `id`, if any.
    pub fn previous(&self, id: NodeId) -> Option<NodeId> {
        let name = &self.node(id).name;
        self.by_name
            .range::<Dname, _>((Bound::Unbounded, Bound::Excluded(name)))
            .next_back()
            .map(|(_, &id)| id)
    }

    /// The canonical successor of `id`, if any.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        let name = &self.node(id).name;
        self.by_name
            .range::<Dname, _>((Bound::Excluded(name), Bound::Unbounded))
            .next()
            .map(|(_, &id)| id)
    }

    /// Iterates over all nodes in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_name.values().copied()
    }

    /// Iterates over the subtree rooted at `top` (inclusive) in
    /// canonical order. In canonical ordering a name's subtree is a
    /// contiguous run starting at the name itself.
    pub fn iter_subtree<'a>(&'a self, top: NodeId) -> impl Iterator<Item = NodeId> + 'a {
        let top_name = self.node(top).name.clone();
        self.by_name
            .range((Bound::Included(top_name.clone()), Bound::Unbounded))
            .map(|(_, &id)| id)
            .take_while(move |&id| self.node(id).name.eq_or_subdomain_of(&top_name))
    }

    /// Returns the `*`-labelled child of `id`, if one exists.
    pub fn wildcard_child(&self, id: NodeId) -> Option<NodeId> {
        let candidate = self.node(id).wildcard_child_closest_match;
        let name = &self.node(candidate).name;
        if candidate != id && name.is_wildcard() && self.node(candidate).parent == Some(id) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Whether `id` may be removed: it owns no RRsets, nothing
    /// references it, and it has no descendants (its canonical
    /// successor is not a proper subdomain).
    pub fn can_be_deleted(&self, id: NodeId) -> bool {
        let node = self.node(id);
        if !node.rrsets.is_empty() || node.usage > 0 {
            return false;
        }
        match self.next(id) {
            Some(next) => !self.node(next).name.is_subdomain_of(&node.name),
            None => true,
        }
    }

    /// Deletes `id` if it is deletable, then cascades upward deleting
    /// any ancestors that became deletable in turn.
    pub fn delete(&mut self, mut id: NodeId) {
        while self.can_be_deleted(id) {
            let parent = self
                .node(id)
                .parent
                .expect("the root node is never deletable");
            self.remove_node(id);
            id = parent;
        }
    }

    /// Unconditionally removes a single (deletable) node.
    fn remove_node(&mut self, id: NodeId) {
        // Keep the numbering dense: swap the node to the tail of the
        // insertion-order list, then pop the tail.
        self.numlist_swap_to_last(id);
        let prev = self.node(id).numlist_prev;
        if let Some(prev) = prev {
            self.node_mut(prev).numlist_next = None;
            self.numlist_last = prev;
        }

        // The node may be its parent's wildcard closest match; if so,
        // the canonical predecessor takes over that role.
        let parent = self.node(id).parent.unwrap();
        if self.node(parent).wildcard_child_closest_match == id {
            let previous = self
                .previous(id)
                .expect("a non-root node always has a predecessor");
            self.node_mut(parent).wildcard_child_closest_match = previous;
        }

        let name = self.node(id).name.clone();
        self.by_name.remove(&name);
        self.nodes.remove(id.index());
    }

    /// Exchanges `id` with the current tail of the insertion-order
    /// list, also exchanging their numbers.
    fn numlist_swap_to_last(&mut self, id: NodeId) {
        let last = self.numlist_last;
        if id == last {
            return;
        }

        let id_number = self.node(id).number;
        let last_number = self.node(last).number;
        self.node_mut(id).number = last_number;
        self.node_mut(last).number = id_number;

        let id_prev = self.node(id).numlist_prev;
        let id_next = self.node(id).numlist_next;
        let last_prev = self.node(last).numlist_prev;

        if last_prev == Some(id) {
            // Adjacent: ... -> id -> last
            self.node_mut(last).numlist_prev = id_prev;
            self.node_mut(last).numlist_next = Some(id);
            self.node_mut(id).numlist_prev = Some(last);
            self.node_mut(id).numlist_next = None;
            if let Some(prev) = id_prev {
                self.node_mut(prev).numlist_next = Some(last);
            }
        } else {
            self.node_mut(last).numlist_prev = id_prev;
            self.node_mut(last).numlist_next = id_next;
            self.node_mut(id).numlist_prev = last_prev;
            self.node_mut(id).numlist_next = None;
            if let Some(prev) = id_prev {
                self.node_mut(prev).numlist_next = Some(last);
            }
            if let Some(next) = id_next {
                self.node_mut(next).numlist_prev = Some(last);
            }
            if let Some(prev) = last_prev {
                self.node_mut(prev).numlist_next = Some(id);
            }
        }
        self.numlist_last = id;
    }
}

impl Default for NameTree {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    #[test]
    fn insert_creates_missing_ancestors() {
        let mut tree = NameTree::new();
        let deep = tree.insert(&name("a.b.c.example."));
        assert_eq!(tree.len(), 5); // root, example., c.…, b.c.…, a.b.c.…
        let parent = tree.node(deep).parent().unwrap();
        assert_eq!(tree.node(parent).name(), &name("b.c.example."));
        // Re-inserting finds the existing node.
        assert_eq!(tree.insert(&name("a.b.c.example.")), deep);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn search_contract_holds() {
        let mut tree = NameTree::new();
        tree.insert(&name("example."));
        tree.insert(&name("alpha.example."));
        tree.insert(&name("zulu.example."));

        let result = tree.search(&name("mike.example."));
        assert!(!result.exact);
        // The predecessor in canonical order...
        assert_eq!(tree.node(result.closest_match).name(), &name("alpha.example."));
        // ... and the deepest existing ancestor.
        assert_eq!(tree.node(result.closest_encloser).name(), &name("example."));

        let exact = tree.search(&name("zulu.example."));
        assert!(exact.exact);
        assert_eq!(exact.closest_match, exact.closest_encloser);
    }

    #[test]
    fn closest_encloser_descends_through_existing_interior_names() {
        let mut tree = NameTree::new();
        tree.insert(&name("example."));
        tree.insert(&name("a.b.example."));
        let result = tree.search(&name("z.b.example."));
        assert!(!result.exact);
        assert_eq!(tree.node(result.closest_encloser).name(), &name("b.example."));
    }

    #[test]
    fn wildcard_closest_match_is_maintained() {
        let mut tree = NameTree::new();
        let apex = tree.insert(&name("example."));
        // No children: the closest match is the node itself.
        assert_eq!(tree.node(apex).wildcard_child_closest_match, apex);

        // "!x" sorts before "*"; it becomes the closest match.
        let bang = tree.insert(&name("\\033x.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, bang);

        // "alpha" sorts after "*": no change.
        tree.insert(&name("alpha.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, bang);

        // The wildcard itself is the greatest name <= "*".
        let star = tree.insert(&name("*.example."));
        assert_eq!(tree.node(apex).wildcard_child_closest_match, star);
        assert_eq!(tree.wildcard_child(apex), Some(star));
    }

    #[test]
    fn wildcard_child_requires_a_direct_star_child() {
        let mut tree = NameTree::new();
        let apex = tree.insert(&name("example."));
        tree.insert(&name("*.sub.example."));
        // The star node exists but is not a direct child of the apex.
        assert_eq!(tree.wildcard_child(apex), None);
    }

    #[test]
    fn delete_cascades_and_respects_descendants() {
        let mut tree = NameTree::new();
        tree.insert(&name("example."));
        let deep = tree.insert(&name("a.b.example."));
        let mid = tree.node(deep).parent().unwrap();

        // The interior node has a descendant and must survive.
        tree.delete(mid);
        assert!(tree.find(&name("b.example.")).is_some());

        // Deleting the leaf cascades up through the now-empty interior
        // node, but stops at example. only because it too is empty...
        tree.delete(deep);
        assert!(tree.find(&name("a.b.example.")).is_none());
        assert!(tree.find(&name("b.example.")).is_none());
        assert!(tree.find(&name("example.")).is_none());
        assert_eq!(tree.len(), 1); // the root is never deleted
    }

    #[test]
    fn numbers_stay_dense_across_deletes() {
        let mut tree = NameTree::new();
        tree.insert(&name("example."));
        let a = tree.insert(&name("a.example."));
        tree.insert(&name("b.example."));
        tree.insert(&name("c.example."));
        assert_eq!(tree.node(a).number(), 3);

        tree.delete(a);
        let mut numbers: Vec<u32> = tree.iter().map(|id| tree.node(id).number()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }
}
