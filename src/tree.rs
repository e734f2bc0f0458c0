//! Mutable multifurcating supertree over the global taxon set.
//!
//! The tree is stored as an arena of nodes with parent / first-child /
//! next-sibling links, so topology edits are pointer splices and never
//! reallocate. The root is an internal node; by the unrooted convention it
//! keeps at least 3 children, and a tree whose only internal node is the
//! root is a star tree. Node slots freed by edge deletions are reused by
//! later edge additions.
//!
//! Topology edits mark the tree dirty. [`Tree::refresh`] recomputes the
//! traversal orders and the per-node leaf bitsets; asking a dirty tree for
//! splits is a programming error and panics in debug builds.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bitset::{words_for, Bitset};

fn default_true() -> bool {
    true
}

/// One arena slot. A slot is vacant when it has no parent and no children
/// and is not the root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub parent: Option<usize>,
    pub first_child: Option<usize>,
    pub next_sibling: Option<usize>,
    /// Global taxon index for leaves, `None` for internal nodes.
    pub taxon: Option<usize>,
}

impl Node {
    fn vacant() -> Self {
        Node {
            parent: None,
            first_child: None,
            next_sibling: None,
            taxon: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.taxon.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
    root: usize,
    n_tax: usize,
    #[serde(skip, default = "default_true")]
    dirty: bool,
    /// Below-sets, one per node, refreshed lazily. Not canonicalized;
    /// callers canonicalize against whatever mask they are comparing under.
    #[serde(skip)]
    below: Vec<Bitset>,
    #[serde(skip)]
    postorder: Vec<usize>,
    #[serde(skip)]
    preorder: Vec<usize>,
    #[serde(skip)]
    n_internal: usize,
}

impl Tree {
    /// A star tree: every leaf hangs off the root.
    pub fn star(n_tax: usize) -> Tree {
        assert!(n_tax >= 4);
        // 2n-2 slots is enough for any resolution of n taxa.
        let mut nodes = vec![Node::vacant(); 2 * n_tax - 2];
        let root = n_tax;
        for i in 0..n_tax {
            nodes[i].taxon = Some(i);
            nodes[i].parent = Some(root);
            nodes[i].next_sibling = if i + 1 < n_tax { Some(i + 1) } else { None };
        }
        nodes[root].first_child = Some(0);
        let mut t = Tree {
            nodes,
            root,
            n_tax,
            dirty: true,
            below: Vec::new(),
            postorder: Vec::new(),
            preorder: Vec::new(),
            n_internal: 0,
        };
        t.refresh();
        t
    }

    /// A random fully resolved tree, built by sequential leaf attachment.
    pub fn random_resolved<R: Rng>(n_tax: usize, rng: &mut R) -> Tree {
        assert!(n_tax >= 4);
        let mut nodes = vec![Node::vacant(); 2 * n_tax - 2];
        let root = n_tax;
        // Start from the 3-leaf star, which is already resolved.
        for i in 0..3 {
            nodes[i].taxon = Some(i);
            nodes[i].parent = Some(root);
            nodes[i].next_sibling = if i + 1 < 3 { Some(i + 1) } else { None };
        }
        for (i, node) in nodes.iter_mut().enumerate().take(n_tax).skip(3) {
            node.taxon = Some(i);
        }
        nodes[root].first_child = Some(0);
        let mut t = Tree {
            nodes,
            root,
            n_tax,
            dirty: true,
            below: Vec::new(),
            postorder: Vec::new(),
            preorder: Vec::new(),
            n_internal: 0,
        };
        let mut next_free = n_tax + 1;
        for leaf in 3..n_tax {
            // Pick any attached non-root node and break its parent edge.
            let mut attached: Vec<usize> = Vec::new();
            for (i, n) in t.nodes.iter().enumerate() {
                if i != root && n.parent.is_some() {
                    attached.push(i);
                }
            }
            let &x = attached.choose(rng).unwrap();
            let w = next_free;
            next_free += 1;
            let p = t.nodes[x].parent.unwrap();
            t.replace_child(p, x, w);
            t.nodes[w].parent = Some(p);
            t.nodes[w].taxon = None;
            t.nodes[w].first_child = Some(x);
            t.nodes[x].parent = Some(w);
            t.nodes[x].next_sibling = Some(leaf);
            t.nodes[leaf].parent = Some(w);
            t.nodes[leaf].next_sibling = None;
        }
        t.refresh();
        t
    }

    pub fn n_tax(&self) -> usize {
        self.n_tax
    }

    pub fn words(&self) -> usize {
        words_for(self.n_tax)
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Internal node count, root included. A star tree has 1; a fully
    /// resolved tree has `n_tax - 2`.
    pub fn n_internal(&self) -> usize {
        assert!(!self.dirty, "tree splits are stale, call refresh first");
        self.n_internal
    }

    pub fn is_star(&self) -> bool {
        self.n_internal() == 1
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.n_internal() == self.n_tax - 2
    }

    pub fn children(&self, i: usize) -> ChildIter<'_> {
        ChildIter {
            tree: self,
            next: self.nodes[i].first_child,
        }
    }

    pub fn n_children(&self, i: usize) -> usize {
        self.children(i).count()
    }

    pub fn postorder(&self) -> &[usize] {
        assert!(!self.dirty, "tree splits are stale, call refresh first");
        &self.postorder
    }

    pub fn preorder(&self) -> &[usize] {
        assert!(!self.dirty, "tree splits are stale, call refresh first");
        &self.preorder
    }

    /// Internal nodes other than the root, in postorder.
    pub fn internals_no_root(&self) -> Vec<usize> {
        assert!(!self.dirty, "tree splits are stale, call refresh first");
        self.postorder
            .iter()
            .copied()
            .filter(|&i| i != self.root && !self.nodes[i].is_leaf())
            .collect()
    }

    /// The set of taxa below node `i`, from the last refresh.
    pub fn below(&self, i: usize) -> &Bitset {
        assert!(!self.dirty, "tree splits are stale, call refresh first");
        &self.below[i]
    }

    /// Recomputes traversal orders, below-sets and the internal node count.
    pub fn refresh(&mut self) {
        let words = self.words();
        self.preorder.clear();
        self.postorder.clear();
        let mut stack = vec![self.root];
        while let Some(i) = stack.pop() {
            self.preorder.push(i);
            let mut c = self.nodes[i].first_child;
            while let Some(ci) = c {
                stack.push(ci);
                c = self.nodes[ci].next_sibling;
            }
        }
        self.postorder = self.preorder.iter().rev().copied().collect();

        self.below = vec![Bitset::zeros(words); self.nodes.len()];
        for &i in &self.postorder.clone() {
            if let Some(tx) = self.nodes[i].taxon {
                self.below[i].set(tx);
            } else {
                let mut acc = Bitset::zeros(words);
                let mut c = self.nodes[i].first_child;
                while let Some(ci) = c {
                    acc.or_assign(&self.below[ci]);
                    c = self.nodes[ci].next_sibling;
                }
                self.below[i] = acc;
            }
        }
        self.n_internal = self
            .preorder
            .iter()
            .filter(|&&i| !self.nodes[i].is_leaf())
            .count();
        self.dirty = false;
    }

    /// Canonical split keys of the internal edges, one per internal
    /// non-root node, canonicalized on taxon 0 over the full taxon set.
    pub fn split_set(&self) -> HashSet<Bitset> {
        let mask = Bitset::low_mask(self.words(), self.n_tax);
        self.internals_no_root()
            .into_iter()
            .map(|i| {
                let mut key = self.below[i].clone();
                key.canonicalize(0, &mask);
                key
            })
            .collect()
    }

    /// Raw below-sets of the internal non-root nodes.
    pub fn internal_below_sets(&self) -> Vec<Bitset> {
        self.internals_no_root()
            .into_iter()
            .map(|i| self.below[i].clone())
            .collect()
    }

    fn alloc_slot(&mut self) -> usize {
        for (i, n) in self.nodes.iter().enumerate() {
            if i != self.root
                && n.parent.is_none()
                && n.first_child.is_none()
                && n.taxon.is_none()
            {
                return i;
            }
        }
        unreachable!("arena sized for 2n-2 nodes can always resolve further");
    }

    fn replace_child(&mut self, parent: usize, old: usize, new: usize) {
        if self.nodes[parent].first_child == Some(old) {
            self.nodes[parent].first_child = Some(new);
        } else {
            let mut c = self.nodes[parent].first_child.unwrap();
            while self.nodes[c].next_sibling != Some(old) {
                c = self.nodes[c].next_sibling.unwrap();
            }
            self.nodes[c].next_sibling = Some(new);
        }
        self.nodes[new].next_sibling = self.nodes[old].next_sibling;
        self.nodes[old].next_sibling = None;
    }

    /// Unlinks `child` from `parent`'s child list. The child keeps its own
    /// subtree; its parent link is cleared.
    pub fn detach_child(&mut self, parent: usize, child: usize) {
        if self.nodes[parent].first_child == Some(child) {
            self.nodes[parent].first_child = self.nodes[child].next_sibling;
        } else {
            let mut c = self.nodes[parent].first_child.unwrap();
            while self.nodes[c].next_sibling != Some(child) {
                c = self.nodes[c].next_sibling.unwrap();
            }
            self.nodes[c].next_sibling = self.nodes[child].next_sibling;
        }
        self.nodes[child].next_sibling = None;
        self.nodes[child].parent = None;
        self.dirty = true;
    }

    /// Links `child` at the front of `parent`'s child list.
    pub fn attach_child(&mut self, parent: usize, child: usize) {
        self.nodes[child].next_sibling = self.nodes[parent].first_child;
        self.nodes[parent].first_child = Some(child);
        self.nodes[child].parent = Some(parent);
        self.dirty = true;
    }

    /// Resolves part of a polytomy: moves `group` (children of `parent`)
    /// under a new internal node, itself a child of `parent`. Returns the
    /// new node's index.
    pub fn add_edge(&mut self, parent: usize, group: &[usize]) -> usize {
        debug_assert!(group.len() >= 2);
        let w = self.alloc_slot();
        for &g in group {
            self.detach_child(parent, g);
        }
        self.attach_child(parent, w);
        for &g in group {
            self.attach_child(w, g);
        }
        self.dirty = true;
        w
    }

    /// Breaks the edge above `v` with a new internal node and hangs the
    /// detached subtree `x` from it. Returns the new node's index.
    pub fn insert_on_edge(&mut self, v: usize, x: usize) -> usize {
        debug_assert!(self.nodes[x].parent.is_none());
        let pv = self.nodes[v].parent.unwrap();
        let w = self.alloc_slot();
        self.detach_child(pv, v);
        self.attach_child(pv, w);
        self.attach_child(w, v);
        self.attach_child(w, x);
        w
    }

    /// Collapses the edge above internal node `i`: its children move up to
    /// its parent and the slot is vacated.
    pub fn delete_edge(&mut self, i: usize) {
        debug_assert!(!self.nodes[i].is_leaf() && i != self.root);
        let parent = self.nodes[i].parent.unwrap();
        let kids: Vec<usize> = self.children(i).collect();
        for k in kids {
            self.detach_child(i, k);
            self.attach_child(parent, k);
        }
        self.detach_child(parent, i);
        self.nodes[i] = Node::vacant();
        self.dirty = true;
    }

    /// Whether `node` lies in the subtree rooted at `top` (inclusive).
    pub fn in_subtree(&self, node: usize, top: usize) -> bool {
        let mut cur = Some(node);
        while let Some(i) = cur {
            if i == top {
                return true;
            }
            cur = self.nodes[i].parent;
        }
        false
    }

    /// Nodes currently linked into the tree, root included.
    pub fn in_use(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| {
                i == self.root
                    || self.nodes[i].parent.is_some()
            })
            .collect()
    }

    /// Writes the topology as a Newick string, leaves rendered through
    /// `label`, e.g. a translation-table number or a taxon name.
    pub fn to_newick<F: Fn(usize) -> String>(&self, label: &F) -> String {
        let mut out = String::new();
        self.write_newick_node(self.root, label, &mut out);
        out.push(';');
        out
    }

    fn write_newick_node<F: Fn(usize) -> String>(&self, i: usize, label: &F, out: &mut String) {
        if let Some(tx) = self.nodes[i].taxon {
            out.push_str(&label(tx));
        } else {
            out.push('(');
            let mut first = true;
            let mut c = self.nodes[i].first_child;
            while let Some(ci) = c {
                if !first {
                    out.push(',');
                }
                first = false;
                self.write_newick_node(ci, label, out);
                c = self.nodes[ci].next_sibling;
            }
            out.push(')');
        }
    }
}

pub struct ChildIter<'a> {
    tree: &'a Tree,
    next: Option<usize>,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next?;
        self.next = self.tree.node(cur).next_sibling;
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_star_tree_shape() {
        let t = Tree::star(5);
        assert_eq!(t.n_internal(), 1);
        assert!(t.is_star());
        assert!(!t.is_fully_resolved());
        assert_eq!(t.n_children(t.root()), 5);
        assert!(t.split_set().is_empty());
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn test_stale_split_queries_panic() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut t = Tree::random_resolved(5, &mut rng);
        let v = t.internals_no_root()[0];
        let c = t.children(v).next().unwrap();
        t.detach_child(v, c);
        t.attach_child(t.root(), c);
        t.split_set();
    }

    #[test]
    fn test_random_resolved_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 4..10 {
            let t = Tree::random_resolved(n, &mut rng);
            assert_eq!(t.n_internal(), n - 2);
            assert!(t.is_fully_resolved());
            assert_eq!(t.n_children(t.root()), 3);
            assert_eq!(t.split_set().len(), n - 3);
            // Every internal non-root node is binary.
            for i in t.internals_no_root() {
                assert_eq!(t.n_children(i), 2);
            }
            // All taxa accounted for.
            assert_eq!(t.below(t.root()).count_ones(), n);
        }
    }

    #[test]
    fn test_add_then_delete_edge_restores_splits() {
        let mut t = Tree::star(6);
        let before = t.split_set();
        let kids: Vec<usize> = t.children(t.root()).take(3).collect();
        let w = t.add_edge(t.root(), &kids);
        t.refresh();
        assert_eq!(t.n_internal(), 2);
        assert_eq!(t.split_set().len(), 1);
        t.delete_edge(w);
        t.refresh();
        assert_eq!(t.n_internal(), 1);
        assert_eq!(t.split_set(), before);
    }

    #[test]
    fn test_delete_edge_vacates_slot_for_reuse() {
        let mut t = Tree::star(6);
        let kids: Vec<usize> = t.children(t.root()).take(2).collect();
        let w = t.add_edge(t.root(), &kids);
        t.refresh();
        t.delete_edge(w);
        t.refresh();
        let kids2: Vec<usize> = t.children(t.root()).take(2).collect();
        let w2 = t.add_edge(t.root(), &kids2);
        assert_eq!(w, w2);
    }

    #[test]
    fn test_split_set_is_side_invariant() {
        // Same split reached from either side of the root trifurcation.
        let mut a = Tree::star(4);
        let kids: Vec<usize> = a
            .children(a.root())
            .filter(|&i| matches!(a.node(i).taxon, Some(0) | Some(1)))
            .collect();
        a.add_edge(a.root(), &kids);
        a.refresh();

        let mut b = Tree::star(4);
        let kids: Vec<usize> = b
            .children(b.root())
            .filter(|&i| matches!(b.node(i).taxon, Some(2) | Some(3)))
            .collect();
        b.add_edge(b.root(), &kids);
        b.refresh();

        assert_eq!(a.split_set(), b.split_set());
    }

    #[test]
    fn test_newick_round_shape() {
        let mut t = Tree::star(4);
        let kids: Vec<usize> = t
            .children(t.root())
            .filter(|&i| matches!(t.node(i).taxon, Some(2) | Some(3)))
            .collect();
        t.add_edge(t.root(), &kids);
        t.refresh();
        let s = t.to_newick(&|tx| (tx + 1).to_string());
        assert!(s.starts_with('('));
        assert!(s.ends_with(';'));
        assert!(s.contains("(4,3)") || s.contains("(3,4)"));
    }

    #[test]
    fn test_serde_round_trip_refreshes() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = Tree::random_resolved(7, &mut rng);
        let json = serde_json::to_string(&t).unwrap();
        let mut back: Tree = serde_json::from_str(&json).unwrap();
        assert!(back.is_dirty());
        back.refresh();
        assert_eq!(back.split_set(), t.split_set());
        assert_eq!(back.n_internal(), t.n_internal());
    }
}
