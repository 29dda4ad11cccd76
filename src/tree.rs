//! The ordered name tree backing the domain and denial stores.
//!
//! This module provides [`NameTree`], a thin wrapper around a balanced
//! ordered map keyed by owner name.  `Name`'s `Ord` is the RFC 4034
//! canonical order, so plain map traversal yields canonical order and the
//! denial chain can be derived directly from neighbour queries.
//!
//! Structural mutation during traversal is not supported; callers collect
//! the names of interest first and then mutate (the delete-while-iterate
//! protocol of the commit path).

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Bound;

use domain::base::ToName;

use crate::error::ZoneError;
use crate::name::StoredName;

//----------- NameTree ---------------------------------------------------------

/// An ordered mapping from canonical owner name to a value.
#[derive(Clone, Debug, Default)]
pub struct NameTree<V> {
    nodes: BTreeMap<StoredName, V>,
}

impl<V> NameTree<V> {
    /// Construct an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a new entry.
    ///
    /// Duplicate keys are rejected; the tree is left unchanged and the
    /// value is not stored.
    pub fn insert(&mut self, name: StoredName, value: V) -> Result<(), ZoneError> {
        match self.nodes.entry(name) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
            btree_map::Entry::Occupied(entry) => {
                Err(ZoneError::DuplicateName(entry.key().clone()))
            }
        }
    }

    /// Remove an entry, returning its value if it was present.
    pub fn remove(&mut self, name: &StoredName) -> Option<V> {
        self.nodes.remove(name)
    }

    /// Look up an entry.
    pub fn get(&self, name: &StoredName) -> Option<&V> {
        self.nodes.get(name)
    }

    /// Look up an entry mutably.
    pub fn get_mut(&mut self, name: &StoredName) -> Option<&mut V> {
        self.nodes.get_mut(name)
    }

    /// Whether a name is present.
    pub fn contains(&self, name: &StoredName) -> bool {
        self.nodes.contains_key(name)
    }

    /// The canonically first entry.
    pub fn first(&self) -> Option<(&StoredName, &V)> {
        self.nodes.iter().next()
    }

    /// The canonically last entry.
    pub fn last(&self) -> Option<(&StoredName, &V)> {
        self.nodes.iter().next_back()
    }

    /// The canonical successor of `name`.
    ///
    /// `name` itself need not be present.
    pub fn next(&self, name: &StoredName) -> Option<(&StoredName, &V)> {
        self.nodes
            .range((Bound::Excluded(name.clone()), Bound::Unbounded))
            .next()
    }

    /// The canonical predecessor of `name`.
    pub fn previous(&self, name: &StoredName) -> Option<(&StoredName, &V)> {
        self.nodes
            .range((Bound::Unbounded, Bound::Excluded(name.clone())))
            .next_back()
    }

    /// Traverse in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&StoredName, &V)> {
        self.nodes.iter()
    }

    /// Traverse in canonical order with mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StoredName, &mut V)> {
        self.nodes.iter_mut()
    }

    /// The names in canonical order, as an owned list.
    ///
    /// This is the snapshot used wherever a traversal needs to mutate the
    /// tree structure.
    pub fn names(&self) -> Vec<StoredName> {
        self.nodes.keys().cloned().collect()
    }

    /// The entries strictly below `name`, in canonical order.
    ///
    /// Canonical order groups a name's subtree directly after the name, so
    /// this is a bounded range scan.
    pub fn descendants<'a>(
        &'a self,
        name: &'a StoredName,
    ) -> impl Iterator<Item = (&'a StoredName, &'a V)> {
        self.nodes
            .range((Bound::Excluded(name.clone()), Bound::Unbounded))
            .take_while(move |(owner, _)| owner.ends_with(name))
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::Name;
    use std::str::FromStr;

    fn name(text: &str) -> StoredName {
        Name::from_str(text).unwrap()
    }

    fn tree_of(names: &[&str]) -> NameTree<u32> {
        let mut tree = NameTree::new();
        for (index, text) in names.iter().enumerate() {
            tree.insert(name(text), index as u32).unwrap();
        }
        tree
    }

    #[test]
    fn traversal_is_canonical() {
        // Insertion order is irrelevant; the apex sorts first and subtrees
        // group together.
        let tree = tree_of(&["a.b.c.example.", "example.", "z.example.", "c.example."]);
        let names: Vec<_> = tree.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            vec![
                name("example."),
                name("c.example."),
                name("a.b.c.example."),
                name("z.example."),
            ]
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = tree_of(&["example."]);
        let err = tree.insert(name("example."), 7).unwrap_err();
        assert!(matches!(err, ZoneError::DuplicateName(_)));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&name("example.")), Some(&0));
    }

    #[test]
    fn neighbours_wrap_nothing() {
        let tree = tree_of(&["example.", "a.example.", "b.example."]);
        let (next, _) = tree.next(&name("a.example.")).unwrap();
        assert_eq!(next, &name("b.example."));
        assert!(tree.next(&name("b.example.")).is_none());
        let (prev, _) = tree.previous(&name("a.example.")).unwrap();
        assert_eq!(prev, &name("example."));
        assert!(tree.previous(&name("example.")).is_none());
    }

    #[test]
    fn descendants_cover_the_subtree_only() {
        let tree = tree_of(&[
            "example.",
            "c.example.",
            "a.b.c.example.",
            "d.example.",
        ]);
        let below: Vec<_> = tree
            .descendants(&name("c.example."))
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(below, vec![name("a.b.c.example.")]);
    }
}
