//! Global taxon index shared by the supertree and all input trees.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::bitset::{words_for, Bitset};

/// The ordered set of all taxon names seen across the input trees.
///
/// Names are sorted and deduplicated once at startup; every bitset split
/// key in the run is indexed against this ordering, and it is written into
/// checkpoints so a resumed run can verify it is looking at the same data.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TaxonSet {
    names: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl TaxonSet {
    /// Builds the global taxon set from the union of per-tree leaf names.
    ///
    /// Duplicate names within one tree are an input error; the same name
    /// appearing in several trees is the whole point.
    pub fn from_leaf_name_lists(per_tree: &[Vec<String>]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for (tree_num, leaves) in per_tree.iter().enumerate() {
            let mut seen = std::collections::HashSet::new();
            for name in leaves {
                if !seen.insert(name.as_str()) {
                    bail!("duplicate leaf name '{name}' in input tree {tree_num}");
                }
            }
            names.extend(leaves.iter().cloned());
        }
        names.sort();
        names.dedup();
        if names.len() < 4 {
            bail!(
                "need at least 4 distinct taxa across the input trees, got {}",
                names.len()
            );
        }
        Ok(Self::from_sorted_names(names))
    }

    fn from_sorted_names(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        TaxonSet { names, index }
    }

    /// Rebuilds the name lookup after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Word count for bitsets over this taxon set.
    pub fn words(&self) -> usize {
        words_for(self.names.len())
    }

    /// Mask with one bit per taxon.
    pub fn full_mask(&self) -> Bitset {
        Bitset::low_mask(self.words(), self.names.len())
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Index of a taxon name, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_sorted_and_deduped() {
        let set = TaxonSet::from_leaf_name_lists(&[
            vec!["C".into(), "A".into(), "B".into()],
            vec!["B".into(), "D".into(), "A".into(), "E".into()],
        ])
        .unwrap();
        assert_eq!(set.names(), &["A", "B", "C", "D", "E"]);
        assert_eq!(set.position("D"), Some(3));
        assert_eq!(set.position("Z"), None);
    }

    #[test]
    fn test_duplicate_within_tree_rejected() {
        let err = TaxonSet::from_leaf_name_lists(&[vec![
            "A".into(),
            "B".into(),
            "A".into(),
            "C".into(),
        ]])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate leaf name 'A'"));
    }

    #[test]
    fn test_too_few_taxa_rejected() {
        let err =
            TaxonSet::from_leaf_name_lists(&[vec!["A".into(), "B".into(), "C".into()]])
                .unwrap_err();
        assert!(err.to_string().contains("at least 4"));
    }
}
