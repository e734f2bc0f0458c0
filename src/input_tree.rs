//! Immutable per-input-tree caches.
//!
//! Each input tree is read once, indexed against the global taxon set, and
//! reduced to the structures the likelihood models consume: a taxon mask,
//! canonical split sets (both at global width and re-indexed to the tree's
//! own taxa), optional split supports, and a quartet set. Node ids assigned
//! by the parser are never used for identity; taxon names are.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bitset::Bitset;
use crate::taxa::TaxonSet;

/// How internal node labels on the input trees are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupportMode {
    /// Labels are ignored.
    None,
    /// Labels are fractions in [0, 1].
    Fractional,
    /// Labels are percentages in [0, 100], scaled down by 100.
    Percent,
}

/// One input tree, digested for scoring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputTree {
    /// Number of taxa in this tree.
    pub n_tax: usize,
    /// Global-width mask of the taxa present.
    pub mask: Bitset,
    /// Lowest global taxon index present; the reference bit for masked keys.
    pub first_tax: usize,
    /// Global indices of the taxa present, ascending. `positions[j]` is the
    /// global index of local taxon `j`.
    pub positions: Vec<usize>,
    /// Informative splits at global width, masked and canonicalized so the
    /// `first_tax` bit is set.
    pub masked_splits: HashSet<Bitset>,
    /// The same splits re-indexed to local numbering, canonicalized on
    /// local taxon 0. Used by the reference RF path.
    pub local_splits: HashSet<Bitset>,
    /// Per-edge support values keyed by the masked global split.
    pub supports: Vec<(Bitset, Option<f64>)>,
    /// Quartets induced by the splits, as normalized global taxon indices.
    /// Empty unless requested at construction.
    pub quartets: HashSet<[usize; 4]>,
    /// Whether every internal node is binary (root may be a trifurcation).
    pub fully_bifurcating: bool,
}

impl InputTree {
    /// Digests a parsed tree against the global taxon set.
    ///
    /// Quartet enumeration is O(splits * pairs^2) and only the quartet
    /// model needs it, so it is opt-in.
    pub fn from_phylo(
        tree: &PhyloTree,
        taxa: &TaxonSet,
        support_mode: SupportMode,
        want_quartets: bool,
    ) -> Result<InputTree> {
        let words = taxa.words();
        let root_id = tree
            .get_root()
            .map_err(|e| anyhow!("input tree has no root: {e}"))?;

        // Map parser leaf ids to global taxon indices by name.
        let mut leaf_to_taxon: HashMap<usize, usize> = HashMap::new();
        let mut mask = Bitset::zeros(words);
        for leaf_id in tree.get_leaves() {
            let node = tree
                .get(&leaf_id)
                .map_err(|e| anyhow!("bad leaf id {leaf_id}: {e}"))?;
            let name = node
                .name
                .clone()
                .ok_or_else(|| anyhow!("input tree has an unnamed leaf"))?;
            let global = taxa
                .position(&name)
                .ok_or_else(|| anyhow!("leaf '{name}' is not in the taxon set"))?;
            leaf_to_taxon.insert(leaf_id, global);
            mask.set(global);
        }
        let n_tax = mask.count_ones();
        if n_tax < 4 {
            bail!("input tree has only {n_tax} taxa, need at least 4");
        }
        let positions: Vec<usize> = mask.iter_ones().collect();
        let first_tax = positions[0];

        // Postorder below-sets at global width.
        let mut below: HashMap<usize, Bitset> = HashMap::new();
        compute_below(root_id, tree, &leaf_to_taxon, words, &mut below)?;

        let mut masked_splits = HashSet::new();
        let mut supports = Vec::new();
        let mut fully_bifurcating = true;
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            let node = tree.get(&id).map_err(|e| anyhow!("bad node id {id}: {e}"))?;
            stack.extend(node.children.iter().copied());
            if node.children.is_empty() {
                continue;
            }
            let max_children = if id == root_id { 3 } else { 2 };
            if node.children.len() > max_children {
                fully_bifurcating = false;
            }
            if id == root_id {
                continue;
            }
            let mut key = below[&id].clone();
            key.canonicalize(first_tax, &mask);
            let ones = key.count_ones();
            if ones < 2 || ones > n_tax - 2 {
                continue;
            }
            let support = parse_support(node.name.as_deref(), support_mode)?;
            if masked_splits.insert(key.clone()) {
                supports.push((key, support));
            } else if support.is_some() {
                // Both children of a rooted-binary root canonicalize to
                // the same split key; the labeled side's support wins.
                if let Some(entry) = supports.iter_mut().find(|(k, _)| *k == key) {
                    if entry.1.is_none() {
                        entry.1 = support;
                    }
                }
            }
        }

        let local_splits = masked_splits
            .iter()
            .map(|k| k.reduce_to_subset(&positions))
            .collect();

        let quartets = if want_quartets {
            quartets_from_splits(masked_splits.iter(), &positions)
        } else {
            HashSet::new()
        };

        Ok(InputTree {
            n_tax,
            mask,
            first_tax,
            positions,
            masked_splits,
            local_splits,
            supports,
            quartets,
            fully_bifurcating,
        })
    }

    /// Whether any edge carries a parsed support value.
    pub fn has_support(&self) -> bool {
        self.supports.iter().any(|(_, s)| s.is_some())
    }
}

fn compute_below(
    id: usize,
    tree: &PhyloTree,
    leaf_to_taxon: &HashMap<usize, usize>,
    words: usize,
    below: &mut HashMap<usize, Bitset>,
) -> Result<()> {
    let node = tree.get(&id).map_err(|e| anyhow!("bad node id {id}: {e}"))?;
    if node.children.is_empty() {
        let mut bs = Bitset::zeros(words);
        bs.set(leaf_to_taxon[&id]);
        below.insert(id, bs);
        return Ok(());
    }
    let mut acc = Bitset::zeros(words);
    for &child in &node.children {
        compute_below(child, tree, leaf_to_taxon, words, below)?;
        acc.or_assign(&below[&child]);
    }
    below.insert(id, acc);
    Ok(())
}

fn parse_support(label: Option<&str>, mode: SupportMode) -> Result<Option<f64>> {
    if mode == SupportMode::None {
        return Ok(None);
    }
    let Some(label) = label else {
        return Ok(None);
    };
    if label.is_empty() {
        return Ok(None);
    }
    let mut value: f64 = label
        .parse()
        .with_context(|| format!("internal node label '{label}' is not a support value"))?;
    if mode == SupportMode::Percent {
        value /= 100.0;
    }
    if !(0.0..=1.0).contains(&value) {
        if value > 1.0 && mode == SupportMode::Fractional {
            bail!(
                "support value {value} is outside 0..=1; \
                 if these are percentages, use the percent support mode"
            );
        }
        bail!("support value {value} is outside 0..=1");
    }
    Ok(Some(value))
}

/// Enumerates the quartets induced by a set of splits.
///
/// For each split, every pair on one side combined with every pair on the
/// other side resolves one quartet. `taxon_ids` lists the taxa the splits
/// range over, by global index. The quartet is normalized as
/// `[a, b, c, d]` with `a < b`, `c < d`, `a < c`, so the same quartet from
/// different splits (or different trees) collides.
pub fn quartets_from_splits<'a, I>(splits: I, taxon_ids: &[usize]) -> HashSet<[usize; 4]>
where
    I: Iterator<Item = &'a Bitset>,
{
    let mut out = HashSet::new();
    for split in splits {
        let ups: Vec<usize> = taxon_ids.iter().copied().filter(|&t| split.get(t)).collect();
        let downs: Vec<usize> = taxon_ids
            .iter()
            .copied()
            .filter(|&t| !split.get(t))
            .collect();
        for (d0, d1) in downs.iter().copied().tuple_combinations() {
            for (u0, u1) in ups.iter().copied().tuple_combinations() {
                // Pairs come out ascending because taxon_ids is ascending.
                let q = if d0 < u0 {
                    [d0, d1, u0, u1]
                } else {
                    [u0, u1, d0, d1]
                };
                out.insert(q);
            }
        }
    }
    out
}

/// Reads newick trees, one per line, and digests them in parallel.
pub fn load_input_trees(
    newicks: &[String],
    taxa: &TaxonSet,
    support_mode: SupportMode,
    want_quartets: bool,
) -> Result<Vec<InputTree>> {
    newicks
        .par_iter()
        .enumerate()
        .map(|(i, nwk)| {
            let phylo = PhyloTree::from_newick(nwk)
                .map_err(|e| anyhow!("could not parse input tree {i}: {e}"))?;
            InputTree::from_phylo(&phylo, taxa, support_mode, want_quartets)
                .with_context(|| format!("digesting input tree {i}"))
        })
        .collect()
}

/// Collects the leaf names of each newick string, for building the taxon set.
pub fn leaf_name_lists(newicks: &[String]) -> Result<Vec<Vec<String>>> {
    newicks
        .par_iter()
        .enumerate()
        .map(|(i, nwk)| {
            let phylo = PhyloTree::from_newick(nwk)
                .map_err(|e| anyhow!("could not parse input tree {i}: {e}"))?;
            let mut names = Vec::new();
            for leaf_id in phylo.get_leaves() {
                let node = phylo
                    .get(&leaf_id)
                    .map_err(|e| anyhow!("bad leaf id {leaf_id} in tree {i}: {e}"))?;
                names.push(
                    node.name
                        .clone()
                        .ok_or_else(|| anyhow!("input tree {i} has an unnamed leaf"))?,
                );
            }
            Ok(names)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxa_abcdef() -> TaxonSet {
        TaxonSet::from_leaf_name_lists(&[vec![
            "A".into(),
            "B".into(),
            "C".into(),
            "D".into(),
            "E".into(),
            "F".into(),
        ]])
        .unwrap()
    }

    #[test]
    fn test_digest_subset_tree() {
        // Taxa B, D, E, F out of the global A..F; ((B,D),(E,F)).
        let taxa = taxa_abcdef();
        let phylo = PhyloTree::from_newick("((B,D),(E,F));").unwrap();
        let it = InputTree::from_phylo(&phylo, &taxa, SupportMode::None, false).unwrap();

        assert_eq!(it.n_tax, 4);
        assert_eq!(it.positions, vec![1, 3, 4, 5]);
        assert_eq!(it.first_tax, 1);
        // One informative split: {B,D} | {E,F} (both root children give it).
        assert_eq!(it.masked_splits.len(), 1);
        let key = it.masked_splits.iter().next().unwrap();
        assert!(key.get(1), "canonical side holds the first taxon");
        assert!(key.get(3));
        assert!(!key.get(4));
        assert_eq!(it.local_splits.len(), 1);
        assert!(it.fully_bifurcating);
    }

    #[test]
    fn test_polytomy_flagged_not_bifurcating() {
        let taxa = taxa_abcdef();
        let phylo = PhyloTree::from_newick("((A,B,C),(D,E),F);").unwrap();
        let it = InputTree::from_phylo(&phylo, &taxa, SupportMode::None, false).unwrap();
        assert!(!it.fully_bifurcating);
        assert_eq!(it.masked_splits.len(), 2);
    }

    #[test]
    fn test_support_labels_parsed_and_scaled() {
        let taxa = taxa_abcdef();
        let phylo = PhyloTree::from_newick("((A,B)95,(C,D)50,(E,F));").unwrap();
        let it = InputTree::from_phylo(&phylo, &taxa, SupportMode::Percent, false).unwrap();
        let mut vals: Vec<Option<f64>> = it.supports.iter().map(|(_, s)| *s).collect();
        vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(vals, vec![None, Some(0.5), Some(0.95)]);
    }

    #[test]
    fn test_root_adjacent_support_survives_dedup() {
        // Both root children give the same canonical split; whichever
        // side is reached first, the 0.75 label must be kept.
        let taxa = TaxonSet::from_leaf_name_lists(&[vec![
            "A".into(),
            "B".into(),
            "C".into(),
            "D".into(),
        ]])
        .unwrap();
        let phylo = PhyloTree::from_newick("((A,B)0.75,(C,D));").unwrap();
        let it = InputTree::from_phylo(&phylo, &taxa, SupportMode::Fractional, false).unwrap();
        assert_eq!(it.masked_splits.len(), 1);
        assert_eq!(it.supports.len(), 1);
        assert_eq!(it.supports[0].1, Some(0.75));
        assert!(it.has_support());
    }

    #[test]
    fn test_fractional_support_out_of_range() {
        let taxa = taxa_abcdef();
        let phylo = PhyloTree::from_newick("((A,B)95,(C,D),(E,F));").unwrap();
        let err =
            InputTree::from_phylo(&phylo, &taxa, SupportMode::Fractional, false).unwrap_err();
        assert!(err.to_string().contains("percent"));
    }

    #[test]
    fn test_unknown_leaf_rejected() {
        let taxa = taxa_abcdef();
        let phylo = PhyloTree::from_newick("((A,B),(C,Zebra));").unwrap();
        let err = InputTree::from_phylo(&phylo, &taxa, SupportMode::None, false).unwrap_err();
        assert!(err.to_string().contains("Zebra"));
    }

    #[test]
    fn test_quartets_of_one_split() {
        // ((A,B),(C,D)) over exactly 4 taxa: one split, one quartet.
        let taxa = TaxonSet::from_leaf_name_lists(&[vec![
            "A".into(),
            "B".into(),
            "C".into(),
            "D".into(),
        ]])
        .unwrap();
        let phylo = PhyloTree::from_newick("((A,B),(C,D));").unwrap();
        let it = InputTree::from_phylo(&phylo, &taxa, SupportMode::None, true).unwrap();
        assert_eq!(it.quartets.len(), 1);
        assert!(it.quartets.contains(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_quartet_normalization_is_side_stable() {
        // The same quartet reached from either side of a split.
        let mut side = Bitset::zeros(1);
        side.set(2);
        side.set(3);
        let ids = [0usize, 1, 2, 3];
        let q1 = quartets_from_splits(std::iter::once(&side), &ids);

        let mut flipped = side.clone();
        flipped.flip_within(&Bitset::low_mask(1, 4));
        let q2 = quartets_from_splits(std::iter::once(&flipped), &ids);
        assert_eq!(q1, q2);
    }
}
