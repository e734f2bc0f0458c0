//! Supertree likelihood models.
//!
//! Three families, all scored against the digested input trees:
//!
//! - `SR2008_rf_*`: likelihood decays exponentially with the
//!   Robinson-Foulds distance between each input tree and the supertree
//!   restricted to its taxa. The `aZ` variants subtract an approximate
//!   log partition function (Bryant & Steel 2009, Eqn 30); the `fb`
//!   variant additionally samples beta.
//! - `SPA`: each possible split of an input-tree-sized taxon set either
//!   matches the reduced supertree (probability mass `spaQ`, shared
//!   across the matching splits) or not (the rest, shared likewise).
//! - `QPA`: the same presence/absence idea over quartets instead of
//!   splits.
//!
//! Distances come in two flavors: a reference path that re-indexes every
//! supertree split into the input tree's local numbering, and a faster
//! masked path that stays at global width. They must agree; the masked
//! path can carry an always-on cross-check in tests.

use std::collections::HashSet;

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::bitset::Bitset;
use crate::input_tree::{quartets_from_splits, InputTree};
use crate::tree::Tree;

pub const BETA_MIN: f64 = 1e-10;
pub const BETA_MAX: f64 = 1e10;
pub const SPA_Q_MIN: f64 = 1e-10;
pub const SPA_Q_MAX: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ModelKind {
    /// RF distance times beta, no partition function.
    Sr2008RfIa,
    /// RF distance with the approximate log partition function.
    Sr2008RfAz,
    /// As `Sr2008RfAz`, with beta as a free sampled parameter.
    Sr2008RfAzFb,
    /// Split presence/absence.
    Spa,
    /// Quartet presence/absence.
    Qpa,
}

impl ModelKind {
    pub fn is_rf(self) -> bool {
        matches!(
            self,
            ModelKind::Sr2008RfIa | ModelKind::Sr2008RfAz | ModelKind::Sr2008RfAzFb
        )
    }

    pub fn subtracts_log_z(self) -> bool {
        matches!(self, ModelKind::Sr2008RfAz | ModelKind::Sr2008RfAzFb)
    }

    /// Whether the model has a free continuous parameter worth tracing.
    pub fn writes_params(self) -> bool {
        matches!(
            self,
            ModelKind::Sr2008RfAzFb | ModelKind::Spa | ModelKind::Qpa
        )
    }

    /// Name of the traced parameter column.
    pub fn param_name(self) -> &'static str {
        if self.is_rf() {
            "beta"
        } else {
            "spaQ"
        }
    }
}

/// The continuous model state carried by each chain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModelParams {
    pub beta: f64,
    pub spa_q: f64,
}

impl Default for ModelParams {
    fn default() -> ModelParams {
        ModelParams {
            beta: 1.0,
            spa_q: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ScoreOpts {
    /// Weight matched splits by their parsed support values (SPA only).
    pub use_split_support: bool,
    /// Run the reference RF path alongside the masked one and compare.
    pub rf_cross_check: bool,
}

/// `log b(n)`: the log count of binary tree shapes, as a product of odd
/// terms `(2k-5)` for `k` in `4..=n`.
pub fn b_for_n(n: usize) -> f64 {
    let mut prod_log = 0.0;
    for k in 4..=n {
        prod_log += ((2 * k - 5) as f64).ln();
    }
    prod_log
}

/// Bryant & Steel 2009, Eqn 30: approximate `log Z_T` for an `n`-taxon
/// tree at inverse temperature `beta`, given the cherry count `c_t` of the
/// reduced supertree.
pub fn bs2009_eqn30_log_zt(n: usize, beta: f64, c_t: usize) -> f64 {
    let n_f = n as f64;
    let c_t = c_t as f64;
    let lambda = c_t / (2.0 * n_f);
    let tester = 0.5 * ((n_f - 3.0) / lambda).ln();

    let epsilon = (-2.0 * beta).exp();
    let big_a = 1.0
        + ((2.0 * n_f) - 3.0) * epsilon
        + 2.0 * ((n_f * n_f) - (4.0 * n_f) - 6.0) * epsilon * epsilon;
    let term_a = (big_a + 6.0 * c_t * epsilon * epsilon).ln();

    if beta < tester {
        let mut term_b = -(2.0 * beta) * (n_f - 3.0) + lambda * ((2.0 * beta).exp() - 1.0);
        term_b += b_for_n(n);
        term_a.max(term_b)
    } else {
        term_a
    }
}

fn binomial(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut num: u64 = 1;
    let mut den: u64 = 1;
    let mut n = n as u64;
    for t in 1..=(k as u64) {
        num *= n;
        den *= t;
        n -= 1;
    }
    num / den
}

/// RF distance and cherry count between the supertree and one input tree,
/// both restricted to the input tree's taxa.
///
/// Reference path: every supertree split is re-indexed into the input
/// tree's local numbering, non-informative reductions dropped, and the
/// survivors compared as a set against the input's local splits.
pub fn rf_reduced_reference(tree: &Tree, input: &InputTree) -> (usize, usize) {
    let n = input.n_tax;
    let mut reduced: HashSet<Bitset> = HashSet::new();
    for below in tree.internal_below_sets() {
        let key = below.reduce_to_subset(&input.positions);
        let ones = key.count_ones();
        if ones < 2 || ones > n - 2 {
            continue;
        }
        reduced.insert(key);
    }
    let dist = reduced.symmetric_difference(&input.local_splits).count();
    let cherries = count_cherries(&reduced, n);
    (dist, cherries)
}

/// The same quantities from the masked path: supertree splits stay at
/// global width and are intersected with the input's taxon mask.
pub fn rf_reduced_masked(tree: &Tree, input: &InputTree) -> (usize, usize) {
    let n = input.n_tax;
    let mut reduced: HashSet<Bitset> = HashSet::new();
    for below in tree.internal_below_sets() {
        let mut key = below.and(&input.mask);
        key.canonicalize(input.first_tax, &input.mask);
        let ones = key.count_ones();
        if ones < 2 || ones > n - 2 {
            continue;
        }
        reduced.insert(key);
    }
    let dist = reduced.symmetric_difference(&input.masked_splits).count();
    let cherries = count_cherries(&reduced, n);
    (dist, cherries)
}

// A split whose small side has 2 taxa is a cherry; with 4 taxa both sides
// count, matching the reduced-tree cherry definition.
fn count_cherries(reduced: &HashSet<Bitset>, n: usize) -> usize {
    let mut cherries = 0;
    for key in reduced {
        let ones = key.count_ones();
        if ones == 2 {
            cherries += 1;
        }
        if ones == n - 2 {
            cherries += 1;
        }
    }
    cherries
}

fn check_beta(beta: f64) -> Result<()> {
    if !(BETA_MIN..=BETA_MAX).contains(&beta) {
        bail!("beta value {beta} is out of range");
    }
    Ok(())
}

fn check_spa_q(spa_q: f64) -> Result<()> {
    if spa_q <= 0.0 || spa_q > SPA_Q_MAX {
        bail!("spaQ value {spa_q} is out of range");
    }
    Ok(())
}

fn rf_log_like(
    kind: ModelKind,
    tree: &Tree,
    inputs: &[InputTree],
    params: &ModelParams,
    opts: &ScoreOpts,
) -> Result<f64> {
    check_beta(params.beta)?;
    let mut log_like = 0.0;
    for input in inputs {
        let (dist, cherries) = rf_reduced_masked(tree, input);
        if opts.rf_cross_check {
            let (ref_dist, ref_cherries) = rf_reduced_reference(tree, input);
            if dist != ref_dist || cherries != ref_cherries {
                bail!(
                    "masked RF ({dist}, {cherries} cherries) disagrees with \
                     reference RF ({ref_dist}, {ref_cherries} cherries)"
                );
            }
        }
        log_like -= params.beta * dist as f64;
        if kind.subtracts_log_z() {
            log_like -= bs2009_eqn30_log_zt(input.n_tax, params.beta, cherries);
        }
    }
    Ok(log_like)
}

fn spa_log_like(
    tree: &Tree,
    inputs: &[InputTree],
    params: &ModelParams,
    opts: &ScoreOpts,
) -> Result<f64> {
    check_spa_q(params.spa_q)?;
    let below_sets = tree.internal_below_sets();
    let mut log_like = 0.0;
    for input in inputs {
        let n = input.n_tax;
        let mut reduced: HashSet<Bitset> = HashSet::new();
        for below in &below_sets {
            let mut key = below.and(&input.mask);
            key.canonicalize(input.first_tax, &input.mask);
            let ones = key.count_ones();
            if ones >= 2 && ones <= n - 2 {
                reduced.insert(key);
            }
        }
        let s_st = reduced.len();
        // All possible splits of an n-taxon tree.
        let s = 2f64.powi(n as i32 - 1) - (n as f64 + 1.0);
        let (q, r) = if s_st > 0 {
            let q = params.spa_q / s_st as f64;
            let r = (1.0 - params.spa_q) / (s - s_st as f64);
            (q, r)
        } else {
            (0.0, 1.0 / s)
        };
        for (key, support) in &input.supports {
            if reduced.contains(key) {
                if opts.use_split_support && support.is_some() {
                    let sup = support.unwrap_or_default();
                    log_like += (r + sup * (q - r)).ln();
                } else {
                    log_like += q.ln();
                }
            } else {
                // Unmatched splits get the flat r, support or not.
                log_like += r.ln();
            }
        }
    }
    Ok(log_like)
}

fn qpa_log_like(tree: &Tree, inputs: &[InputTree], params: &ModelParams) -> Result<f64> {
    check_spa_q(params.spa_q)?;
    let n = tree.n_tax();
    let all_taxa: Vec<usize> = (0..n).collect();
    let below_sets = tree.internal_below_sets();
    let tree_quartets = quartets_from_splits(below_sets.iter(), &all_taxa);
    let n_quartets = tree_quartets.len();
    let possible = (binomial(n, 4) * 3) as f64;

    let (log_q, log_r) = if n_quartets > 0 {
        let q = params.spa_q / n_quartets as f64;
        let r = (1.0 - params.spa_q) / (possible - n_quartets as f64);
        (q.ln(), r.ln())
    } else {
        (f64::NEG_INFINITY, (1.0 / possible).ln())
    };

    let mut log_like = 0.0;
    for input in inputs {
        for quartet in &input.quartets {
            if tree_quartets.contains(quartet) {
                log_like += log_q;
            } else {
                log_like += log_r;
            }
        }
    }
    Ok(log_like)
}

/// Scores the supertree under the chosen model. The tree must be clean.
pub fn log_like(
    kind: ModelKind,
    tree: &Tree,
    inputs: &[InputTree],
    params: &ModelParams,
    opts: &ScoreOpts,
) -> Result<f64> {
    if tree.is_dirty() {
        bail!("cannot score a tree with stale caches");
    }
    match kind {
        ModelKind::Sr2008RfIa | ModelKind::Sr2008RfAz | ModelKind::Sr2008RfAzFb => {
            rf_log_like(kind, tree, inputs, params, opts)
        }
        ModelKind::Spa => spa_log_like(tree, inputs, params, opts),
        ModelKind::Qpa => qpa_log_like(tree, inputs, params),
    }
}
