//! Topology and parameter moves, with their Hastings bookkeeping.
//!
//! Topology moves mutate the proposal tree in place and report the log
//! proposal and log prior ratios; a move that cannot find a legal edit
//! reports an abort instead, and the caller restores the proposal tree
//! from the current one. Parameter moves are reflected sliders and are
//! always legal.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::likelihood::{BETA_MAX, BETA_MIN, SPA_Q_MAX, SPA_Q_MIN};
use crate::tree::Tree;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveKind {
    Nni,
    Spr,
    Polytomy,
    BetaSlide,
    SpaQSlide,
}

impl MoveKind {
    pub fn is_topology(self) -> bool {
        matches!(self, MoveKind::Nni | MoveKind::Spr | MoveKind::Polytomy)
    }

    pub fn name(self) -> &'static str {
        match self {
            MoveKind::Nni => "nni",
            MoveKind::Spr => "spr",
            MoveKind::Polytomy => "polytomy",
            MoveKind::BetaSlide => "beta_slide",
            MoveKind::SpaQSlide => "spaQ_slide",
        }
    }
}

/// What a move did to the proposal state.
#[derive(Clone, Copy, Debug)]
pub enum MoveResult {
    Proposed {
        log_proposal_ratio: f64,
        log_prior_ratio: f64,
    },
    /// No legal edit existed; the proposal tree may be unchanged but the
    /// generation does not count.
    Aborted,
}

impl MoveResult {
    fn symmetric() -> MoveResult {
        MoveResult::Proposed {
            log_proposal_ratio: 0.0,
            log_prior_ratio: 0.0,
        }
    }
}

/// Prior on the spaQ parameter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum SpaQPrior {
    Flat,
    Exponential { lambda: f64 },
}

/// Prior configuration for the polytomy move.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolytomyPrior {
    /// `log C`, the per-edge prior factor.
    pub log_big_c: f64,
    /// `log T(n, m)` for `m` in `0..=n_tax-2`, present when the
    /// resolution-class prior is on.
    pub resolution_class_log_counts: Option<Vec<f64>>,
}

impl PolytomyPrior {
    pub fn flat() -> PolytomyPrior {
        PolytomyPrior {
            log_big_c: 0.0,
            resolution_class_log_counts: None,
        }
    }
}

fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `log T(n, m)`: the log count of unrooted multifurcating trees of `n`
/// taxa with exactly `m` internal nodes, for `m` in `0..=n-2`. Felsenstein
/// recurrence `T(n+1, m) = m T(n, m) + (n + m - 2) T(n, m - 1)`, carried
/// in log space so large taxon sets do not overflow.
pub fn resolution_class_log_counts(n_tax: usize) -> Vec<f64> {
    assert!(n_tax >= 3);
    let mut cur = vec![f64::NEG_INFINITY; n_tax.max(3)];
    cur[1] = 0.0; // T(3, 1) = 1
    for n in 3..n_tax {
        let mut next = vec![f64::NEG_INFINITY; cur.len()];
        for m in 1..=n - 1 {
            let grow = if cur[m] > f64::NEG_INFINITY {
                (m as f64).ln() + cur[m]
            } else {
                f64::NEG_INFINITY
            };
            let split = if m >= 1 && cur[m - 1] > f64::NEG_INFINITY {
                ((n + m - 2) as f64).ln() + cur[m - 1]
            } else {
                f64::NEG_INFINITY
            };
            next[m] = log_add(grow, split);
        }
        cur = next;
    }
    cur.truncate(n_tax - 1);
    cur
}

/// Nodes reachable from the root, via links only (safe on a dirty tree).
fn attached_nodes(tree: &Tree) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![tree.root()];
    while let Some(i) = stack.pop() {
        out.push(i);
        let mut c = tree.node(i).first_child;
        while let Some(ci) = c {
            stack.push(ci);
            c = tree.node(ci).next_sibling;
        }
    }
    out
}

/// Internal nodes that can still be resolved further: non-root nodes with
/// more than 2 children, plus the root when it has more than 3.
fn polytomies(tree: &Tree) -> Vec<usize> {
    attached_nodes(tree)
        .into_iter()
        .filter(|&i| {
            if tree.node(i).is_leaf() {
                return false;
            }
            let limit = if i == tree.root() { 3 } else { 2 };
            tree.n_children(i) > limit
        })
        .collect()
}

/// Nearest-neighbor interchange: a random child of a random internal
/// non-root node trades places with one of its parent's other children.
/// Symmetric, so the proposal ratio is 1.
pub fn propose_nni<R: Rng>(tree: &mut Tree, rng: &mut R) -> MoveResult {
    let internals = tree.internals_no_root();
    let Some(&n) = internals.choose(rng) else {
        return MoveResult::Aborted; // star tree
    };
    let p = tree.node(n).parent.unwrap();
    let n_kids: Vec<usize> = tree.children(n).collect();
    let p_kids: Vec<usize> = tree.children(p).filter(|&c| c != n).collect();
    let &a = n_kids.choose(rng).unwrap();
    let &b = p_kids.choose(rng).unwrap();
    tree.detach_child(n, a);
    tree.detach_child(p, b);
    tree.attach_child(p, a);
    tree.attach_child(n, b);
    MoveResult::symmetric()
}

/// Subtrees whose parent edge can be pruned without changing the tree's
/// resolution class: the parent must be a binary internal non-root node,
/// which dissolves when the subtree leaves.
fn spr_prunable(tree: &Tree) -> Vec<usize> {
    attached_nodes(tree)
        .into_iter()
        .filter(|&x| {
            if x == tree.root() {
                return false;
            }
            let u = tree.node(x).parent.unwrap();
            u != tree.root() && !tree.node(u).is_leaf() && tree.n_children(u) == 2
        })
        .collect()
}

/// Subtree prune and regraft. A subtree with a binary, non-root parent is
/// pruned (the parent dissolves) and regrafted onto another edge (a new
/// node is made there), so the resolution class is preserved. The target
/// edge count is the same before and after, but the prunable count can
/// differ, and the Hastings ratio accounts for it.
pub fn propose_spr<R: Rng>(tree: &mut Tree, rng: &mut R) -> MoveResult {
    let prunable = spr_prunable(tree);
    if prunable.is_empty() {
        return MoveResult::Aborted;
    }
    let n_forward = prunable.len();
    let &x = prunable.choose(rng).unwrap();
    let u = tree.node(x).parent.unwrap();

    tree.detach_child(u, x);
    tree.delete_edge(u); // splices x's former sibling into u's place

    // Any non-root node of the remaining tree is a regraft edge.
    let targets: Vec<usize> = attached_nodes(tree)
        .into_iter()
        .filter(|&v| v != tree.root())
        .collect();
    let &v = targets.choose(rng).unwrap();
    tree.insert_on_edge(v, x);

    let n_reverse = spr_prunable(tree).len();
    MoveResult::Proposed {
        log_proposal_ratio: (n_forward as f64).ln() - (n_reverse as f64).ln(),
        log_prior_ratio: 0.0,
    }
}

/// The dimension-changing polytomy move: either resolve part of a
/// polytomy with a new edge, or collapse an existing internal edge.
/// On a star tree only the add direction exists; on a fully resolved tree
/// only the delete direction; otherwise a fair coin picks.
pub fn propose_polytomy<R: Rng>(
    tree: &mut Tree,
    prior: &PolytomyPrior,
    rng: &mut R,
) -> MoveResult {
    let m = tree.n_internal();
    let resolved_m = tree.n_tax() - 2;
    if m == 1 {
        propose_add_edge(tree, prior, rng)
    } else if m == resolved_m {
        propose_delete_edge(tree, prior, rng)
    } else if rng.gen_range(0.0..1.0) < 0.5 {
        propose_add_edge(tree, prior, rng)
    } else {
        propose_delete_edge(tree, prior, rng)
    }
}

fn propose_add_edge<R: Rng>(tree: &mut Tree, prior: &PolytomyPrior, rng: &mut R) -> MoveResult {
    let m = tree.n_internal();
    let resolved_m = tree.n_tax() - 2;
    let all_polytomies = polytomies(tree);
    debug_assert!(!all_polytomies.is_empty());
    let &target = all_polytomies.choose(rng).unwrap();

    // The root has no parent edge, so one child stands in for the parent
    // in the edge-group count; k is the degree of the node being resolved.
    let n_children = if target == tree.root() {
        tree.n_children(target) - 1
    } else {
        tree.n_children(target)
    };
    let k = n_children + 1;
    let n_possible_ways = 2f64.powi(k as i32 - 1) - k as f64 - 1.0;

    // Group sizes 2..=n_children-1, weighted by how many groups of each
    // size exist; together the weights sum to n_possible_ways.
    let mut draw = rng.gen_range(0.0..1.0) * n_possible_ways;
    let mut group_size = n_children - 1;
    for i in 2..n_children {
        let ways = binomial_f(n_children, i);
        if draw < ways {
            group_size = i;
            break;
        }
        draw -= ways;
    }

    let children: Vec<usize> = tree.children(target).collect();
    let group: Vec<usize> = children
        .choose_multiple(rng, group_size)
        .copied()
        .collect();
    tree.add_edge(target, &group);

    let gamma_b = if m == 1 && m + 1 < resolved_m {
        0.5
    } else if m + 1 == resolved_m && m > 1 {
        2.0
    } else {
        1.0
    };
    let n_e = (m - 1) as f64;
    let n_p = all_polytomies.len() as f64;
    let hastings = gamma_b * n_p * n_possible_ways / (1.0 + n_e);

    // With equal prior mass on topologies the branch-length prior and
    // Jacobian cancel; only the topology prior remains.
    let log_prior_ratio = match &prior.resolution_class_log_counts {
        Some(log_t) => log_t[m] - (prior.log_big_c + log_t[m + 1]),
        None => -prior.log_big_c,
    };
    MoveResult::Proposed {
        log_proposal_ratio: hastings.ln(),
        log_prior_ratio,
    }
}

fn propose_delete_edge<R: Rng>(tree: &mut Tree, prior: &PolytomyPrior, rng: &mut R) -> MoveResult {
    let m = tree.n_internal();
    let resolved_m = tree.n_tax() - 2;
    let candidates = tree.internals_no_root();
    debug_assert!(!candidates.is_empty());
    let &target = candidates.choose(rng).unwrap();
    let parent = tree.node(target).parent.unwrap();
    tree.delete_edge(target);

    let gamma_d = if m == resolved_m && m - 1 != 1 {
        0.5
    } else if m < resolved_m && m - 1 == 1 {
        2.0
    } else {
        1.0
    };
    let n_e = (m - 1) as f64;
    let n_star_p = polytomies(tree).len() as f64;
    // Degree of the polytomy the collapse created or enlarged.
    let k_star = tree.n_children(parent) + usize::from(parent != tree.root());
    let ways = 2f64.powi(k_star as i32 - 1) - k_star as f64 - 1.0;
    let hastings = gamma_d * n_e / (n_star_p * ways);

    let log_prior_ratio = match &prior.resolution_class_log_counts {
        Some(log_t) => (log_t[m] + prior.log_big_c) - log_t[m - 1],
        None => prior.log_big_c,
    };
    MoveResult::Proposed {
        log_proposal_ratio: hastings.ln(),
        log_prior_ratio,
    }
}

fn binomial_f(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    let mut out = 1.0;
    let mut n = n as f64;
    for t in 1..=k {
        out *= n / t as f64;
        n -= 1.0;
    }
    out
}

/// Folds a value back into `(lo, hi]` by reflecting at the bounds.
fn reflect(mut x: f64, lo: f64, hi: f64) -> f64 {
    loop {
        if x < lo {
            x = (lo - x) + lo;
        } else if x > hi {
            x = hi - (x - hi);
        } else {
            return x;
        }
    }
}

/// Uniform slider on beta, reflected at its bounds. Symmetric, flat prior.
pub fn propose_beta_slide<R: Rng>(beta: &mut f64, tuning: f64, rng: &mut R) -> MoveResult {
    let next = *beta + (rng.gen_range(0.0..1.0) - 0.5) * tuning;
    *beta = reflect(next, BETA_MIN, BETA_MAX);
    MoveResult::symmetric()
}

/// Uniform slider on spaQ, reflected into `(0, 1]`, with a flat or
/// exponential prior.
pub fn propose_spa_q_slide<R: Rng>(
    spa_q: &mut f64,
    tuning: f64,
    prior: SpaQPrior,
    rng: &mut R,
) -> MoveResult {
    let old = *spa_q;
    let next = old + (rng.gen_range(0.0..1.0) - 0.5) * tuning;
    *spa_q = reflect(next, SPA_Q_MIN, SPA_Q_MAX);
    let log_prior_ratio = match prior {
        SpaQPrior::Flat => 0.0,
        SpaQPrior::Exponential { lambda } => lambda * (old - *spa_q),
    };
    MoveResult::Proposed {
        log_proposal_ratio: 0.0,
        log_prior_ratio,
    }
}
