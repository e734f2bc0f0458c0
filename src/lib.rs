//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: compact bitset representation for taxon sets and splits.
//! - `taxa`: the sorted union taxon set over the input trees.
//! - `tree`: the arena supertree with its topology edit primitives.
//! - `input_tree`: digested input trees (masks, splits, supports, quartets).
//! - `likelihood`: the SR2008, SPA and QPA scoring functions.
//! - `proposal`: topology and parameter moves with Hastings bookkeeping.
//! - `chain`: a single chain and its Metropolis-Hastings accept step.
//! - `mcmc`: the coupled sampler, run loop, checkpointing, auto tuning.
//! - `checkpoint`: gzipped-JSON snapshots, written atomically.
//! - `output`: the likes/trees/prams trace files.
//! - `progress`: stderr progress bars.
//!
//! Public API kept stable by re-exporting key items from the modules.

pub mod bitset;
pub mod chain;
pub mod checkpoint;
pub mod input_tree;
pub mod likelihood;
pub mod mcmc;
pub mod output;
pub mod progress;
pub mod proposal;
pub mod taxa;
pub mod tree;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use input_tree::{load_input_trees, InputTree, SupportMode};
pub use likelihood::{ModelKind, ModelParams};
pub use mcmc::{Mcmc, McmcSetup, ProposalProbs, Tunings};
pub use taxa::TaxonSet;
pub use tree::Tree;
