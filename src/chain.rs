//! A single Markov chain: current and proposal state, and the
//! Metropolis-Hastings accept step.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::input_tree::InputTree;
use crate::likelihood::{log_like, ModelKind, ModelParams, ScoreOpts};
use crate::proposal::{
    propose_beta_slide, propose_nni, propose_polytomy, propose_spa_q_slide, propose_spr,
    MoveKind, MoveResult, PolytomyPrior, SpaQPrior,
};
use crate::tree::Tree;

/// Tree, model parameters and their score, as one unit so current and
/// proposal sides can be copied wholesale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainState {
    pub tree: Tree,
    pub params: ModelParams,
    pub log_like: f64,
}

/// Move settings a chain needs to run a generation.
#[derive(Clone, Debug)]
pub struct MoveSettings {
    pub beta_tuning: f64,
    pub spa_q_tuning: f64,
    pub spa_q_prior: SpaQPrior,
    pub polytomy_prior: PolytomyPrior,
}

/// How a generation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenOutcome {
    Accepted,
    Rejected,
    /// The move found no legal edit; nothing was scored and the
    /// generation does not count toward acceptance statistics.
    Aborted,
}

/// One chain of the coupled set. `temp_num` indexes into the temperature
/// ladder and is swapped between chains, not the states themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chain {
    pub temp_num: usize,
    pub cur: ChainState,
    pub prop: ChainState,
}

impl Chain {
    pub fn new(
        temp_num: usize,
        tree: Tree,
        params: ModelParams,
        model: ModelKind,
        inputs: &[InputTree],
        opts: &ScoreOpts,
    ) -> Result<Chain> {
        let ll = log_like(model, &tree, inputs, &params, opts)?;
        let cur = ChainState {
            tree,
            params,
            log_like: ll,
        };
        Ok(Chain {
            temp_num,
            prop: cur.clone(),
            cur,
        })
    }

    /// Heat for this chain's rung: 1 for the cold chain, shrinking with
    /// `temp_num`.
    pub fn heat(&self, chain_temp: f64) -> f64 {
        1.0 / (1.0 + chain_temp * self.temp_num as f64)
    }

    /// Runs one generation with the given move. On acceptance the proposal
    /// becomes current; otherwise the proposal side is restored.
    #[allow(clippy::too_many_arguments)]
    pub fn step<R: Rng>(
        &mut self,
        move_kind: MoveKind,
        settings: &MoveSettings,
        model: ModelKind,
        inputs: &[InputTree],
        opts: &ScoreOpts,
        heat: f64,
        rng: &mut R,
    ) -> Result<GenOutcome> {
        let result = match move_kind {
            MoveKind::Nni => propose_nni(&mut self.prop.tree, rng),
            MoveKind::Spr => propose_spr(&mut self.prop.tree, rng),
            MoveKind::Polytomy => {
                propose_polytomy(&mut self.prop.tree, &settings.polytomy_prior, rng)
            }
            MoveKind::BetaSlide => {
                propose_beta_slide(&mut self.prop.params.beta, settings.beta_tuning, rng)
            }
            MoveKind::SpaQSlide => propose_spa_q_slide(
                &mut self.prop.params.spa_q,
                settings.spa_q_tuning,
                settings.spa_q_prior,
                rng,
            ),
        };
        let MoveResult::Proposed {
            log_proposal_ratio,
            log_prior_ratio,
        } = result
        else {
            self.prop = self.cur.clone();
            return Ok(GenOutcome::Aborted);
        };

        if move_kind.is_topology() {
            self.prop.tree.refresh();
        }
        self.prop.log_like = log_like(model, &self.prop.tree, inputs, &self.prop.params, opts)?;

        let log_like_ratio = self.prop.log_like - self.cur.log_like;
        let p = heat * (log_like_ratio + log_prior_ratio) + log_proposal_ratio;

        let accept = if p >= 0.0 {
            true
        } else if p < -100.0 {
            false
        } else {
            rng.gen_range(0.0..1.0) < p.exp()
        };

        if accept {
            self.cur = self.prop.clone();
            Ok(GenOutcome::Accepted)
        } else {
            self.prop = self.cur.clone();
            Ok(GenOutcome::Rejected)
        }
    }
}
