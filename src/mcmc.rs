//! The sampler itself: the coupled chains, the move schedule, the run
//! loop with sampling and checkpointing, and automatic tuning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bitset::Bitset;
use crate::chain::{Chain, GenOutcome, MoveSettings};
use crate::checkpoint;
use crate::input_tree::InputTree;
use crate::likelihood::{ModelKind, ModelParams, ScoreOpts};
use crate::output::TraceFiles;
use crate::progress;
use crate::proposal::{resolution_class_log_counts, MoveKind, PolytomyPrior, SpaQPrior};
use crate::taxa::TaxonSet;
use crate::tree::Tree;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaQPriorKind {
    Flat,
    Exponential,
}

/// Tuning knobs. The slider windows and the chain temperature can be
/// adjusted by hand or by [`Mcmc::auto_tune`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tunings {
    pub chain_temp: f64,
    pub beta_slide: f64,
    pub spa_q_slide: f64,
    pub do_polytomy_resolution_class_prior: bool,
    pub polytomy_prior_log_big_c: f64,
    pub spa_q_prior: SpaQPriorKind,
    pub spa_q_exp_prior_lambda: f64,
}

impl Default for Tunings {
    fn default() -> Tunings {
        Tunings {
            chain_temp: 1.0,
            beta_slide: 0.2,
            spa_q_slide: 0.1,
            do_polytomy_resolution_class_prior: false,
            polytomy_prior_log_big_c: 0.0,
            spa_q_prior: SpaQPriorKind::Flat,
            spa_q_exp_prior_lambda: 100.0,
        }
    }
}

/// Relative move weights. A weight of zero drops the move from the
/// schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalProbs {
    pub nni: f64,
    pub spr: f64,
    pub beta_slide: f64,
    pub spa_q_slide: f64,
    pub polytomy: f64,
}

impl Default for ProposalProbs {
    fn default() -> ProposalProbs {
        ProposalProbs {
            nni: 1.0,
            spr: 1.0,
            beta_slide: 1.0,
            spa_q_slide: 1.0,
            polytomy: 0.0,
        }
    }
}

impl ProposalProbs {
    /// Model-specific defaults. The split and quartet models sample over
    /// all resolution classes, so they lead with the polytomy move and
    /// drop SPR, which preserves the resolution class.
    pub fn for_model(model: ModelKind) -> ProposalProbs {
        let mut probs = ProposalProbs::default();
        if matches!(model, ModelKind::Spa | ModelKind::Qpa) {
            probs.polytomy = 1.0;
            probs.spr = 0.0;
        }
        probs
    }
}

/// One schedule entry with its counters, one row per temperature. Row 0
/// is always the cold temperature, whichever chain slot holds it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub kind: MoveKind,
    pub weight: f64,
    pub n_proposals: Vec<u64>,
    pub n_acceptances: Vec<u64>,
    pub n_aborts: Vec<u64>,
}

impl Proposal {
    fn new(kind: MoveKind, weight: f64, n_chains: usize) -> Proposal {
        Proposal {
            kind,
            weight,
            n_proposals: vec![0; n_chains],
            n_acceptances: vec![0; n_chains],
            n_aborts: vec![0; n_chains],
        }
    }

    fn zero(&mut self) {
        self.n_proposals.iter_mut().for_each(|x| *x = 0);
        self.n_acceptances.iter_mut().for_each(|x| *x = 0);
        self.n_aborts.iter_mut().for_each(|x| *x = 0);
    }

    /// Acceptance fraction at the cold temperature.
    pub fn acceptance(&self) -> f64 {
        self.n_acceptances[0] as f64 / self.n_proposals[0] as f64
    }
}

/// Split frequencies of cold-chain samples, accumulated between
/// checkpoints for convergence diagnostics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SplitTally {
    pub counts: Vec<(Bitset, u64)>,
    pub n_samples: u64,
}

impl SplitTally {
    pub fn add(&mut self, tree: &Tree) {
        self.n_samples += 1;
        for split in tree.split_set() {
            match self.counts.iter_mut().find(|(k, _)| *k == split) {
                Some((_, n)) => *n += 1,
                None => self.counts.push((split, 1)),
            }
        }
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.n_samples = 0;
    }

    /// Frequencies sorted most common first.
    pub fn frequencies(&self) -> Vec<(Bitset, f64)> {
        let mut out: Vec<(Bitset, f64)> = self
            .counts
            .iter()
            .map(|(k, n)| (k.clone(), *n as f64 / self.n_samples as f64))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }
}

/// Everything needed to construct a fresh sampler.
#[derive(Clone, Debug)]
pub struct McmcSetup {
    pub model: ModelKind,
    pub run_num: usize,
    pub n_chains: usize,
    pub sample_interval: u64,
    pub checkpoint_interval: Option<u64>,
    pub tunings: Tunings,
    pub probs: ProposalProbs,
    pub score_opts: ScoreOpts,
    pub start_params: ModelParams,
    pub seed: Option<u64>,
    pub quiet: bool,
    /// Refuse to start when output files of this run already exist, and
    /// require the trace files of all lower run numbers.
    pub check_output_files: bool,
    pub do_heating_hack: bool,
    pub heating_hack_temperature: f64,
}

impl McmcSetup {
    pub fn new(model: ModelKind) -> McmcSetup {
        McmcSetup {
            model,
            run_num: 0,
            n_chains: 1,
            sample_interval: 100,
            checkpoint_interval: None,
            tunings: Tunings::default(),
            probs: ProposalProbs::for_model(model),
            score_opts: ScoreOpts::default(),
            start_params: ModelParams::default(),
            seed: None,
            quiet: false,
            check_output_files: true,
            do_heating_hack: false,
            heating_hack_temperature: 5.0,
        }
    }
}

fn entropy_rng() -> StdRng {
    StdRng::from_entropy()
}

fn log_if(show: bool, msg: String) {
    if show {
        println!("{msg}");
    }
}

/// The sampler state. Serializable as a whole; that is what a checkpoint
/// is. The RNG is not carried across checkpoints, a restore reseeds.
#[derive(Serialize, Deserialize)]
pub struct Mcmc {
    pub model: ModelKind,
    pub run_num: usize,
    pub n_chains: usize,
    pub sample_interval: u64,
    pub checkpoint_interval: Option<u64>,
    pub tunings: Tunings,
    pub score_opts: ScoreOpts,
    pub taxa: TaxonSet,
    pub inputs: Vec<InputTree>,
    pub proposals: Vec<Proposal>,
    pub chains: Vec<Chain>,
    pub swap_matrix: Vec<Vec<u64>>,
    pub splits: SplitTally,
    /// Generation counter, -1 before the first generation.
    pub gen_num: i64,
    pub do_heating_hack: bool,
    pub heating_hack_temperature: f64,
    /// Cached log resolution-class counts for the polytomy prior.
    polytomy_log_t: Option<Vec<f64>>,
    #[serde(skip)]
    pub quiet: bool,
    #[serde(skip)]
    out_dir: PathBuf,
    #[serde(skip, default = "entropy_rng")]
    rng: StdRng,
}

impl Mcmc {
    pub fn new(
        taxa: TaxonSet,
        inputs: Vec<InputTree>,
        out_dir: &Path,
        setup: McmcSetup,
    ) -> Result<Mcmc> {
        ensure!(setup.n_chains >= 1, "need at least one chain");
        ensure!(setup.sample_interval >= 1, "sample interval must be positive");
        ensure!(!inputs.is_empty(), "no input trees");

        if setup.model.is_rf() {
            for (i, t) in inputs.iter().enumerate() {
                if !t.fully_bifurcating {
                    bail!(
                        "the SR2008 models want fully bifurcating input trees, \
                         but input tree {i} has a polytomy"
                    );
                }
            }
            ensure!(
                !setup.score_opts.use_split_support,
                "split support is not implemented for the SR2008 models"
            );
        }
        if setup.score_opts.use_split_support && !inputs.iter().any(|t| t.has_support()) {
            bail!("split support is turned on, but no input tree carries support values");
        }
        if setup.do_heating_hack {
            ensure!(
                setup.n_chains == 1,
                "the heating hack does not mix with coupled chains"
            );
        }

        if setup.check_output_files {
            if checkpoint::exists_for_run(out_dir, setup.run_num) {
                bail!(
                    "run {run} already has checkpoint files here; resume from the latest \
                     mcmc_checkpoint_{run} file or move the old run's files away",
                    run = setup.run_num
                );
            }
            for lower in 0..setup.run_num {
                let trees = out_dir.join(format!("mcmc_trees_{lower}.nex"));
                if !trees.exists() {
                    bail!(
                        "run numbers go from zero up, but there is no mcmc_trees_{lower}.nex \
                         to show that run {lower} has been done"
                    );
                }
            }
        }

        let mut rng = match setup.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let mut proposals = Vec::new();
        let probs = &setup.probs;
        if probs.nni > 0.0 {
            proposals.push(Proposal::new(MoveKind::Nni, probs.nni, setup.n_chains));
        }
        if probs.spr > 0.0 {
            proposals.push(Proposal::new(MoveKind::Spr, probs.spr, setup.n_chains));
        }
        if setup.model == ModelKind::Sr2008RfAzFb && probs.beta_slide > 0.0 {
            proposals.push(Proposal::new(
                MoveKind::BetaSlide,
                probs.beta_slide,
                setup.n_chains,
            ));
        }
        if matches!(setup.model, ModelKind::Spa | ModelKind::Qpa) && probs.spa_q_slide > 0.0 {
            proposals.push(Proposal::new(
                MoveKind::SpaQSlide,
                probs.spa_q_slide,
                setup.n_chains,
            ));
        }
        // On the schedule by default for SPA and QPA only, but any model
        // can sample over resolution classes when asked to.
        if probs.polytomy > 0.0 {
            proposals.push(Proposal::new(
                MoveKind::Polytomy,
                probs.polytomy,
                setup.n_chains,
            ));
        }
        ensure!(!proposals.is_empty(), "the move schedule is empty");
        let total: f64 = proposals.iter().map(|p| p.weight).sum();
        ensure!(total > 1e-9, "the move weights sum to zero");

        let has_polytomy = proposals.iter().any(|p| p.kind == MoveKind::Polytomy);
        let polytomy_log_t = (has_polytomy
            && setup.tunings.do_polytomy_resolution_class_prior)
            .then(|| resolution_class_log_counts(taxa.len()));

        // All chains start from the same random resolved tree.
        let start_tree = Tree::random_resolved(taxa.len(), &mut rng);
        let mut chains = Vec::with_capacity(setup.n_chains);
        for temp_num in 0..setup.n_chains {
            chains.push(Chain::new(
                temp_num,
                start_tree.clone(),
                setup.start_params,
                setup.model,
                &inputs,
                &setup.score_opts,
            )?);
        }

        Ok(Mcmc {
            model: setup.model,
            run_num: setup.run_num,
            n_chains: setup.n_chains,
            sample_interval: setup.sample_interval,
            checkpoint_interval: setup.checkpoint_interval,
            tunings: setup.tunings,
            score_opts: setup.score_opts,
            taxa,
            inputs,
            proposals,
            chains,
            swap_matrix: vec![vec![0; setup.n_chains]; setup.n_chains],
            splits: SplitTally::default(),
            gen_num: -1,
            do_heating_hack: setup.do_heating_hack,
            heating_hack_temperature: setup.heating_hack_temperature,
            polytomy_log_t,
            quiet: setup.quiet,
            out_dir: out_dir.to_path_buf(),
            rng,
        })
    }

    /// Loads the latest checkpoint of `run_num` in `dir` and makes the
    /// sampler ready to continue from it.
    pub fn resume(dir: &Path, run_num: usize, quiet: bool) -> Result<Mcmc> {
        let Some(path) = checkpoint::latest_for_run(dir, run_num)? else {
            bail!("no checkpoint files for run {run_num} in {}", dir.display());
        };
        let mut mcmc: Mcmc = checkpoint::load(&path)
            .with_context(|| format!("restoring from {}", path.display()))?;
        mcmc.taxa.rebuild_index();
        for chain in &mut mcmc.chains {
            chain.cur.tree.refresh();
            chain.prop.tree.refresh();
        }
        mcmc.out_dir = dir.to_path_buf();
        mcmc.quiet = quiet;
        Ok(mcmc)
    }

    pub fn cold_chain(&self) -> &Chain {
        self.chains
            .iter()
            .find(|c| c.temp_num == 0)
            .unwrap_or(&self.chains[0])
    }

    fn cold_chain_num(&self) -> usize {
        self.chains
            .iter()
            .position(|c| c.temp_num == 0)
            .unwrap_or(0)
    }

    fn move_settings(&self) -> MoveSettings {
        MoveSettings {
            beta_tuning: self.tunings.beta_slide,
            spa_q_tuning: self.tunings.spa_q_slide,
            spa_q_prior: match self.tunings.spa_q_prior {
                SpaQPriorKind::Flat => SpaQPrior::Flat,
                SpaQPriorKind::Exponential => SpaQPrior::Exponential {
                    lambda: self.tunings.spa_q_exp_prior_lambda,
                },
            },
            polytomy_prior: PolytomyPrior {
                log_big_c: self.tunings.polytomy_prior_log_big_c,
                resolution_class_log_counts: self.polytomy_log_t.clone(),
            },
        }
    }

    fn heat_for(&self, ch_num: usize) -> f64 {
        let mut heat = if self.n_chains > 1 {
            self.chains[ch_num].heat(self.tunings.chain_temp)
        } else {
            1.0
        };
        if self.do_heating_hack {
            heat *= 1.0 / (1.0 + self.heating_hack_temperature);
        }
        heat
    }

    /// Weighted draw from the schedule. NNI cannot edit a star tree, so
    /// when one comes up there the polytomy move substitutes if it is on
    /// the schedule. Kinds that already aborted this generation are
    /// skipped.
    fn choose_proposal(&mut self, ch_num: usize, skip: &HashSet<MoveKind>) -> Result<usize> {
        let total: f64 = self.proposals.iter().map(|p| p.weight).sum();
        let on_star = self.chains[ch_num].cur.tree.is_star();
        for _ in 0..1000 {
            let mut draw = self.rng.gen_range(0.0..1.0) * total;
            let mut idx = self.proposals.len() - 1;
            for (i, p) in self.proposals.iter().enumerate() {
                if draw < p.weight {
                    idx = i;
                    break;
                }
                draw -= p.weight;
            }
            let mut kind = self.proposals[idx].kind;
            if kind == MoveKind::Nni && on_star {
                match self.proposals.iter().position(|p| p.kind == MoveKind::Polytomy) {
                    Some(pi) => {
                        idx = pi;
                        kind = MoveKind::Polytomy;
                    }
                    None => continue,
                }
            }
            if skip.contains(&kind) {
                continue;
            }
            return Ok(idx);
        }
        bail!("could not find a usable move after 1000 draws; the schedule may be pathological");
    }

    /// One generation on one chain, retrying when a move aborts.
    fn chain_gen(&mut self, ch_num: usize, settings: &MoveSettings) -> Result<()> {
        let mut aborted: HashSet<MoveKind> = HashSet::new();
        for _ in 0..1000 {
            let idx = self.choose_proposal(ch_num, &aborted)?;
            let kind = self.proposals[idx].kind;
            let temp = self.chains[ch_num].temp_num;
            let heat = self.heat_for(ch_num);
            let outcome = self.chains[ch_num].step(
                kind,
                settings,
                self.model,
                &self.inputs,
                &self.score_opts,
                heat,
                &mut self.rng,
            )?;
            match outcome {
                GenOutcome::Aborted => {
                    self.proposals[idx].n_aborts[temp] += 1;
                    aborted.insert(kind);
                }
                GenOutcome::Accepted => {
                    self.proposals[idx].n_proposals[temp] += 1;
                    self.proposals[idx].n_acceptances[temp] += 1;
                    return Ok(());
                }
                GenOutcome::Rejected => {
                    self.proposals[idx].n_proposals[temp] += 1;
                    return Ok(());
                }
            }
        }
        bail!("no successful generation on chain {ch_num} after 1000 attempts")
    }

    /// A Metropolis-coupled state swap between two random chains. The
    /// upper triangle of the swap matrix counts tries, the lower triangle
    /// counts acceptances.
    fn try_swap(&mut self) {
        let n = self.n_chains;
        let a = self.rng.gen_range(0..n);
        let mut b = self.rng.gen_range(0..n - 1);
        if b >= a {
            b += 1;
        }
        let (ta, tb) = (self.chains[a].temp_num, self.chains[b].temp_num);
        self.swap_matrix[ta.min(tb)][ta.max(tb)] += 1;

        let heat = |t: usize| 1.0 / (1.0 + self.tunings.chain_temp * t as f64);
        let (la, lb) = (self.chains[a].cur.log_like, self.chains[b].cur.log_like);
        let ln_r = heat(ta) * lb + heat(tb) * la - heat(ta) * la - heat(tb) * lb;
        let r = if ln_r < -100.0 {
            0.0
        } else if ln_r >= 0.0 {
            1.0
        } else {
            ln_r.exp()
        };
        if self.rng.gen_range(0.0..1.0) < r {
            self.swap_matrix[ta.max(tb)][ta.min(tb)] += 1;
            self.chains[a].temp_num = tb;
            self.chains[b].temp_num = ta;
        }
    }

    fn zero_counters(&mut self) {
        for p in &mut self.proposals {
            p.zero();
        }
        self.swap_matrix = vec![vec![0; self.n_chains]; self.n_chains];
        self.splits.clear();
    }

    /// Runs `n_gens` generations, sampling and checkpointing on the way.
    pub fn run(&mut self, n_gens: u64) -> Result<()> {
        if let Some(cpi) = self.checkpoint_interval {
            ensure!(
                n_gens % cpi == 0,
                "with these settings the last generation would not land on a checkpoint: \
                 n_gens {n_gens} is not a multiple of the checkpoint interval {cpi}"
            );
            ensure!(
                cpi % self.sample_interval == 0,
                "the checkpoint interval {cpi} is not a multiple of the sample interval {}",
                self.sample_interval
            );
        }

        let traces = TraceFiles::new(&self.out_dir, self.run_num, self.model);
        if self.gen_num > -1 {
            // A restart mid trace file.
            traces.reopen_for_restart()?;
            log_if(
                !self.quiet,
                format!(
                    "Re-starting run {} from gen {}, {n_gens} more generations",
                    self.run_num, self.gen_num
                ),
            );
        } else {
            traces.start(&self.taxa)?;
            log_if(
                !self.quiet,
                format!(
                    "Starting run {} with {} chains, sampling every {}",
                    self.run_num, self.n_chains, self.sample_interval
                ),
            );
        }
        self.zero_counters();

        let settings = self.move_settings();
        let bar = progress::gen_bar(n_gens, &format!("run {}", self.run_num), self.quiet);

        for _ in 0..n_gens {
            self.gen_num += 1;
            for ch_num in 0..self.n_chains {
                self.chain_gen(ch_num, &settings)?;
            }
            if self.n_chains > 1 {
                self.try_swap();
            }

            let gen_plus_1 = (self.gen_num + 1) as u64;
            if gen_plus_1 % self.sample_interval == 0 {
                let cold = self.cold_chain_num();
                let state = &self.chains[cold].cur;
                let param = if self.model.is_rf() {
                    state.params.beta
                } else {
                    state.params.spa_q
                };
                traces.sample(gen_plus_1, state.log_like, &state.tree, param)?;
                self.splits.add(&state.tree);

                if self
                    .checkpoint_interval
                    .is_some_and(|cpi| gen_plus_1 % cpi == 0)
                {
                    let path = self
                        .out_dir
                        .join(checkpoint::file_name(self.run_num, gen_plus_1));
                    checkpoint::save(&path, self)?;
                    self.zero_counters();
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        traces.finish()?;
        Ok(())
    }

    /// Cycles of uniform proposing followed by tuning adjustments, after
    /// MrBayes. Slider windows are halved when their acceptance falls
    /// under 0.15 and doubled over 0.60; the chain temperature is nudged
    /// toward a 1-10% swap acceptance between the two coldest rungs.
    /// Leaves the chains in their tuned state and the generation counter
    /// at -1, so a following [`Mcmc::run`] starts fresh but warm.
    pub fn auto_tune(
        &mut self,
        gens_per_proposal: u64,
        give_up_after: usize,
        carry_on: bool,
    ) -> Result<()> {
        const SAFE_LOWER: f64 = 0.15;
        const SAFE_UPPER: f64 = 0.60;
        const AT_LEAST: u64 = 100;

        self.gen_num = -1;
        self.zero_counters();
        let n_gens = gens_per_proposal * self.proposals.len() as u64;
        let mut round = 0;

        loop {
            let settings = self.move_settings();
            let bar = progress::gen_bar(
                n_gens,
                &format!("tune round {round}"),
                self.quiet,
            );
            for _ in 0..n_gens {
                self.gen_num += 1;
                for ch_num in 0..self.n_chains {
                    // Uniform over the schedule so rare moves get sampled.
                    let mut idx;
                    let mut safety = 0;
                    loop {
                        idx = self.rng.gen_range(0..self.proposals.len());
                        let kind = self.proposals[idx].kind;
                        if !(kind == MoveKind::Nni && self.chains[ch_num].cur.tree.is_star()) {
                            break;
                        }
                        safety += 1;
                        if safety > 100 {
                            bail!(
                                "stuck on a star tree with no usable move after 100 tries"
                            );
                        }
                    }
                    let kind = self.proposals[idx].kind;
                    let temp = self.chains[ch_num].temp_num;
                    let heat = self.heat_for(ch_num);
                    let outcome = self.chains[ch_num].step(
                        kind,
                        &settings,
                        self.model,
                        &self.inputs,
                        &self.score_opts,
                        heat,
                        &mut self.rng,
                    )?;
                    match outcome {
                        GenOutcome::Aborted => self.proposals[idx].n_aborts[temp] += 1,
                        GenOutcome::Accepted => {
                            self.proposals[idx].n_proposals[temp] += 1;
                            self.proposals[idx].n_acceptances[temp] += 1;
                        }
                        GenOutcome::Rejected => self.proposals[idx].n_proposals[temp] += 1,
                    }
                }
                if self.n_chains > 1 {
                    self.try_swap();
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            for p in &self.proposals {
                if p.n_proposals[0] < AT_LEAST {
                    bail!(
                        "only {} samples of the {} move this round, want at least {AT_LEAST}; \
                         raise gens_per_proposal",
                        p.n_proposals[0],
                        p.kind.name()
                    );
                }
            }

            let mut needs_tuning = false;
            for i in 0..self.proposals.len() {
                let kind = self.proposals[i].kind;
                let tuning = match kind {
                    MoveKind::BetaSlide => &mut self.tunings.beta_slide,
                    MoveKind::SpaQSlide => &mut self.tunings.spa_q_slide,
                    _ => continue,
                };
                let accepted = self.proposals[i].acceptance();
                if accepted < SAFE_LOWER {
                    *tuning /= 2.0;
                    needs_tuning = true;
                    log_if(
                        !self.quiet,
                        format!(
                            "{} acceptance {:.3} too small, halving the window to {:.4}",
                            kind.name(),
                            accepted,
                            tuning
                        ),
                    );
                } else if accepted > SAFE_UPPER {
                    *tuning *= 2.0;
                    needs_tuning = true;
                    log_if(
                        !self.quiet,
                        format!(
                            "{} acceptance {:.3} too big, doubling the window to {:.4}",
                            kind.name(),
                            accepted,
                            tuning
                        ),
                    );
                }
            }

            if self.n_chains > 1 {
                let mut too_few = 0;
                for i in 0..self.n_chains - 1 {
                    for j in i + 1..self.n_chains {
                        if self.swap_matrix[i][j] < AT_LEAST {
                            too_few += 1;
                        }
                    }
                }
                if too_few > 0 {
                    bail!(
                        "{too_few} swap pairs saw fewer than {AT_LEAST} tries this round; \
                         the sample size is not big enough"
                    );
                }
                let accepted =
                    self.swap_matrix[1][0] as f64 / self.swap_matrix[0][1] as f64;
                if accepted > 0.1 {
                    self.tunings.chain_temp *= 1.3333;
                    needs_tuning = true;
                    log_if(
                        !self.quiet,
                        format!(
                            "swap acceptance {accepted:.3} too high, raising chain_temp to {:.3}",
                            self.tunings.chain_temp
                        ),
                    );
                } else if accepted < 0.01 {
                    let divisor = if accepted > 0.005 {
                        1.3333
                    } else if accepted > 0.001 {
                        2.0
                    } else {
                        3.0
                    };
                    self.tunings.chain_temp /= divisor;
                    needs_tuning = true;
                    log_if(
                        !self.quiet,
                        format!(
                            "swap acceptance {accepted:.3} too low, lowering chain_temp to {:.3}",
                            self.tunings.chain_temp
                        ),
                    );
                }
            }

            round += 1;
            if !needs_tuning {
                break;
            }
            if round >= give_up_after {
                if carry_on {
                    log_if(
                        !self.quiet,
                        format!(
                            "auto tuning still unsettled after {give_up_after} rounds, carrying on"
                        ),
                    );
                    break;
                }
                bail!(
                    "auto tuning went through {give_up_after} rounds and still needs tuning; \
                     tune by hand, or carry on regardless"
                );
            }
            self.zero_counters();
        }

        self.gen_num = -1;
        self.zero_counters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_tree::{load_input_trees, SupportMode};
    use rand::rngs::StdRng;

    fn five_taxon_inputs() -> (TaxonSet, Vec<InputTree>) {
        let newicks: Vec<String> = vec![
            "((A,B),(C,(D,E)));".into(),
            "((A,C),(B,(D,E)));".into(),
        ];
        let taxa = TaxonSet::from_leaf_name_lists(&[
            vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()],
        ])
        .unwrap();
        let inputs = load_input_trees(&newicks, &taxa, SupportMode::None, false).unwrap();
        (taxa, inputs)
    }

    fn quiet_setup(model: ModelKind) -> McmcSetup {
        let mut setup = McmcSetup::new(model);
        setup.quiet = true;
        setup.seed = Some(42);
        setup.check_output_files = false;
        setup
    }

    #[test]
    fn test_model_specific_schedule() {
        let spa = ProposalProbs::for_model(ModelKind::Spa);
        assert_eq!(spa.polytomy, 1.0);
        assert_eq!(spa.spr, 0.0);
        let rf = ProposalProbs::for_model(ModelKind::Sr2008RfIa);
        assert_eq!(rf.polytomy, 0.0);
        assert_eq!(rf.spr, 1.0);
    }

    #[test]
    fn test_schedule_respects_model() {
        let dir = tempfile::tempdir().unwrap();
        let (taxa, inputs) = five_taxon_inputs();
        let mcmc = Mcmc::new(taxa, inputs, dir.path(), quiet_setup(ModelKind::Spa)).unwrap();
        let kinds: Vec<MoveKind> = mcmc.proposals.iter().map(|p| p.kind).collect();
        assert!(kinds.contains(&MoveKind::Polytomy));
        assert!(kinds.contains(&MoveKind::SpaQSlide));
        assert!(!kinds.contains(&MoveKind::Spr));
        assert!(!kinds.contains(&MoveKind::BetaSlide));
    }

    #[test]
    fn test_counters_follow_temperature_after_swap() {
        let dir = tempfile::tempdir().unwrap();
        let (taxa, inputs) = five_taxon_inputs();
        let mut setup = quiet_setup(ModelKind::Spa);
        setup.n_chains = 2;
        let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), setup).unwrap();

        // Chain slot 0 is now the heated chain.
        mcmc.chains[0].temp_num = 1;
        mcmc.chains[1].temp_num = 0;

        let settings = mcmc.move_settings();
        for _ in 0..50 {
            mcmc.chain_gen(0, &settings).unwrap();
        }
        let row = |t: usize| -> u64 { mcmc.proposals.iter().map(|p| p.n_proposals[t]).sum() };
        assert_eq!(row(1), 50);
        assert_eq!(row(0), 0);
    }

    #[test]
    fn test_sr2008_rejects_polytomous_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let newicks: Vec<String> = vec!["(A,B,C,(D,E));".into()];
        let taxa = TaxonSet::from_leaf_name_lists(&[
            vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()],
        ])
        .unwrap();
        let inputs = load_input_trees(&newicks, &taxa, SupportMode::None, false).unwrap();
        let err = Mcmc::new(taxa, inputs, dir.path(), quiet_setup(ModelKind::Sr2008RfIa))
            .err()
            .unwrap();
        assert!(err.to_string().contains("fully bifurcating"));
    }

    #[test]
    fn test_run_refuses_misaligned_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let (taxa, inputs) = five_taxon_inputs();
        let mut setup = quiet_setup(ModelKind::Spa);
        setup.sample_interval = 3;
        setup.checkpoint_interval = Some(10); // not a multiple of 3
        let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), setup).unwrap();
        assert!(mcmc.run(10).is_err());
    }

    #[test]
    fn test_split_tally_frequencies() {
        let mut rng = StdRng::seed_from_u64(1);
        let tree = Tree::random_resolved(5, &mut rng);
        let mut tally = SplitTally::default();
        tally.add(&tree);
        tally.add(&tree);
        assert_eq!(tally.n_samples, 2);
        for (_, f) in tally.frequencies() {
            assert_eq!(f, 1.0);
        }
        tally.clear();
        assert_eq!(tally.n_samples, 0);
        assert!(tally.counts.is_empty());
    }

    #[test]
    fn test_heating_hack_wants_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (taxa, inputs) = five_taxon_inputs();
        let mut setup = quiet_setup(ModelKind::Spa);
        setup.do_heating_hack = true;
        setup.n_chains = 2;
        assert!(Mcmc::new(taxa, inputs, dir.path(), setup).is_err());
    }
}
