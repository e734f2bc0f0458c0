use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

use supertree_mcmc::input_tree::{leaf_name_lists, load_input_trees, SupportMode};
use supertree_mcmc::likelihood::{ModelKind, ModelParams, ScoreOpts};
use supertree_mcmc::mcmc::{Mcmc, McmcSetup, SpaQPriorKind};
use supertree_mcmc::taxa::TaxonSet;

/// Sample supertrees by MCMC from a file of newick input trees, writing
/// log-likelihood, tree and parameter trace files plus periodic checkpoints.
#[derive(Parser, Debug)]
#[command(name = "supertree-mcmc", version, about = "MCMC supertree sampler over newick input trees")]
struct Args {
    /// Path to the input trees, newick, one per line
    #[arg(short = 'i', long = "input", required_unless_present = "resume")]
    input: Option<PathBuf>,

    /// Supertree model
    #[arg(short = 'm', long = "model", value_enum, default_value_t = ModelKind::Sr2008RfAz)]
    model: ModelKind,

    /// Generations to run
    #[arg(short = 'g', long = "gens", default_value_t = 100_000)]
    gens: u64,

    /// Run number; trace and checkpoint file names carry it
    #[arg(short = 'r', long = "run-num", default_value_t = 0)]
    run_num: usize,

    /// Continue the run from its latest checkpoint
    #[arg(long = "resume", default_value_t = false)]
    resume: bool,

    /// Write a sample every this many generations
    #[arg(long = "sample-interval", default_value_t = 100)]
    sample_interval: u64,

    /// Write a checkpoint every this many generations
    #[arg(long = "checkpoint-interval")]
    checkpoint_interval: Option<u64>,

    /// Number of Metropolis-coupled chains
    #[arg(short = 'c', long = "chains", default_value_t = 1)]
    chains: usize,

    /// Temperature step between chains
    #[arg(long = "chain-temp", default_value_t = 1.0)]
    chain_temp: f64,

    /// Starting beta for the SR2008 models
    #[arg(long = "beta", default_value_t = 1.0)]
    beta: f64,

    /// Starting spaQ for the SPA and QPA models
    #[arg(long = "spa-q", default_value_t = 0.5)]
    spa_q: f64,

    /// How to read internal node labels of the input trees
    #[arg(long = "support", value_enum, default_value_t = SupportArg::None)]
    support: SupportArg,

    /// Weight matched splits by their support values (SPA only)
    #[arg(long = "use-split-support", default_value_t = false)]
    use_split_support: bool,

    /// Put an exponential prior on spaQ instead of a flat one
    #[arg(long = "spa-q-exp-prior", default_value_t = false)]
    spa_q_exp_prior: bool,

    /// Lambda of the exponential spaQ prior
    #[arg(long = "spa-q-exp-prior-lambda", default_value_t = 100.0)]
    spa_q_exp_prior_lambda: f64,

    /// Use the resolution-class prior in the polytomy move
    #[arg(long = "resolution-class-prior", default_value_t = false)]
    resolution_class_prior: bool,

    /// Log of the per-edge polytomy prior constant C
    #[arg(long = "polytomy-prior-log-big-c", default_value_t = 0.0)]
    polytomy_prior_log_big_c: f64,

    /// Cross-check the masked RF path against the reduced-tree path
    #[arg(long = "rf-cross-check", default_value_t = false)]
    rf_cross_check: bool,

    /// Tune slider windows and the chain temperature before running
    #[arg(long = "autotune", default_value_t = false)]
    autotune: bool,

    /// Generations per schedule entry in each tuning round
    #[arg(long = "autotune-gens-per-proposal", default_value_t = 500)]
    autotune_gens_per_proposal: u64,

    /// Tuning rounds before giving up
    #[arg(long = "autotune-give-up-after", default_value_t = 10)]
    autotune_give_up_after: usize,

    /// Keep going with the best tunings found when tuning gives up
    #[arg(long = "autotune-carry-on", default_value_t = false)]
    autotune_carry_on: bool,

    /// Directory for trace and checkpoint files
    #[arg(short = 'o', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    /// RNG seed; fresh entropy when not given
    #[arg(long = "seed")]
    seed: Option<u64>,

    /// Quiet mode: suppresses progress messages on stdout
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SupportArg {
    None,
    Fractional,
    Percent,
}

impl From<SupportArg> for SupportMode {
    fn from(arg: SupportArg) -> SupportMode {
        match arg {
            SupportArg::None => SupportMode::None,
            SupportArg::Fractional => SupportMode::Fractional,
            SupportArg::Percent => SupportMode::Percent,
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut mcmc = if args.resume {
        match Mcmc::resume(&args.out_dir, args.run_num, args.quiet) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Failed to resume run {}: {e:#}", args.run_num);
                std::process::exit(2);
            }
        }
    } else {
        build_fresh(&args)
    };

    if args.autotune {
        let t0 = Instant::now();
        if let Err(e) = mcmc.auto_tune(
            args.autotune_gens_per_proposal,
            args.autotune_give_up_after,
            args.autotune_carry_on,
        ) {
            eprintln!("Auto tuning failed: {e:#}");
            std::process::exit(4);
        }
        log_if(!args.quiet, format!("Auto tuning {:.3}s", t0.elapsed().as_secs_f64()));
    }

    let t1 = Instant::now();
    if let Err(e) = mcmc.run(args.gens) {
        eprintln!("Run {} failed: {e:#}", args.run_num);
        std::process::exit(5);
    }
    log_if(
        !args.quiet,
        format!(
            "Finished {} generations in {:.3}s, cold chain log like {:.4}",
            args.gens,
            t1.elapsed().as_secs_f64(),
            mcmc.cold_chain().cur.log_like
        ),
    );
}

fn build_fresh(args: &Args) -> Mcmc {
    let Some(input) = args.input.as_ref() else {
        eprintln!("--input is required unless --resume is given.");
        std::process::exit(2);
    };

    let t0 = Instant::now();
    let newicks = match read_newick_lines(input) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Failed to read {:?}: {e:#}", input);
            std::process::exit(2);
        }
    };
    if newicks.is_empty() {
        eprintln!("No trees parsed from {:?}.", input);
        std::process::exit(2);
    }

    let built = leaf_name_lists(&newicks)
        .and_then(|lists| {
            let taxa = TaxonSet::from_leaf_name_lists(&lists)?;
            let want_quartets = args.model == ModelKind::Qpa;
            let inputs =
                load_input_trees(&newicks, &taxa, args.support.into(), want_quartets)?;
            Ok((taxa, inputs))
        });
    let (taxa, inputs) = match built {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to digest input trees: {e:#}");
            std::process::exit(3);
        }
    };
    log_if(
        !args.quiet,
        format!(
            "Read {} trees over {} taxa in {:.3}s",
            inputs.len(),
            taxa.len(),
            t0.elapsed().as_secs_f64()
        ),
    );

    let mut setup = McmcSetup::new(args.model);
    setup.run_num = args.run_num;
    setup.n_chains = args.chains;
    setup.sample_interval = args.sample_interval;
    setup.checkpoint_interval = args.checkpoint_interval;
    setup.tunings.chain_temp = args.chain_temp;
    setup.tunings.do_polytomy_resolution_class_prior = args.resolution_class_prior;
    setup.tunings.polytomy_prior_log_big_c = args.polytomy_prior_log_big_c;
    if args.spa_q_exp_prior {
        setup.tunings.spa_q_prior = SpaQPriorKind::Exponential;
        setup.tunings.spa_q_exp_prior_lambda = args.spa_q_exp_prior_lambda;
    }
    setup.score_opts = ScoreOpts {
        use_split_support: args.use_split_support,
        rf_cross_check: args.rf_cross_check,
    };
    setup.start_params = ModelParams {
        beta: args.beta,
        spa_q: args.spa_q,
    };
    setup.seed = args.seed;
    setup.quiet = args.quiet;

    match Mcmc::new(taxa, inputs, &args.out_dir, setup) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to set up the sampler: {e:#}");
            std::process::exit(3);
        }
    }
}

fn read_newick_lines(path: &PathBuf) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn log_if(show: bool, msg: String) {
    if show {
        println!("{}", msg);
    }
}
