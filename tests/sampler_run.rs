use std::fs;

use supertree_mcmc::input_tree::{load_input_trees, SupportMode};
use supertree_mcmc::likelihood::ModelKind;
use supertree_mcmc::mcmc::{Mcmc, McmcSetup};
use supertree_mcmc::taxa::TaxonSet;

fn digest(newicks: &[&str], support: SupportMode, quartets: bool) -> (TaxonSet, Vec<supertree_mcmc::InputTree>) {
    let newicks: Vec<String> = newicks.iter().map(|s| s.to_string()).collect();
    let lists = supertree_mcmc::input_tree::leaf_name_lists(&newicks).unwrap();
    let taxa = TaxonSet::from_leaf_name_lists(&lists).unwrap();
    let inputs = load_input_trees(&newicks, &taxa, support, quartets).unwrap();
    (taxa, inputs)
}

fn setup(model: ModelKind, seed: u64) -> McmcSetup {
    let mut setup = McmcSetup::new(model);
    setup.quiet = true;
    setup.seed = Some(seed);
    setup
}

#[test]
fn spa_run_writes_traces_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &["((A,B),(C,(D,E)));", "((A,C),(B,(D,E)));", "((A,B),(D,(C,E)));"],
        SupportMode::None,
        false,
    );
    let mut cfg = setup(ModelKind::Spa, 7);
    cfg.sample_interval = 50;
    cfg.checkpoint_interval = Some(500);
    let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), cfg).unwrap();
    mcmc.run(1000).unwrap();
    assert_eq!(mcmc.gen_num, 999);

    let likes = fs::read_to_string(dir.path().join("mcmc_likes_0")).unwrap();
    assert_eq!(likes.lines().count(), 20);
    for line in likes.lines() {
        let mut parts = line.split_whitespace();
        let g: u64 = parts.next().unwrap().parse().unwrap();
        assert_eq!(g % 50, 0);
        let ll: f64 = parts.next().unwrap().parse().unwrap();
        assert!(ll.is_finite() && ll < 0.0);
    }

    let trees = fs::read_to_string(dir.path().join("mcmc_trees_0.nex")).unwrap();
    assert!(trees.starts_with("#nexus\n"));
    assert!(trees.contains("dimensions ntax=5;"));
    assert!(trees.contains("tree t_50 = [&U] "));
    assert!(trees.contains("tree t_1000 = [&U] "));
    assert!(trees.trim_end().ends_with("end;"));

    let prams = fs::read_to_string(dir.path().join("mcmc_prams_0")).unwrap();
    assert!(prams.starts_with("    genPlus1     spaQ\n"));
    assert_eq!(prams.lines().count(), 21); // header plus 20 samples

    assert!(dir.path().join("mcmc_checkpoint_0.500.json.gz").exists());
    assert!(dir.path().join("mcmc_checkpoint_0.1000.json.gz").exists());
}

#[test]
fn resume_continues_the_trace_files() {
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &["((A,B),(C,(D,E)));", "((A,C),(B,(D,E)));"],
        SupportMode::None,
        false,
    );
    let mut cfg = setup(ModelKind::Spa, 11);
    cfg.sample_interval = 50;
    cfg.checkpoint_interval = Some(500);
    let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), cfg).unwrap();
    mcmc.run(1000).unwrap();
    drop(mcmc);

    let mut resumed = Mcmc::resume(dir.path(), 0, true).unwrap();
    assert_eq!(resumed.gen_num, 999);
    resumed.run(500).unwrap();
    assert_eq!(resumed.gen_num, 1499);

    let likes = fs::read_to_string(dir.path().join("mcmc_likes_0")).unwrap();
    assert_eq!(likes.lines().count(), 30);

    let trees = fs::read_to_string(dir.path().join("mcmc_trees_0.nex")).unwrap();
    assert!(trees.contains("tree t_1000"));
    assert!(trees.contains("tree t_1500"));
    // One end; for the taxa block, one for the trees block; the restart
    // must not have left a third in the middle.
    assert_eq!(trees.matches("end;").count(), 2);

    assert!(dir.path().join("mcmc_checkpoint_0.1500.json.gz").exists());
}

#[test]
fn fresh_run_refuses_to_clobber_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &["((A,B),(C,(D,E)));", "((A,C),(B,(D,E)));"],
        SupportMode::None,
        false,
    );
    let mut cfg = setup(ModelKind::Spa, 3);
    cfg.sample_interval = 10;
    cfg.checkpoint_interval = Some(100);
    let mut mcmc = Mcmc::new(taxa.clone(), inputs.clone(), dir.path(), cfg.clone()).unwrap();
    mcmc.run(100).unwrap();

    let err = Mcmc::new(taxa, inputs, dir.path(), cfg).err().unwrap();
    assert!(err.to_string().contains("checkpoint"));
}

#[test]
fn rf_run_with_cross_check_stays_consistent() {
    // The cross-check makes every likelihood evaluation compare the masked
    // RF path against the reduced-tree reference path and fail loudly on
    // any disagreement, so a clean run is a strong consistency test.
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &[
            "((A,B),((C,D),(E,F)));",
            "((A,C),((B,D),(E,F)));",
            "(((A,B),C),(D,(E,F)));",
        ],
        SupportMode::None,
        false,
    );
    let mut cfg = setup(ModelKind::Sr2008RfAz, 13);
    cfg.sample_interval = 50;
    cfg.score_opts.rf_cross_check = true;
    let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), cfg).unwrap();
    mcmc.run(500).unwrap();

    let likes = fs::read_to_string(dir.path().join("mcmc_likes_0")).unwrap();
    assert_eq!(likes.lines().count(), 10);
}

#[test]
fn rf_run_on_conflicting_quartets_visits_the_star_tree() {
    // ((A,B),(C,D)) against ((A,C),(B,D)): the star tree is one split away
    // from each input, as good as either resolved tree, so a chain with the
    // polytomy move on its schedule should sample it.
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &["((A,B),(C,D));", "((A,C),(B,D));"],
        SupportMode::None,
        false,
    );
    let mut cfg = setup(ModelKind::Sr2008RfIa, 23);
    cfg.sample_interval = 10;
    cfg.probs.polytomy = 1.0;
    let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), cfg).unwrap();
    mcmc.run(2000).unwrap();

    let trees = fs::read_to_string(dir.path().join("mcmc_trees_0.nex")).unwrap();
    let samples: Vec<&str> = trees
        .lines()
        .filter(|l| l.trim_start().starts_with("tree t_"))
        .collect();
    assert_eq!(samples.len(), 200);
    // The 4-taxon star newick has a single pair of parentheses.
    let star_samples = samples
        .iter()
        .filter(|l| l.matches('(').count() == 1)
        .count();
    assert!(
        star_samples > 0,
        "no star tree among {} samples",
        samples.len()
    );
}

#[test]
fn qpa_run_moves_over_resolution_classes() {
    let dir = tempfile::tempdir().unwrap();
    let (taxa, inputs) = digest(
        &["((A,B),(C,(D,E)));", "((A,B),(D,(C,E)));"],
        SupportMode::None,
        true,
    );
    let mut cfg = setup(ModelKind::Qpa, 17);
    cfg.sample_interval = 25;
    let mut mcmc = Mcmc::new(taxa, inputs, dir.path(), cfg).unwrap();
    mcmc.run(500).unwrap();

    let trees = fs::read_to_string(dir.path().join("mcmc_trees_0.nex")).unwrap();
    assert!(trees.contains("tree t_500"));
    let prams = fs::read_to_string(dir.path().join("mcmc_prams_0")).unwrap();
    for line in prams.lines().skip(1) {
        let q: f64 = line.split_whitespace().nth(1).unwrap().parse().unwrap();
        assert!(q > 0.0 && q <= 1.0);
    }
}
