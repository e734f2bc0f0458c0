use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold} {msg:.bold} [{elapsed_precise}] {bar:48.cyan/blue} {pos:>9}/{len:9} ETA {eta_precise}",
    )
    .unwrap()
    .progress_chars("█▇▆▅▄▃▂▁ ")
}

/// A generation counter on stderr; hidden entirely when `quiet` is set.
pub fn gen_bar(n_gens: u64, prefix: &str, quiet: bool) -> ProgressBar {
    let target = if quiet {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stderr_with_hz(15)
    };
    let pb = ProgressBar::with_draw_target(Some(n_gens), target);
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb.set_message("generations");
    pb
}
