//! Trace files for a run: log likelihoods, sampled trees and model
//! parameters, appended at each sample interval.
//!
//! The tree file is NEXUS with a translate table; taxa are written as
//! their 1-based translation numbers. On a restart the closing `end;` is
//! cut off the tree file so sampling can continue in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::likelihood::ModelKind;
use crate::taxa::TaxonSet;
use crate::tree::Tree;

/// Quotes a NEXUS token when it needs it.
fn nexus_name(name: &str) -> String {
    let needs_quotes = name
        .chars()
        .any(|c| c.is_whitespace() || "()[]{}/\\,;:=*'\"`+<>-".contains(c));
    if needs_quotes {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

/// Paths and append handles for one run's trace files.
#[derive(Debug)]
pub struct TraceFiles {
    pub likes_path: PathBuf,
    pub trees_path: PathBuf,
    pub prams_path: PathBuf,
    write_prams: bool,
    param_name: &'static str,
}

impl TraceFiles {
    pub fn new(dir: &Path, run_num: usize, model: ModelKind) -> TraceFiles {
        TraceFiles {
            likes_path: dir.join(format!("mcmc_likes_{run_num}")),
            trees_path: dir.join(format!("mcmc_trees_{run_num}.nex")),
            prams_path: dir.join(format!("mcmc_prams_{run_num}")),
            write_prams: model.writes_params(),
            param_name: model.param_name(),
        }
    }

    /// Writes the NEXUS taxa block and translate table, and the prams
    /// header when the model has a free parameter. Truncates any previous
    /// content, so this runs once per fresh run.
    pub fn start(&self, taxa: &TaxonSet) -> Result<()> {
        let mut f = File::create(&self.trees_path)
            .with_context(|| format!("creating {}", self.trees_path.display()))?;
        writeln!(f, "#nexus\n")?;
        writeln!(f, "begin taxa;")?;
        writeln!(f, "  dimensions ntax={};", taxa.len())?;
        write!(f, "  taxlabels")?;
        for name in taxa.names() {
            write!(f, " {}", nexus_name(name))?;
        }
        writeln!(f, ";\nend;\n")?;
        writeln!(f, "begin trees;")?;
        writeln!(f, "  translate")?;
        for (i, name) in taxa.names().iter().enumerate() {
            let sep = if i + 1 == taxa.len() { "" } else { "," };
            writeln!(f, "    {:3} {}{}", i + 1, nexus_name(name), sep)?;
        }
        writeln!(f, "  ;")?;
        writeln!(f, "  [Tree numbers are gen+1]")?;

        File::create(&self.likes_path)?;
        if self.write_prams {
            let mut f = File::create(&self.prams_path)?;
            writeln!(f, "    genPlus1     {}", self.param_name)?;
        }
        Ok(())
    }

    /// Appends one sample row to each trace file. Taxa are written as
    /// their 1-based translation numbers, which coincide with the sorted
    /// taxon indices.
    pub fn sample(&self, gen_plus_1: u64, log_like: f64, tree: &Tree, param: f64) -> Result<()> {
        let mut likes = OpenOptions::new().append(true).open(&self.likes_path)?;
        writeln!(likes, "{gen_plus_1:11} {log_like:.6}")?;

        let mut trees = OpenOptions::new().append(true).open(&self.trees_path)?;
        let newick = tree.to_newick(&|tx| (tx + 1).to_string());
        writeln!(trees, "  tree t_{gen_plus_1} = [&U] {newick}")?;

        if self.write_prams {
            let mut prams = OpenOptions::new().append(true).open(&self.prams_path)?;
            writeln!(prams, "{gen_plus_1:12}  {param:.6}")?;
        }
        Ok(())
    }

    /// Closes the trees block at the end of a run.
    pub fn finish(&self) -> Result<()> {
        let mut trees = OpenOptions::new().append(true).open(&self.trees_path)?;
        write!(trees, "end;\n\n")?;
        Ok(())
    }

    /// Removes the trailing `end;` from the tree file so a restarted run
    /// can keep appending tree rows.
    pub fn reopen_for_restart(&self) -> Result<()> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.trees_path)
            .with_context(|| format!("reopening {}", self.trees_path.display()))?;
        let len = f.metadata()?.len();
        let tail_len = len.min(64);
        f.seek(SeekFrom::End(-(tail_len as i64)))?;
        let mut tail = String::new();
        f.read_to_string(&mut tail)?;
        let Some(at) = tail.rfind("end;") else {
            bail!(
                "no closing 'end;' found in {}; is it a finished trace file?",
                self.trees_path.display()
            );
        };
        f.set_len(len - tail_len + at as u64)?;
        Ok(())
    }
}
