//! Gzipped-JSON checkpoints, written atomically at checkpoint intervals.
//!
//! A checkpoint file is named `mcmc_checkpoint_<run>.<gen+1>.json.gz`, so
//! a directory can hold the full history of a run and the latest one can
//! be found by the generation number in the name.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn file_name(run_num: usize, gen_plus_1: u64) -> String {
    format!("mcmc_checkpoint_{run_num}.{gen_plus_1}.json.gz")
}

fn prefix(run_num: usize) -> String {
    format!("mcmc_checkpoint_{run_num}.")
}

/// Serializes `value` to a gzipped JSON file, via a temporary file and a
/// rename so a crash cannot leave a half-written checkpoint behind.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let f = File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        let mut gz = GzEncoder::new(BufWriter::new(f), Compression::default());
        serde_json::to_writer(&mut gz, value)?;
        gz.finish()?.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming checkpoint into {}", path.display()))?;
    Ok(())
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let gz = GzDecoder::new(BufReader::new(f));
    let value = serde_json::from_reader(gz)
        .with_context(|| format!("decoding checkpoint {}", path.display()))?;
    Ok(value)
}

/// Whether any checkpoint for `run_num` exists in `dir`.
pub fn exists_for_run(dir: &Path, run_num: usize) -> bool {
    let pre = prefix(run_num);
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with(&pre))
        })
        .unwrap_or(false)
}

/// The checkpoint for `run_num` with the highest generation number.
pub fn latest_for_run(dir: &Path, run_num: usize) -> Result<Option<PathBuf>> {
    let pre = prefix(run_num);
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(&pre) else {
            continue;
        };
        let Some(gen_str) = rest.strip_suffix(".json.gz") else {
            continue;
        };
        let Ok(g) = gen_str.parse::<u64>() else {
            continue;
        };
        if best.as_ref().map_or(true, |(b, _)| g > *b) {
            best = Some((g, entry.path()));
        }
    }
    Ok(best.map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        xs: Vec<u64>,
        label: String,
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(file_name(0, 1000));
        let blob = Blob {
            xs: vec![1, 2, 3],
            label: "hello".into(),
        };
        save(&path, &blob).unwrap();
        let back: Blob = load(&path).unwrap();
        assert_eq!(back, blob);
        // No stray temporary left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_latest_picks_highest_generation() {
        let dir = tempfile::tempdir().unwrap();
        for g in [200u64, 1000, 600] {
            let path = dir.path().join(file_name(2, g));
            save(&path, &vec![g]).unwrap();
        }
        // A different run's file must not be picked up.
        save(&dir.path().join(file_name(3, 5000)), &vec![0u64]).unwrap();

        let latest = latest_for_run(dir.path(), 2).unwrap().unwrap();
        assert!(latest.ends_with(file_name(2, 1000)));
        assert!(exists_for_run(dir.path(), 2));
        assert!(!exists_for_run(dir.path(), 7));
    }
}
