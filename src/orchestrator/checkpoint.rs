//! Checkpoint discovery and stale-state cleanup.
//!
//! The trainer writes snapshots as `<root>/<prefix><step>` directories. Before
//! every launch the supervisor picks the newest one (by version order, so
//! `checkpoint-10` beats `checkpoint-2`) and deletes the optimizer, scheduler
//! and RNG state files that the checkpoint library fails to reload.
//!
//! This module never touches anything outside the selected directory, and
//! never removes subdirectories.

use crate::error::{CheckpointError, ConfigError};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

/// Compiled set of shell globs naming stale state files.
///
/// Patterns match against the bare file name (`*`, `?`, `[...]`, `{a,b}`).
#[derive(Debug, Clone)]
pub struct StalePatterns {
    raw: Vec<String>,
    set: GlobSet,
}

impl StalePatterns {
    pub fn compile(patterns: &[String]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            if pattern.is_empty() {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: "pattern cannot be empty".to_string(),
                });
            }
            if pattern.contains('/') {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: "pattern must name a file, not a path".to_string(),
                });
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| invalid_pattern(pattern, e))?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ConfigError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(StalePatterns {
            raw: patterns.to_vec(),
            set,
        })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.set.is_match(file_name)
    }

    pub fn patterns(&self) -> &[String] {
        &self.raw
    }
}

fn invalid_pattern(pattern: &str, err: globset::Error) -> ConfigError {
    ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.kind().to_string(),
    }
}

/// Compare two names the way `sort -V` does: runs of digits compare
/// numerically, everything else byte-wise.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chunks = chunks(a);
    let mut b_chunks = chunks(b);

    loop {
        match (a_chunks.next(), b_chunks.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (is_digits(x), is_digits(y)) {
                    (true, true) => cmp_numeric(x, y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Numeric comparison of digit strings of any length.
fn cmp_numeric(x: &str, y: &str) -> Ordering {
    let x = x.trim_start_matches('0');
    let y = y.trim_start_matches('0');
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

/// Split into alternating digit / non-digit runs.
fn chunks(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let digit = rest.as_bytes()[0].is_ascii_digit();
        let end = rest
            .bytes()
            .position(|b| b.is_ascii_digit() != digit)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}

/// Step number of a `<prefix><digits>` directory name.
fn checkpoint_step<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix).filter(|step| is_digits(step))
}

/// Newest `<prefix><digits>` checkpoint directory under `root`.
///
/// A missing root is not an error: training may not have saved anything yet.
pub fn find_latest_checkpoint(root: &Path, prefix: &str) -> Result<Option<PathBuf>, CheckpointError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::ReadRoot {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let latest = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            checkpoint_step(&name, prefix)?;
            Some((name, e.path()))
        })
        .max_by(|(a, _), (b, _)| version_cmp(a, b))
        .map(|(_, path)| path);

    Ok(latest)
}

/// Delete files in `dir` whose names match `patterns`.
///
/// Only regular files and symlinks directly inside `dir` are considered.
/// Returns the removed paths in name order.
pub fn remove_stale_state(dir: &Path, patterns: &StalePatterns) -> Result<Vec<PathBuf>, CheckpointError> {
    let entries = fs::read_dir(dir).map_err(|source| CheckpointError::ReadRoot {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut targets: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name().to_str().map_or(false, |n| patterns.matches(n)))
        .map(|e| e.path())
        .collect();
    targets.sort();

    let mut removed = Vec::with_capacity(targets.len());
    for path in targets {
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            // Someone else got there first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CheckpointError::RemoveFailed { path, source }),
        }
    }

    Ok(removed)
}

/// Result of the pre-launch checkpoint pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub checkpoint: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Locate the newest checkpoint and scrub its stale state.
pub fn prepare_latest_checkpoint(
    root: &Path,
    prefix: &str,
    patterns: &StalePatterns,
) -> Result<CleanupReport, CheckpointError> {
    let Some(checkpoint) = find_latest_checkpoint(root, prefix)? else {
        return Ok(CleanupReport::default());
    };

    let removed = remove_stale_state(&checkpoint, patterns)?;
    Ok(CleanupReport {
        checkpoint: Some(checkpoint),
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn default_patterns() -> StalePatterns {
        StalePatterns::compile(&[
            "rng_state*".to_string(),
            "optimizer.*".to_string(),
            "scheduler.*".to_string(),
        ])
        .unwrap()
    }

    fn touch(path: &Path) {
        fs::write(path, b"x").expect("Failed to create fixture file");
    }

    #[test]
    fn test_version_cmp_numeric_runs() {
        assert_eq!(version_cmp("checkpoint-10", "checkpoint-2"), Ordering::Greater);
        assert_eq!(version_cmp("checkpoint-2", "checkpoint-10"), Ordering::Less);
        assert_eq!(version_cmp("checkpoint-500", "checkpoint-500"), Ordering::Equal);
        assert_eq!(version_cmp("v1.10.0", "v1.9.3"), Ordering::Greater);
    }

    #[test]
    fn test_version_cmp_huge_numbers() {
        assert_eq!(
            version_cmp("checkpoint-100000000000000000000000", "checkpoint-99"),
            Ordering::Greater
        );
    }

    #[test]
    fn test_glob_patterns() {
        let patterns = default_patterns();
        assert!(patterns.matches("rng_state.pth"));
        assert!(patterns.matches("rng_state_3.pth"));
        assert!(patterns.matches("optimizer.pt"));
        assert!(patterns.matches("scheduler.pt"));
        assert!(!patterns.matches("optimizer"));
        assert!(!patterns.matches("model.safetensors"));
        assert!(!patterns.matches("my_optimizer.pt"));
        assert!(!patterns.matches("trainer_state.json"));
    }

    #[test]
    fn test_glob_character_classes() {
        let patterns = StalePatterns::compile(&["rng_state_[0-9].pth".to_string()]).unwrap();
        assert!(patterns.matches("rng_state_3.pth"));
        assert!(!patterns.matches("rng_state_x.pth"));
        assert!(!patterns.matches("rng_state_[0-9].pth"));
    }

    #[test]
    fn test_glob_alternation() {
        let patterns = StalePatterns::compile(&["{optimizer,scheduler}.pt".to_string()]).unwrap();
        assert!(patterns.matches("optimizer.pt"));
        assert!(patterns.matches("scheduler.pt"));
        assert!(!patterns.matches("trainer.pt"));
    }

    #[test]
    fn test_compile_rejects_bad_patterns() {
        assert!(StalePatterns::compile(&["".to_string()]).is_err());
        assert!(StalePatterns::compile(&["../optimizer.pt".to_string()]).is_err());
        assert!(matches!(
            StalePatterns::compile(&["rng_state_[0-9.pth".to_string()]),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_find_latest_is_numeric_not_lexical() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint-2")).unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint-10")).unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint-9")).unwrap();

        let latest = find_latest_checkpoint(temp_dir.path(), "checkpoint-").unwrap();
        assert_eq!(latest, Some(temp_dir.path().join("checkpoint-10")));
    }

    #[test]
    fn test_find_latest_ignores_files_and_other_prefixes() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint-3")).unwrap();
        fs::create_dir(temp_dir.path().join("runs-99")).unwrap();
        touch(&temp_dir.path().join("checkpoint-50"));

        let latest = find_latest_checkpoint(temp_dir.path(), "checkpoint-").unwrap();
        assert_eq!(latest, Some(temp_dir.path().join("checkpoint-3")));
    }

    #[test]
    fn test_find_latest_requires_numeric_suffix() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["checkpoint-10", "checkpoint-tmp", "checkpoint-", "checkpoint-11-partial"] {
            fs::create_dir(temp_dir.path().join(name)).unwrap();
        }

        let latest = find_latest_checkpoint(temp_dir.path(), "checkpoint-").unwrap();
        assert_eq!(latest, Some(temp_dir.path().join("checkpoint-10")));
    }

    #[test]
    fn test_find_latest_empty_and_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(find_latest_checkpoint(temp_dir.path(), "checkpoint-").unwrap(), None);
        assert_eq!(
            find_latest_checkpoint(&temp_dir.path().join("nope"), "checkpoint-").unwrap(),
            None
        );
    }

    #[test]
    fn test_remove_stale_state_only_touches_matches() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        for name in [
            "rng_state.pth",
            "rng_state_1.pth",
            "optimizer.pt",
            "scheduler.pt",
            "model.safetensors",
            "trainer_state.json",
            "config.json",
        ] {
            touch(&dir.join(name));
        }
        fs::create_dir(dir.join("optimizer.shards")).unwrap();

        let removed = remove_stale_state(dir, &default_patterns()).unwrap();
        let removed_names: Vec<_> = removed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            removed_names,
            vec!["optimizer.pt", "rng_state.pth", "rng_state_1.pth", "scheduler.pt"]
        );

        assert!(dir.join("model.safetensors").exists());
        assert!(dir.join("trainer_state.json").exists());
        assert!(dir.join("config.json").exists());
        assert!(dir.join("optimizer.shards").is_dir());
    }

    #[test]
    fn test_prepare_latest_checkpoint_cleans_only_newest() {
        let temp_dir = TempDir::new().unwrap();
        let older = temp_dir.path().join("checkpoint-2");
        let newer = temp_dir.path().join("checkpoint-10");
        fs::create_dir(&older).unwrap();
        fs::create_dir(&newer).unwrap();
        touch(&older.join("optimizer.pt"));
        touch(&newer.join("optimizer.pt"));

        let report =
            prepare_latest_checkpoint(temp_dir.path(), "checkpoint-", &default_patterns()).unwrap();
        assert_eq!(report.checkpoint, Some(newer.clone()));
        assert_eq!(report.removed, vec![newer.join("optimizer.pt")]);
        assert!(older.join("optimizer.pt").exists());
    }

    #[test]
    fn test_prepare_without_checkpoints_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let report =
            prepare_latest_checkpoint(temp_dir.path(), "checkpoint-", &default_patterns()).unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
