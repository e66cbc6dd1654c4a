//! Loading model solutions from file-based storage.
//!
//! Two on-disk shapes are supported: a directory of
//! `{instance_id}.patch` / `{instance_id}.diff` files, or a single JSON
//! map `{instance_id: diff_text}`. A `.patch` file wins over a `.diff`
//! with the same stem.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

/// Loads solutions keyed by instance id.
pub struct SolutionLoader;

impl SolutionLoader {
    /// Load `*.patch` and `*.diff` files from a directory.
    pub fn load_from_directory(solution_dir: &Path) -> HashMap<String, String> {
        let mut solutions = HashMap::new();
        if !solution_dir.exists() {
            return solutions;
        }

        let Ok(entries) = std::fs::read_dir(solution_dir) else {
            return solutions;
        };

        let mut diffs: Vec<(String, std::path::PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match path.extension().and_then(|e| e.to_str()) {
                Some("patch") => match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        solutions.insert(stem.to_string(), content);
                    }
                    Err(e) => warn!(task = stem, "failed to load solution: {e}"),
                },
                Some("diff") => diffs.push((stem.to_string(), path)),
                _ => {}
            }
        }

        // .diff files never override a .patch with the same stem.
        for (stem, path) in diffs {
            if solutions.contains_key(&stem) {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    solutions.insert(stem, content);
                }
                Err(e) => warn!(task = %stem, "failed to load solution: {e}"),
            }
        }

        solutions
    }

    /// Load a JSON map `{instance_id: diff_text}`.
    pub fn load_from_json(solution_file: &Path) -> HashMap<String, String> {
        let Ok(raw) = std::fs::read_to_string(solution_file) else {
            return HashMap::new();
        };

        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!(file = %solution_file.display(), "invalid solution file: {e}");
                HashMap::new()
            }
        }
    }

    /// Load from a path that may be either shape. `None` yields an empty
    /// map: every task is then tested without modification.
    pub fn load_solutions(solution_path: Option<&Path>) -> HashMap<String, String> {
        let Some(path) = solution_path else {
            return HashMap::new();
        };

        if path.is_file() {
            Self::load_from_json(path)
        } else if path.is_dir() {
            Self::load_from_directory(path)
        } else {
            warn!(path = %path.display(), "solution path does not exist");
            HashMap::new()
        }
    }
}
