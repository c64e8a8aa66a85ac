//! Rubric loading and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use flowbench_types::rubric::Rubric;

use super::scoring::ScoringError;

/// Errors loading a rubric file.
#[derive(Debug, thiserror::Error)]
pub enum RubricError {
    #[error("malformed rubric {path}: {message}")]
    Malformed { path: String, message: String },

    #[error(transparent)]
    Invalid(#[from] ScoringError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Check the structural rules every rubric must satisfy: at least one
/// dimension, unique dimension names, non-negative finite weights, and a
/// positive total weight.
pub fn validate_rubric(rubric: &Rubric) -> Result<(), ScoringError> {
    let invalid = |reason: String| ScoringError::InvalidRubric {
        rubric: rubric.id.clone(),
        reason,
    };

    if rubric.dimensions.is_empty() {
        return Err(invalid("rubric has no dimensions".to_string()));
    }
    let mut names = HashSet::new();
    let mut total = 0.0;
    for dim in &rubric.dimensions {
        if !names.insert(dim.name.as_str()) {
            return Err(invalid(format!("duplicate dimension '{}'", dim.name)));
        }
        if !dim.weight.is_finite() || dim.weight < 0.0 {
            return Err(invalid(format!(
                "dimension '{}' has invalid weight {}",
                dim.name, dim.weight
            )));
        }
        total += dim.weight;
    }
    if total <= 0.0 {
        return Err(invalid("total weight is zero".to_string()));
    }
    Ok(())
}

/// Parse and validate a rubric from YAML.
pub fn parse_rubric_yaml(yaml: &str, origin: &str) -> Result<Rubric, RubricError> {
    let rubric: Rubric = serde_yaml_ng::from_str(yaml).map_err(|e| RubricError::Malformed {
        path: origin.to_string(),
        message: e.to_string(),
    })?;
    validate_rubric(&rubric)?;
    Ok(rubric)
}

pub fn load_rubric_file(path: &Path) -> Result<Rubric, RubricError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_rubric_yaml(&yaml, &path.display().to_string())
}

/// Load rubrics from files and directories. Directories contribute every
/// `.yaml`/`.yml` file directly inside them, sorted by path.
pub fn load_rubrics(paths: &[PathBuf]) -> Result<Vec<Rubric>, RubricError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }
    files.iter().map(|f| load_rubric_file(f)).collect()
}
