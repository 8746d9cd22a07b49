//! Plan load/save with invariant validation.
//!
//! Saves are atomic (temp file + rename) so an interrupted write never leaves
//! a truncated plan behind.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::invariants::validate_plan;
use crate::plan::Plan;

/// Load a plan from YAML (JSON is accepted too) and check its invariants.
///
/// An empty document is an empty plan.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = parse_plan(&contents).with_context(|| format!("parse plan {}", path.display()))?;
    debug!(path = %path.display(), steps = plan.steps.len(), "plan loaded");
    Ok(plan)
}

pub fn parse_plan(contents: &str) -> Result<Plan> {
    if contents.trim().is_empty() {
        return Ok(Plan::default());
    }
    let plan: Plan = serde_yaml::from_str(contents)?;
    let errors = validate_plan(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    Ok(plan)
}

/// Serialize and atomically replace the plan file.
pub fn save_plan(path: &Path, plan: &Plan) -> Result<()> {
    let buf = serde_yaml::to_string(plan).context("serialize plan yaml")?;
    write_atomic(path, &buf)?;
    debug!(path = %path.display(), "plan saved");
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("plan path has no file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}
