use std::path::Path;

use anyhow::Context;
use envgrid_engine::Reconciler;
use envgrid_state::GlobalVariable;

use super::read_yaml;

pub async fn globals(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    file: &Path,
    expected_revision: Option<u64>,
    preview: bool,
) -> anyhow::Result<()> {
    let variables: Vec<GlobalVariable> = read_yaml(file)?;

    if preview {
        let diffs = reconciler
            .preview_global_variables(project, env, variables)
            .await?;
        if diffs.is_empty() {
            println!("No services subscribe to the changed variables");
        }
        for diff in &diffs {
            println!("── {} ──", diff.service);
            if let Some(error) = &diff.error {
                println!("✗ {error}");
            }
            println!("current:\n{}", diff.current);
            println!("latest:\n{}", diff.latest);
        }
        return Ok(());
    }

    reconciler
        .update_global_variables(project, env, variables, expected_revision)
        .await?;
    println!("✓ Global variables of {project}/{env} updated");
    Ok(())
}

pub async fn defaults(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    file: &Path,
    preview: bool,
) -> anyhow::Result<()> {
    let values = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    if preview {
        let affected = reconciler.preview_default_values(project, env, &values)?;
        if affected.is_empty() {
            println!("No services affected");
        } else {
            println!("Services that may change: {}", affected.join(", "));
        }
        return Ok(());
    }

    reconciler.update_default_values(project, env, &values).await?;
    println!("✓ Default values of {project}/{env} updated");
    Ok(())
}

pub async fn candidates(reconciler: &Reconciler, project: &str, env: &str) -> anyhow::Result<()> {
    let candidates = reconciler.global_variable_candidates(project, env).await?;
    for variable in &candidates {
        println!("{} = {}", variable.key, serde_json::to_string(&variable.value)?);
    }
    Ok(())
}
