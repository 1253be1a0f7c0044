use std::path::{Path, PathBuf};

use envgrid_engine::{
    ApplyFailures, CreateEnvironmentRequest, EngineError, EnvStatusReport, Reconciler,
    ServiceUpdate,
};

use super::read_yaml;
use crate::OutputFormat;

pub struct CreateArgs {
    pub project: String,
    pub name: String,
    pub namespace: Option<String>,
    pub cluster: String,
    pub values: Option<PathBuf>,
    pub globals: Option<PathBuf>,
    pub services: Option<PathBuf>,
}

pub async fn create(reconciler: &Reconciler, args: CreateArgs) -> anyhow::Result<()> {
    let request = CreateEnvironmentRequest {
        project: args.project,
        name: args.name,
        namespace: args.namespace,
        cluster_id: args.cluster,
        default_values: args.values.map(std::fs::read_to_string).transpose()?,
        global_variables: args.globals.as_deref().map(read_yaml).transpose()?,
        services: match args.services.as_deref() {
            Some(path) => read_yaml(path)?,
            None => Vec::new(),
        },
    };

    let job = reconciler.create_environment(request).await?;
    println!("Creating {}...", job.key());
    let key = job.key().clone();
    let failures = job.wait().await?;
    report_failures(&failures);
    if failures.is_empty() {
        println!("✓ Created {key}");
        Ok(())
    } else {
        Err(EngineError::ServicesFailed(failures).into())
    }
}

/// Merge service names given on the command line with a YAML override file.
fn service_updates(names: Vec<String>, file: Option<&Path>) -> anyhow::Result<Vec<ServiceUpdate>> {
    let mut updates: Vec<ServiceUpdate> = match file {
        Some(path) => read_yaml(path)?,
        None => Vec::new(),
    };
    for name in names {
        if !updates.iter().any(|u| u.name == name) {
            updates.push(ServiceUpdate::new(name));
        }
    }
    if updates.is_empty() {
        anyhow::bail!("no services to update");
    }
    Ok(updates)
}

pub async fn update(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    names: Vec<String>,
    file: Option<&Path>,
    also: Vec<String>,
) -> anyhow::Result<()> {
    let updates = service_updates(names, file)?;

    if also.is_empty() {
        reconciler.update_services(project, env, updates).await?;
        println!("✓ Updated {project}/{env}");
        return Ok(());
    }

    let requests = std::iter::once(env.to_string())
        .chain(also)
        .map(|env| (env, updates.clone()))
        .collect();
    let report = reconciler.update_many(project, requests).await;
    for status in &report.reports {
        print_status(status);
    }
    for (env, error) in &report.errors {
        eprintln!("✗ {project}/{env}: {error}");
    }
    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("{} of the environments failed to update", report.errors.len())
    }
}

pub async fn remove(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    names: &[String],
) -> anyhow::Result<()> {
    reconciler.delete_services(project, env, names).await?;
    println!("✓ Removed {} from {project}/{env}", names.join(", "));
    Ok(())
}

pub async fn delete(reconciler: &Reconciler, project: &str, env: &str) -> anyhow::Result<()> {
    let failures = reconciler.delete_environment(project, env).await?.wait().await?;
    if failures.is_empty() {
        println!("✓ Deleted {project}/{env}");
        Ok(())
    } else {
        report_failures(&failures);
        anyhow::bail!("teardown of {project}/{env} incomplete; status is now unknown")
    }
}

pub async fn sleep(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    enable: bool,
) -> anyhow::Result<()> {
    reconciler.set_sleeping(project, env, enable).await?;
    let state = if enable { "asleep" } else { "awake" };
    println!("✓ {project}/{env} is {state}");
    Ok(())
}

pub fn status(
    reconciler: &Reconciler,
    project: &str,
    env: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = reconciler.status(project, env)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_status(&report),
    }
    Ok(())
}

pub fn list(reconciler: &Reconciler, project: &str, format: OutputFormat) -> anyhow::Result<()> {
    let headers = reconciler.list(project)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&headers)?),
        OutputFormat::Text => {
            for header in &headers {
                println!(
                    "{:<20} {:<10} rev {:<4} {}",
                    header.name,
                    header.status.to_string(),
                    header.revision,
                    header.namespace
                );
            }
        }
    }
    Ok(())
}

fn print_status(report: &EnvStatusReport) {
    println!(
        "{}/{}  {}  (revision {})",
        report.project, report.env, report.status, report.revision
    );
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
    for service in &report.services {
        let mark = match (&service.error, service.deployed) {
            (Some(_), _) => "✗",
            (None, true) => "✓",
            (None, false) => "-",
        };
        println!(
            "  {mark} [{}] {:<20} {:<14} r{:<4} {}",
            service.group,
            service.name,
            service.service_type.to_string(),
            service.revision,
            service.images.join(", ")
        );
        if let Some(error) = &service.error {
            println!("      {error}");
        }
    }
}

fn report_failures(failures: &ApplyFailures) {
    for (service, error) in failures.iter() {
        eprintln!("✗ {service}: {error}");
    }
}
