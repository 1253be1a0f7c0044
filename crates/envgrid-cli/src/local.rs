//! Filesystem backends for running envgrid without a cluster.
//!
//! ```text
//! templates_dir/{project}.yaml                       project templates
//! charts_dir/{repo}/{name}-{version}/values.yaml     chart packages
//! output_dir/{cluster}/{namespace}/{service}.yaml    applied manifests
//! output_dir/{cluster}/{namespace}/releases/{release}.yaml   release values
//! ```
//!
//! Suspending a service rewrites `spec.replicas` of its workloads to zero in
//! the applied manifest; resuming writes the recorded counts back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use envgrid_core::{EnvgridConfig, Template};
use envgrid_engine::{
    ApplyTarget, ChartFetcher, ChartSource, Collaborators, HelmClient, HelmRelease,
    ResourceApplier, TemplateSource,
};
use envgrid_state::ChartRef;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "ReplicaSet"];

/// Reads `{project}.yaml` from the templates directory.
pub struct DirectoryTemplates {
    dir: PathBuf,
}

impl DirectoryTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TemplateSource for DirectoryTemplates {
    async fn load(&self, project: &str) -> anyhow::Result<Template> {
        let path = self.dir.join(format!("{project}.yaml"));
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading template {}", path.display()))?;
        let template = Template::from_yaml(&text)?;
        if template.project != project {
            anyhow::bail!(
                "template {} declares project {}, expected {project}",
                path.display(),
                template.project
            );
        }
        Ok(template)
    }
}

/// Writes manifests and release values below the output directory.
pub struct LocalCluster {
    output_dir: PathBuf,
}

impl LocalCluster {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn namespace_dir(&self, target: &ApplyTarget) -> PathBuf {
        self.output_dir
            .join(&target.cluster_id)
            .join(&target.namespace)
    }

    fn manifest_path(&self, target: &ApplyTarget) -> PathBuf {
        self.namespace_dir(target)
            .join(format!("{}.yaml", target.service))
    }

    fn release_path(&self, target: &ApplyTarget, release_name: &str) -> PathBuf {
        self.namespace_dir(target)
            .join("releases")
            .join(format!("{release_name}.yaml"))
    }

    async fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn remove(path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Rewrite workload replica counts, returning the counts found.
    async fn scale(
        &self,
        target: &ApplyTarget,
        replicas: impl Fn(&str) -> Option<u32>,
    ) -> anyhow::Result<BTreeMap<String, u32>> {
        let path = self.manifest_path(target);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(BTreeMap::new());
        }
        let text = tokio::fs::read_to_string(&path).await?;
        let (documents, previous) = scale_documents(&text, replicas)?;
        Self::write(&path, &documents).await?;
        Ok(previous)
    }
}

/// Apply `replicas` to every workload document of a multi-document
/// manifest. Returns the new text and the previous `kind/name → replicas`.
pub fn scale_documents(
    text: &str,
    replicas: impl Fn(&str) -> Option<u32>,
) -> anyhow::Result<(String, BTreeMap<String, u32>)> {
    let mut previous = BTreeMap::new();
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let mut value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value["kind"].as_str().unwrap_or_default().to_string();
        let name = value["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if WORKLOAD_KINDS.contains(&kind.as_str()) {
            let workload = format!("{kind}/{name}");
            let current = value["spec"]["replicas"].as_u64().unwrap_or(1) as u32;
            previous.insert(workload.clone(), current);
            if let Some(next) = replicas(&workload) {
                if let Some(spec) = value.get_mut("spec").and_then(Value::as_mapping_mut) {
                    spec.insert(Value::from("replicas"), Value::from(next));
                }
            }
        }
        documents.push(serde_yaml::to_string(&value)?);
    }
    Ok((documents.join("---\n"), previous))
}

#[async_trait]
impl ResourceApplier for LocalCluster {
    async fn apply(&self, target: &ApplyTarget, previous: &str, desired: &str) -> anyhow::Result<()> {
        let path = self.manifest_path(target);
        debug!(
            service = %target.service,
            path = %path.display(),
            changed = previous != desired,
            "writing manifest"
        );
        Self::write(&path, desired).await
    }

    async fn uninstall(&self, target: &ApplyTarget, _wait: bool) -> anyhow::Result<()> {
        Self::remove(&self.manifest_path(target)).await
    }

    async fn suspend(&self, target: &ApplyTarget) -> anyhow::Result<BTreeMap<String, u32>> {
        self.scale(target, |_| Some(0)).await
    }

    async fn resume(
        &self,
        target: &ApplyTarget,
        replicas: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        self.scale(target, |workload| replicas.get(workload).copied())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl HelmClient for LocalCluster {
    async fn install_or_upgrade(&self, release: &HelmRelease, is_retry: bool) -> anyhow::Result<()> {
        let chart = match &release.chart {
            ChartSource::Template { revision } => format!("template revision {revision}"),
            ChartSource::Remote(chart) => chart.to_string(),
        };
        let path = self.release_path(&release.target, &release.release_name);
        debug!(release = %release.release_name, %chart, is_retry, "writing release values");
        let contents = format!("# release: {}\n# chart: {chart}\n{}", release.release_name, release.values_yaml);
        Self::write(&path, &contents).await
    }

    async fn uninstall(&self, target: &ApplyTarget, release_name: &str) -> anyhow::Result<()> {
        Self::remove(&self.release_path(target, release_name)).await
    }
}

/// Reads chart packages unpacked below the charts directory.
pub struct DirectoryCharts {
    dir: PathBuf,
}

impl DirectoryCharts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ChartFetcher for DirectoryCharts {
    async fn fetch(&self, chart: &ChartRef) -> anyhow::Result<String> {
        let path = self
            .dir
            .join(&chart.repo)
            .join(format!("{}-{}", chart.name, chart.version))
            .join("values.yaml");
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("chart {chart} not found at {}", path.display()))
    }
}

/// Wire the filesystem backends from configuration.
pub fn collaborators(config: &EnvgridConfig) -> Collaborators {
    let cluster = Arc::new(LocalCluster::new(&config.cluster.output_dir));
    Collaborators {
        templates: Arc::new(DirectoryTemplates::new(&config.catalog.templates_dir)),
        applier: cluster.clone(),
        helm: cluster,
        charts: Arc::new(DirectoryCharts::new(&config.catalog.charts_dir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ApplyTarget {
        ApplyTarget {
            project: "shop".into(),
            env: "dev".into(),
            namespace: "shop-dev".into(),
            cluster_id: "local".into(),
            service: "web".into(),
        }
    }

    const MANIFEST: &str = "kind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n---\nkind: Service\nmetadata:\n  name: web\n";

    #[test]
    fn test_scale_documents_only_touches_workloads() {
        let (text, previous) = scale_documents(MANIFEST, |_| Some(0)).unwrap();
        assert_eq!(previous, BTreeMap::from([("Deployment/web".to_string(), 3)]));
        assert!(text.contains("replicas: 0"));
        assert!(text.contains("kind: Service"));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_round_trip_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new(dir.path());
        cluster.apply(&target(), "", MANIFEST).await.unwrap();

        let recorded = cluster.suspend(&target()).await.unwrap();
        assert_eq!(recorded["Deployment/web"], 3);
        let path = dir.path().join("local/shop-dev/web.yaml");
        assert!(std::fs::read_to_string(&path).unwrap().contains("replicas: 0"));

        cluster.resume(&target(), &recorded).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("replicas: 3"));

        ResourceApplier::uninstall(&cluster, &target(), true).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_suspend_without_manifest_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new(dir.path());
        assert!(cluster.suspend(&target()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_project_must_match_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shop.yaml"), "project: shop\ngroups: []\n").unwrap();
        std::fs::write(dir.path().join("blog.yaml"), "project: shop\n").unwrap();
        let templates = DirectoryTemplates::new(dir.path());

        assert_eq!(templates.load("shop").await.unwrap().project, "shop");
        assert!(templates.load("blog").await.is_err());
        assert!(templates.load("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_chart_values_are_read_from_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("bitnami/redis-17.0.0");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("values.yaml"), "architecture: standalone\n").unwrap();

        let charts = DirectoryCharts::new(dir.path());
        let chart = ChartRef {
            repo: "bitnami".into(),
            name: "redis".into(),
            version: "17.0.0".into(),
        };
        assert_eq!(charts.fetch(&chart).await.unwrap(), "architecture: standalone\n");
    }

    #[tokio::test]
    async fn test_reconciler_writes_through_local_backends() {
        use envgrid_engine::{CreateEnvironmentRequest, Reconciler};
        use envgrid_state::{EnvStatus, StateStore};

        let dir = tempfile::tempdir().unwrap();
        let mut config = EnvgridConfig::default();
        config.catalog.templates_dir = dir.path().join("templates");
        config.cluster.output_dir = dir.path().join("rendered");
        std::fs::create_dir_all(&config.catalog.templates_dir).unwrap();
        std::fs::write(
            config.catalog.templates_dir.join("shop.yaml"),
            "project: shop\ndefault_values: \"replica: 2\"\ngroups:\n  - - name: web\n      revision: 1\n      type: raw_manifest\n      manifest: |\n        kind: Deployment\n        metadata:\n          name: web\n        spec:\n          replicas: {{.replica}}\n",
        )
        .unwrap();

        let store = StateStore::open_in_memory().unwrap();
        let reconciler = Reconciler::from_config(store, collaborators(&config), &config);
        let request = CreateEnvironmentRequest {
            project: "shop".into(),
            name: "dev".into(),
            cluster_id: "local".into(),
            ..CreateEnvironmentRequest::default()
        };
        let failures = reconciler
            .create_environment(request)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(failures.is_empty(), "{failures}");

        let manifest = dir.path().join("rendered/local/shop-dev/web.yaml");
        assert!(std::fs::read_to_string(manifest).unwrap().contains("replicas: 2"));

        reconciler.set_sleeping("shop", "dev", true).await.unwrap();
        let status = reconciler.status("shop", "dev").unwrap();
        assert_eq!(status.status, EnvStatus::Sleeping);
    }
}
