//! Collaborator contracts consumed by the engine.
//!
//! The engine never talks to a cluster, a chart repository or the template
//! catalog directly; it calls these traits. Errors are opaque
//! (`anyhow::Error`) and wrapped into typed engine errors at the call site.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use envgrid_core::Template;
use envgrid_state::ChartRef;

/// Where a service lives: environment identity plus the service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTarget {
    pub project: String,
    pub env: String,
    pub namespace: String,
    pub cluster_id: String,
    pub service: String,
}

/// A Helm install/upgrade request with its fully merged values.
#[derive(Debug, Clone, PartialEq)]
pub struct HelmRelease {
    pub target: ApplyTarget,
    pub release_name: String,
    pub chart: ChartSource,
    pub values_yaml: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChartSource {
    /// Chart authored in the template at the given revision.
    Template { revision: u64 },
    /// Chart downloaded from a remote repository.
    Remote(ChartRef),
}

/// Read-only access to the service catalog.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// The current (maximum revision) template of a project.
    async fn load(&self, project: &str) -> anyhow::Result<Template>;
}

/// Applies rendered manifests to a cluster.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Create missing resources, patch changed ones and delete resources
    /// present in `previous` but absent from `desired`. `previous` is empty
    /// on first deploy.
    async fn apply(&self, target: &ApplyTarget, previous: &str, desired: &str)
    -> anyhow::Result<()>;

    /// Remove everything labelled with the service, optionally blocking
    /// until removal completes.
    async fn uninstall(&self, target: &ApplyTarget, wait: bool) -> anyhow::Result<()>;

    /// Scale the service's workloads to zero, returning workload → replicas
    /// as they were before.
    async fn suspend(&self, target: &ApplyTarget) -> anyhow::Result<BTreeMap<String, u32>>;

    /// Restore replica counts recorded by [`suspend`](Self::suspend).
    async fn resume(
        &self,
        target: &ApplyTarget,
        replicas: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()>;
}

/// Installs, upgrades and uninstalls Helm releases.
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn install_or_upgrade(&self, release: &HelmRelease, is_retry: bool)
    -> anyhow::Result<()>;

    async fn uninstall(&self, target: &ApplyTarget, release_name: &str) -> anyhow::Result<()>;
}

/// Downloads charts from remote repositories.
#[async_trait]
pub trait ChartFetcher: Send + Sync {
    /// Fetch a chart and return its default `values.yaml`.
    async fn fetch(&self, chart: &ChartRef) -> anyhow::Result<String>;
}

/// The full set of collaborators an engine instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub templates: Arc<dyn TemplateSource>,
    pub applier: Arc<dyn ResourceApplier>,
    pub helm: Arc<dyn HelmClient>,
    pub charts: Arc<dyn ChartFetcher>,
}
