//! Domain types for the envgrid state store.
//!
//! These types represent the persisted state of environments: the header
//! document, the ordered service groups and their service instances, global
//! variables and the deploy strategy map. All types are serializable to/from
//! JSON for storage in redb tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use envgrid_values::{ImageSearchPattern, KeyValue, ValuesResult};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

// ── Identity ──────────────────────────────────────────────────────

/// Identifies an environment: exactly one exists per (project, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub project: String,
    pub name: String,
}

impl EnvironmentKey {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Composite table key `{project}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }

    /// Reject empty parts and the separators the table keys are built from.
    pub fn validate(&self) -> Result<(), String> {
        for (what, part) in [("project", &self.project), ("environment name", &self.name)] {
            if part.trim().is_empty() {
                return Err(format!("{what} is required"));
            }
            if let Some(c) = part.chars().find(|c| RESERVED_KEY_CHARS.contains(c)) {
                return Err(format!("{what} {part:?} must not contain {c:?}"));
            }
        }
        Ok(())
    }
}

/// Separators of the table key layout (`{project}/{name}#{group}`).
pub const RESERVED_KEY_CHARS: [char; 2] = ['/', '#'];

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Lifecycle status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Creating,
    Updating,
    Running,
    Failed,
    Deleting,
    Sleeping,
    Unknown,
}

impl EnvStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Unknown` is where a failed teardown leaves an environment; it may be
    /// updated or deleted again.
    pub fn can_transition_to(self, next: EnvStatus) -> bool {
        use EnvStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Failed)
                | (Running | Failed | Sleeping | Unknown, Updating)
                | (Updating, Running)
                | (Updating, Failed)
                | (Running | Failed | Unknown, Deleting)
                | (Deleting, Unknown)
                | (Running, Sleeping)
                | (Sleeping, Running)
        )
    }
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Sleeping => "sleeping",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Whether a service is meant to be live in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    /// Rendered and applied to the cluster.
    #[default]
    Deploy,
    /// Tracked in the environment only; never applied.
    Import,
}

// ── Services ──────────────────────────────────────────────────────

/// Coordinates of a chart in a remote chart repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub repo: String,
    pub name: String,
    pub version: String,
}

impl fmt::Display for ChartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.repo, self.name, self.version)
    }
}

/// How a service is deployed. Each variant carries only what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    /// Raw Kubernetes manifests rendered from the template.
    RawManifest {
        /// Unrendered manifest text at the deployed revision.
        #[serde(default)]
        template: String,
        /// Manifest text last applied successfully; empty before first deploy.
        #[serde(default)]
        applied_manifest: String,
    },
    /// Helm release of a chart authored in the template.
    HelmTemplate {
        release_name: String,
        /// The chart's own `values.yaml` at the deployed revision.
        #[serde(default)]
        values_yaml: String,
    },
    /// Helm release of a chart from a remote repository, tracked outside
    /// the template.
    HelmChart { release_name: String, chart: ChartRef },
}

impl ServiceKind {
    pub fn service_type(&self) -> ServiceType {
        match self {
            Self::RawManifest { .. } => ServiceType::RawManifest,
            Self::HelmTemplate { .. } => ServiceType::HelmTemplate,
            Self::HelmChart { .. } => ServiceType::HelmChart,
        }
    }

    pub fn release_name(&self) -> Option<&str> {
        match self {
            Self::RawManifest { .. } => None,
            Self::HelmTemplate { release_name, .. } | Self::HelmChart { release_name, .. } => {
                Some(release_name.as_str())
            }
        }
    }
}

/// Tag of a [`ServiceKind`], used in keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    RawManifest,
    HelmTemplate,
    HelmChart,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RawManifest => "raw_manifest",
            Self::HelmTemplate => "helm_template",
            Self::HelmChart => "helm_chart",
        };
        f.write_str(s)
    }
}

/// Service name plus type: the identity used to match environment services
/// against template services.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub service_type: ServiceType,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            name: name.into(),
            service_type,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.name, self.service_type)
    }
}

/// A container of a service and where its image comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    /// Flat keys to derive the image from merged values; `None` keeps `image`.
    #[serde(default)]
    pub image_path: Option<ImageSearchPattern>,
}

/// One render variable of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceVariable {
    pub key: String,
    pub value: Value,
    /// Value tracks the environment's global variable of the same key.
    #[serde(default)]
    pub use_global_variable: bool,
}

/// Per-service override record.
///
/// `variables` is the source of truth for the raw-manifest path: the
/// override YAML is regenerated from it. `override_values` are dotted-path
/// assignments applied last, over the override YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRender {
    #[serde(default)]
    pub override_yaml: String,
    #[serde(default)]
    pub variables: Vec<ServiceVariable>,
    #[serde(default)]
    pub override_values: Vec<KeyValue>,
}

impl ServiceRender {
    pub fn is_empty(&self) -> bool {
        self.override_yaml.trim().is_empty()
            && self.variables.is_empty()
            && self.override_values.is_empty()
    }

    /// Variables as dotted-path assignments.
    pub fn variable_key_values(&self) -> Vec<KeyValue> {
        self.variables
            .iter()
            .map(|v| KeyValue {
                key: v.key.clone(),
                value: v.value.clone(),
            })
            .collect()
    }

    /// Rebuild `override_yaml` from `variables`. A render without
    /// variables keeps its hand-written YAML.
    pub fn regenerate_override_yaml(&mut self) -> ValuesResult<()> {
        if !self.variables.is_empty() {
            self.override_yaml = envgrid_values::key_values_to_yaml(&self.variable_key_values())?;
        }
        Ok(())
    }
}

/// Grid coordinates of a service inside its environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePosition {
    pub group: usize,
    pub index: usize,
}

/// A service deployed in an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub kind: ServiceKind,
    /// Template revision the service was deployed from (0 for chart services).
    pub revision: u64,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub render: ServiceRender,
    /// Last apply error; `None` after a successful apply.
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: u64,
    #[serde(default)]
    pub position: ServicePosition,
}

impl ServiceInstance {
    pub fn service_type(&self) -> ServiceType {
        self.kind.service_type()
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.name.clone(), self.service_type())
    }

    pub fn images(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.image.clone()).collect()
    }
}

// ── Global variables ──────────────────────────────────────────────

/// Environment-wide variable propagated into subscribed services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub key: String,
    pub value: Value,
    /// Services whose render variables track this key.
    #[serde(default)]
    pub related_services: BTreeSet<String>,
}

impl GlobalVariable {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            related_services: BTreeSet::new(),
        }
    }

    pub fn with_related<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related_services = services.into_iter().map(Into::into).collect();
        self
    }
}

// ── Environment ───────────────────────────────────────────────────

/// The header document of an environment (everything but services,
/// global variables and the deploy strategy map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentHeader {
    pub project: String,
    pub name: String,
    pub namespace: String,
    pub cluster_id: String,
    /// Global default-values document, lowest render precedence.
    #[serde(default)]
    pub default_values: String,
    pub status: EnvStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Bumped on every committed desired-state change.
    pub revision: u64,
    pub created_at: u64,
    pub updated_at: u64,
    /// Replica counts recorded when the environment went to sleep:
    /// service → workload → replicas.
    #[serde(default)]
    pub pre_sleep_replicas: BTreeMap<String, BTreeMap<String, u32>>,
}

impl EnvironmentHeader {
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::new(self.project.clone(), self.name.clone())
    }
}

/// A named, versioned instantiation of a project template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub header: EnvironmentHeader,
    /// Ordered service groups; group index is the apply order.
    pub groups: Vec<Vec<ServiceInstance>>,
    pub global_variables: Vec<GlobalVariable>,
    pub deploy_strategy: BTreeMap<String, DeployStrategy>,
}

impl Environment {
    pub fn key(&self) -> EnvironmentKey {
        self.header.key()
    }

    pub fn status(&self) -> EnvStatus {
        self.header.status
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.groups.iter().flatten()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceInstance> {
        self.services().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceInstance> {
        self.groups.iter_mut().flatten().find(|s| s.name == name)
    }

    pub fn global_variable(&self, key: &str) -> Option<&GlobalVariable> {
        self.global_variables.iter().find(|v| v.key == key)
    }

    /// Absent strategy entries mean the service is deployed.
    pub fn is_deployed(&self, service: &str) -> bool {
        self.deploy_strategy
            .get(service)
            .copied()
            .unwrap_or_default()
            == DeployStrategy::Deploy
    }

    /// Stamp every service with its current `(group, index)` position.
    pub fn reindex(&mut self) {
        for (group, services) in self.groups.iter_mut().enumerate() {
            for (index, service) in services.iter_mut().enumerate() {
                service.position = ServicePosition { group, index };
            }
        }
    }
}
