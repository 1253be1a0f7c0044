//! Fake collaborators shared by the integration tests.
//!
//! `FakeCluster` stands in for the resource applier, the Helm client and the
//! chart repository at once so that every call lands in one ordered event
//! log.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use envgrid_core::Template;
use envgrid_engine::{
    ApplyTarget, ChartFetcher, Collaborators, CreateEnvironmentRequest, HelmClient, HelmRelease,
    Reconciler, ResourceApplier, RetryPolicy, ServiceUpdate, TemplateSource,
};
use envgrid_state::{ChartRef, EnvStatus, EnvironmentKey, ServiceVariable, StateStore};

pub const SHOP: &str = r#"
project: shop
default_values: |
  replica: 1
  image:
    tag: v0
global_variables:
  - key: replica
    value: 2
  - key: region
    value: eu
groups:
  - - name: db
      revision: 1
      type: raw_manifest
      manifest: |
        kind: Deployment
        metadata:
          name: db
          namespace: $Namespace$
      containers:
        - { name: db, image: "postgres:15" }
    - name: cache
      revision: 4
      type: raw_manifest
      manifest: |
        kind: Deployment
        metadata:
          name: cache
  - - name: web
      revision: 3
      type: raw_manifest
      manifest: |
        kind: Deployment
        metadata:
          name: web
        spec:
          replicas: {{.replica}}
    - name: api
      revision: 2
      type: helm_template
      values_yaml: |
        image:
          repository: shop/api
          tag: v1
      containers:
        - name: api
          image: shop/api:v1
          image_path: { image: image.repository, tag: image.tag }
    - name: worker
      revision: 5
      type: helm_template
      values_yaml: |
        queue: jobs
"#;

pub fn shop_template() -> Template {
    Template::from_yaml(SHOP).unwrap()
}

// ── Template catalog ──────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTemplates {
    templates: Mutex<HashMap<String, Template>>,
}

impl FakeTemplates {
    pub fn set(&self, template: Template) {
        self.templates
            .lock()
            .unwrap()
            .insert(template.project.clone(), template);
    }
}

#[async_trait]
impl TemplateSource for FakeTemplates {
    async fn load(&self, project: &str) -> anyhow::Result<Template> {
        self.templates
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no template for {project}"))
    }
}

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCluster {
    events: Mutex<Vec<String>>,
    fail_apply: Mutex<BTreeSet<String>>,
    fail_uninstall: Mutex<BTreeSet<String>>,
    /// Remaining Helm failures per service before it succeeds.
    helm_failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    manifests: Mutex<BTreeMap<String, String>>,
    releases: Mutex<BTreeMap<String, HelmRelease>>,
    helm_calls: Mutex<Vec<(String, bool)>>,
    observed_status: Mutex<Vec<EnvStatus>>,
    watched: Mutex<Option<StateStore>>,
}

impl FakeCluster {
    pub fn fail_apply(&self, service: &str) {
        self.fail_apply.lock().unwrap().insert(service.to_string());
    }

    pub fn heal(&self, service: &str) {
        self.fail_apply.lock().unwrap().remove(service);
    }

    pub fn fail_uninstall(&self, service: &str) {
        self.fail_uninstall.lock().unwrap().insert(service.to_string());
    }

    pub fn fail_helm_times(&self, service: &str, times: u32) {
        self.helm_failures
            .lock()
            .unwrap()
            .insert(service.to_string(), times);
    }

    pub fn delay(&self, service: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(service.to_string(), delay);
    }

    /// Record the environment's stored status on every apply call.
    pub fn watch(&self, store: StateStore) {
        *self.watched.lock().unwrap() = Some(store);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
        self.helm_calls.lock().unwrap().clear();
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn manifest(&self, service: &str) -> Option<String> {
        self.manifests.lock().unwrap().get(service).cloned()
    }

    pub fn release(&self, release_name: &str) -> Option<HelmRelease> {
        self.releases.lock().unwrap().get(release_name).cloned()
    }

    pub fn helm_calls(&self, service: &str) -> Vec<bool> {
        self.helm_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == service)
            .map(|(_, retry)| *retry)
            .collect()
    }

    pub fn observed_status(&self) -> Vec<EnvStatus> {
        self.observed_status.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn observe(&self, target: &ApplyTarget) {
        let store = self.watched.lock().unwrap().clone();
        if let Some(store) = store {
            let key = EnvironmentKey::new(target.project.clone(), target.env.clone());
            if let Some(header) = store.get_header(&key).unwrap() {
                self.observed_status.lock().unwrap().push(header.status);
            }
        }
    }

    async fn pause(&self, service: &str) {
        let delay = self.delays.lock().unwrap().get(service).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ResourceApplier for FakeCluster {
    async fn apply(
        &self,
        target: &ApplyTarget,
        _previous: &str,
        desired: &str,
    ) -> anyhow::Result<()> {
        self.observe(target);
        self.push(format!("start:{}", target.service));
        self.pause(&target.service).await;
        self.push(format!("end:{}", target.service));
        if self.fail_apply.lock().unwrap().contains(&target.service) {
            anyhow::bail!("admission webhook rejected {}", target.service);
        }
        self.manifests
            .lock()
            .unwrap()
            .insert(target.service.clone(), desired.to_string());
        Ok(())
    }

    async fn uninstall(&self, target: &ApplyTarget, _wait: bool) -> anyhow::Result<()> {
        self.push(format!("uninstall:{}", target.service));
        if self.fail_uninstall.lock().unwrap().contains(&target.service) {
            anyhow::bail!("finalizer stuck on {}", target.service);
        }
        self.manifests.lock().unwrap().remove(&target.service);
        Ok(())
    }

    async fn suspend(&self, target: &ApplyTarget) -> anyhow::Result<BTreeMap<String, u32>> {
        self.push(format!("suspend:{}", target.service));
        Ok(BTreeMap::from([(format!("deployment/{}", target.service), 2)]))
    }

    async fn resume(
        &self,
        target: &ApplyTarget,
        replicas: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        let total: u32 = replicas.values().sum();
        self.push(format!("resume:{}:{total}", target.service));
        Ok(())
    }
}

#[async_trait]
impl HelmClient for FakeCluster {
    async fn install_or_upgrade(&self, release: &HelmRelease, is_retry: bool) -> anyhow::Result<()> {
        let service = release.target.service.clone();
        self.observe(&release.target);
        self.helm_calls
            .lock()
            .unwrap()
            .push((service.clone(), is_retry));
        self.push(format!("start:{service}"));
        self.pause(&service).await;
        self.push(format!("end:{service}"));

        {
            let mut failures = self.helm_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&service) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("another operation is in progress for {}", release.release_name);
                }
            }
        }
        if self.fail_apply.lock().unwrap().contains(&service) {
            anyhow::bail!("release {} failed", release.release_name);
        }
        self.releases
            .lock()
            .unwrap()
            .insert(release.release_name.clone(), release.clone());
        Ok(())
    }

    async fn uninstall(&self, target: &ApplyTarget, release_name: &str) -> anyhow::Result<()> {
        self.push(format!("uninstall:{}", target.service));
        if self.fail_uninstall.lock().unwrap().contains(&target.service) {
            anyhow::bail!("release {release_name} stuck");
        }
        self.releases.lock().unwrap().remove(release_name);
        Ok(())
    }
}

#[async_trait]
impl ChartFetcher for FakeCluster {
    async fn fetch(&self, chart: &ChartRef) -> anyhow::Result<String> {
        self.push(format!("fetch:{}", chart.name));
        Ok("architecture: standalone\nauth:\n  enabled: true\n".to_string())
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub struct Harness {
    pub reconciler: Reconciler,
    pub cluster: Arc<FakeCluster>,
    pub templates: Arc<FakeTemplates>,
    pub store: StateStore,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        pass_interval: Duration::from_millis(10),
        item_interval: Duration::ZERO,
    }
}

pub fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let cluster = Arc::new(FakeCluster::default());
    let templates = Arc::new(FakeTemplates::default());
    templates.set(shop_template());

    let collaborators = Collaborators {
        templates: templates.clone(),
        applier: cluster.clone(),
        helm: cluster.clone(),
        charts: cluster.clone(),
    };
    let reconciler = Reconciler::new(store.clone(), collaborators).with_retry_policy(fast_retry());
    Harness {
        reconciler,
        cluster,
        templates,
        store,
    }
}

pub fn global(key: &str, value: impl Into<serde_yaml::Value>) -> ServiceVariable {
    ServiceVariable {
        key: key.to_string(),
        value: value.into(),
        use_global_variable: true,
    }
}

/// `shop/dev` with `web` subscribed to `replica` and `api` to `region`.
pub fn dev_request() -> CreateEnvironmentRequest {
    CreateEnvironmentRequest {
        project: "shop".into(),
        name: "dev".into(),
        cluster_id: "local".into(),
        services: vec![
            ServiceUpdate {
                variables: Some(vec![global("replica", 2)]),
                ..ServiceUpdate::new("web")
            },
            ServiceUpdate {
                variables: Some(vec![global("region", "eu")]),
                ..ServiceUpdate::new("api")
            },
        ],
        ..CreateEnvironmentRequest::default()
    }
}

/// Create `shop/dev`, wait for the apply and clear the event log.
pub async fn create_dev(h: &Harness) {
    let failures = h
        .reconciler
        .create_environment(dev_request())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(failures.is_empty(), "{failures}");
    h.cluster.clear_events();
}

pub fn dev_key() -> EnvironmentKey {
    EnvironmentKey::new("shop", "dev")
}
