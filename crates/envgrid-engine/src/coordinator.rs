//! Reconciler — the persistence coordinator driving every environment
//! operation.
//!
//! An update runs in this order:
//!
//! 1. take the project's update lock
//! 2. load the environment, check the status transition, load the template
//! 3. diff, plan the next group layout and validate it (nothing written yet)
//! 4. write status `Updating` on its own
//! 5. commit groups, global variables, deploy strategy and header in one
//!    transaction; on failure restore the previous status and stop
//! 6. uninstall deleted services, then apply group by group, persisting
//!    each group's results after its barrier
//! 7. write the final status (`Running`/`Failed` plus error text) on its own
//!
//! The stored desired state can be ahead of the cluster between 5 and 7;
//! readers seeing `Updating` must not assume the stored services are live.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use envgrid_core::{EnvgridConfig, Template, TemplateService, TemplateServiceKind, TemplateVariable};
use envgrid_state::{
    ChartRef, Container, DeployStrategy, EnvStatus, Environment, EnvironmentHeader,
    EnvironmentKey, GlobalVariable, ServiceInstance, ServiceKey, ServiceKind, ServiceRender,
    ServiceType, ServiceVariable, StateError, StateResult, StateStore,
};
use envgrid_values::{KeyValue, parse_document, yaml_equal};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ApplyTarget, Collaborators, TemplateSource};
use crate::diff::{PlannedService, RevisionRecord, plan_groups, template_service_type};
use crate::error::{ApplyFailures, EngineError, EngineResult, RenderError};
use crate::executor::{ApplyExecutor, RetryPolicy, ServiceJob, ServiceOutcome};
use crate::lock::{BULK_UPDATE_LOCK, LockRegistry, update_lock_name};
use crate::render::RenderContext;
use crate::variables::{
    affected_by_default_values, diff_global_variables, propagate, refresh_related_services,
    validate_render_variables, variables_equal,
};

pub const DEFAULT_RELEASE_NAMING: &str = "$Service$-$EnvName$";

// ── Requests and reports ──────────────────────────────────────────

/// Chart coordinates for a service deployed straight from a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDeploy {
    pub chart: ChartRef,
    pub release_name: String,
}

/// Per-service arguments of an update. `None` fields keep what is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub name: String,
    #[serde(default)]
    pub deploy_strategy: DeployStrategy,
    #[serde(default)]
    pub variables: Option<Vec<ServiceVariable>>,
    #[serde(default)]
    pub override_yaml: Option<String>,
    #[serde(default)]
    pub override_values: Option<Vec<KeyValue>>,
    #[serde(default)]
    pub chart: Option<ChartDeploy>,
}

impl ServiceUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub project: String,
    pub name: String,
    /// Defaults to `{project}-{name}`.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_cluster")]
    pub cluster_id: String,
    /// Defaults to the template's default values.
    #[serde(default)]
    pub default_values: Option<String>,
    /// Defaults to the template's declared variables.
    #[serde(default)]
    pub global_variables: Option<Vec<GlobalVariable>>,
    /// Overrides and chart services. Template services not listed are
    /// deployed with their template defaults.
    #[serde(default)]
    pub services: Vec<ServiceUpdate>,
}

fn default_cluster() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub service_type: ServiceType,
    pub group: usize,
    pub revision: u64,
    pub deployed: bool,
    pub images: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvStatusReport {
    pub project: String,
    pub env: String,
    pub status: EnvStatus,
    pub error: Option<String>,
    pub revision: u64,
    pub services: Vec<ServiceStatus>,
}

impl EnvStatusReport {
    fn from_environment(env: &Environment) -> Self {
        Self {
            project: env.header.project.clone(),
            env: env.header.name.clone(),
            status: env.header.status,
            error: env.header.error.clone(),
            revision: env.header.revision,
            services: env
                .services()
                .map(|s| ServiceStatus {
                    name: s.name.clone(),
                    service_type: s.service_type(),
                    group: s.position.group,
                    revision: s.revision,
                    deployed: env.is_deployed(&s.name),
                    images: s.images(),
                    error: s.error.clone(),
                })
                .collect(),
        }
    }
}

/// Outcome of a bulk update: one report per environment still present and
/// the errors of the environments that failed.
#[derive(Debug, Default)]
pub struct BulkUpdateReport {
    pub reports: Vec<EnvStatusReport>,
    pub errors: Vec<(String, EngineError)>,
}

impl BulkUpdateReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Current and newly rendered output of one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceDiff {
    pub service: String,
    pub current: String,
    pub latest: String,
    pub error: Option<String>,
}

/// Handle to work finishing in the background. The task persists the
/// final status before it completes.
#[derive(Debug)]
pub struct ApplyJob {
    key: EnvironmentKey,
    handle: JoinHandle<EngineResult<ApplyFailures>>,
}

impl ApplyJob {
    pub fn key(&self) -> &EnvironmentKey {
        &self.key
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the job. Per-service failures come back as `Ok`; they are
    /// also recorded in the environment's status.
    pub async fn wait(self) -> EngineResult<ApplyFailures> {
        self.handle
            .await
            .map_err(|e| EngineError::Job(e.to_string()))?
    }
}

// ── Reconciler ────────────────────────────────────────────────────

struct Prepared {
    next: Environment,
    /// Services refreshed or added by this call.
    touched: BTreeSet<String>,
    /// Deleted services that were live and must be uninstalled.
    uninstall: Vec<ServiceInstance>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: StateStore,
    templates: Arc<dyn TemplateSource>,
    executor: ApplyExecutor,
    locks: LockRegistry,
    release_naming: String,
}

impl Reconciler {
    pub fn new(store: StateStore, collaborators: Collaborators) -> Self {
        Self {
            store,
            executor: ApplyExecutor::new(&collaborators, RetryPolicy::default()),
            templates: collaborators.templates,
            locks: LockRegistry::new(),
            release_naming: DEFAULT_RELEASE_NAMING.to_string(),
        }
    }

    pub fn from_config(
        store: StateStore,
        collaborators: Collaborators,
        config: &EnvgridConfig,
    ) -> Self {
        Self::new(store, collaborators)
            .with_retry_policy(RetryPolicy::from(&config.apply))
            .with_release_naming(config.release.naming.clone())
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor = self.executor.with_policy(policy);
        self
    }

    pub fn with_locks(mut self, locks: LockRegistry) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_release_naming(mut self, naming: impl Into<String>) -> Self {
        self.release_naming = naming.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Provision a new environment from its project template.
    ///
    /// Validation happens before this returns; the documents are stored
    /// with status `Creating` and the apply continues in the returned job.
    pub async fn create_environment(
        &self,
        request: CreateEnvironmentRequest,
    ) -> EngineResult<ApplyJob> {
        let guard = self.locks.acquire(&update_lock_name(&request.project)).await;
        let key = EnvironmentKey::new(request.project.clone(), request.name.clone());
        key.validate().map_err(EngineError::Validation)?;
        if self.store.get_header(&key)?.is_some() {
            return Err(EngineError::AlreadyExists(key.to_string()));
        }
        let template = self.load_template(&key.project).await?;

        let default_values = request
            .default_values
            .clone()
            .unwrap_or_else(|| template.default_values.clone());
        parse_document(&default_values)
            .map_err(|e| EngineError::Validation(format!("default values: {e}")))?;

        let global_variables = request.global_variables.clone().unwrap_or_else(|| {
            template
                .global_variables
                .iter()
                .map(|v| GlobalVariable::new(v.key.clone(), v.value.clone()))
                .collect()
        });
        diff_global_variables(&[], &global_variables)?;

        let now = epoch_secs();
        let empty = Environment {
            header: EnvironmentHeader {
                project: key.project.clone(),
                name: key.name.clone(),
                namespace: request
                    .namespace
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", key.project, key.name)),
                cluster_id: request.cluster_id.clone(),
                default_values,
                status: EnvStatus::Creating,
                error: None,
                revision: 1,
                created_at: now,
                updated_at: now,
                pre_sleep_replicas: BTreeMap::new(),
            },
            groups: Vec::new(),
            global_variables,
            deploy_strategy: BTreeMap::new(),
        };

        let mut updates = request.services.clone();
        for service in template.services() {
            if !updates.iter().any(|u| u.name == service.name) {
                updates.push(ServiceUpdate::new(service.name.clone()));
            }
        }
        let prepared = self.prepare(&empty, &template, &updates)?;
        let mut env = prepared.next;

        self.store.create_environment(&env).map_err(|e| match e {
            StateError::AlreadyExists(k) => EngineError::AlreadyExists(k),
            other => other.into(),
        })?;
        info!(
            project = %key.project,
            env = %key.name,
            services = env.services().count(),
            "environment created"
        );

        let jobs = jobs_for(&env, &prepared.touched);
        let this = self.clone();
        let job_key = key.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let failures = match this.execute(&mut env, jobs).await {
                Ok(failures) => failures,
                Err(e) => {
                    this.finish_with_error(&job_key, &e);
                    return Err(e);
                }
            };
            this.finish(&job_key, EnvStatus::Running, &failures);
            Ok(failures)
        });
        Ok(ApplyJob { key, handle })
    }

    /// Refresh, add or remove services, returning once the apply finished.
    ///
    /// Per-service failures are recorded on the services and returned as
    /// [`EngineError::ServicesFailed`].
    pub async fn update_services(
        &self,
        project: &str,
        env_name: &str,
        updates: Vec<ServiceUpdate>,
    ) -> EngineResult<()> {
        let _guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        check_transition(&env, EnvStatus::Updating)?;
        let template = self.load_template(project).await?;
        let prepared = self.prepare(&env, &template, &updates)?;
        info!(
            project = %project,
            env = %env_name,
            updated = prepared.touched.len(),
            deleted = prepared.uninstall.len(),
            "updating services"
        );

        let mut next = prepared.next;
        self.commit_desired(&env, &mut next)?;

        let mut failures = self.uninstall_services(&next.header, &prepared.uninstall).await;
        let jobs = jobs_for(&next, &prepared.touched);
        self.apply_and_finish(&mut next, jobs, &mut failures).await?;
        into_result(failures)
    }

    /// Update several environments of a project, one after another.
    /// Concurrent bulk callers are serialised against each other.
    pub async fn update_many(
        &self,
        project: &str,
        requests: Vec<(String, Vec<ServiceUpdate>)>,
    ) -> BulkUpdateReport {
        let _bulk = self.locks.acquire(BULK_UPDATE_LOCK).await;
        let mut report = BulkUpdateReport::default();
        for (env_name, updates) in requests {
            if let Err(e) = self.update_services(project, &env_name, updates).await {
                warn!(project = %project, env = %env_name, error = %e, "bulk update failed");
                report.errors.push((env_name.clone(), e));
            }
            match self.status(project, &env_name) {
                Ok(status) => report.reports.push(status),
                Err(e) => debug!(env = %env_name, error = %e, "no status to report"),
            }
        }
        report
    }

    /// Replace the environment's global variable set.
    ///
    /// Fails with [`EngineError::Conflict`] when `expected_revision` no
    /// longer matches, and with [`EngineError::KeyInUse`] when a removed key
    /// still has subscribers. Only subscribers of changed keys re-render.
    pub async fn update_global_variables(
        &self,
        project: &str,
        env_name: &str,
        variables: Vec<GlobalVariable>,
        expected_revision: Option<u64>,
    ) -> EngineResult<()> {
        let _guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        if let Some(expected) = expected_revision {
            if expected != env.header.revision {
                return Err(EngineError::Conflict {
                    env: key.to_string(),
                    expected,
                    actual: env.header.revision,
                });
            }
        }
        check_transition(&env, EnvStatus::Updating)?;
        if variables_equal(&env.global_variables, &variables) {
            debug!(env = %key, "global variables unchanged");
            return Ok(());
        }

        let propagation = propagate(&env, &variables)?;
        let mut next = env.clone();
        next.global_variables = propagation.global_variables;
        let touched: BTreeSet<String> = propagation.renders.keys().cloned().collect();
        for (service, render) in propagation.renders {
            if let Some(instance) = next.service_mut(&service) {
                instance.render = render;
            }
        }
        info!(
            env = %key,
            added = propagation.change.added.len(),
            removed = propagation.change.removed.len(),
            changed = propagation.change.changed.len(),
            affected = touched.len(),
            "updating global variables"
        );

        self.commit_desired(&env, &mut next)?;
        let mut failures = ApplyFailures::new();
        let jobs = jobs_for(&next, &touched);
        self.apply_and_finish(&mut next, jobs, &mut failures).await?;
        into_result(failures)
    }

    /// Replace the default-values document and re-apply every deployed
    /// service at its current revision.
    pub async fn update_default_values(
        &self,
        project: &str,
        env_name: &str,
        default_values: &str,
    ) -> EngineResult<()> {
        parse_document(default_values)
            .map_err(|e| EngineError::Validation(format!("default values: {e}")))?;
        let _guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        check_transition(&env, EnvStatus::Updating)?;
        let unchanged = yaml_equal(&env.header.default_values, default_values)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if unchanged {
            debug!(env = %key, "default values unchanged");
            return Ok(());
        }

        let mut next = env.clone();
        next.header.default_values = default_values.to_string();
        let touched: BTreeSet<String> = next.services().map(|s| s.name.clone()).collect();

        self.commit_desired(&env, &mut next)?;
        let mut failures = ApplyFailures::new();
        let jobs = jobs_for(&next, &touched);
        self.apply_and_finish(&mut next, jobs, &mut failures).await?;
        into_result(failures)
    }

    /// Remove services from the environment and the cluster.
    pub async fn delete_services(
        &self,
        project: &str,
        env_name: &str,
        names: &[String],
    ) -> EngineResult<()> {
        let _guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        check_transition(&env, EnvStatus::Updating)?;
        for name in names {
            if env.service(name).is_none() {
                return Err(EngineError::Validation(format!(
                    "service {name} not found in {key}"
                )));
            }
        }

        let mut next = env.clone();
        for group in &mut next.groups {
            group.retain(|s| !names.contains(&s.name));
        }
        while next.groups.last().is_some_and(Vec::is_empty) {
            next.groups.pop();
        }
        next.reindex();
        for name in names {
            next.deploy_strategy.remove(name);
        }
        refresh_related_services(&mut next.global_variables, next.groups.iter().flatten());
        let uninstall: Vec<ServiceInstance> = env
            .services()
            .filter(|s| names.contains(&s.name) && env.is_deployed(&s.name))
            .cloned()
            .collect();
        info!(env = %key, services = ?names, "deleting services");

        self.commit_desired(&env, &mut next)?;
        let failures = self.uninstall_services(&next.header, &uninstall).await;
        self.finish(&key, EnvStatus::Running, &failures);
        into_result(failures)
    }

    /// Tear the environment down. The documents are removed once every
    /// deployed service is uninstalled; otherwise they stay with status
    /// `Unknown` and the error recorded.
    pub async fn delete_environment(&self, project: &str, env_name: &str) -> EngineResult<ApplyJob> {
        let guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        check_transition(&env, EnvStatus::Deleting)?;
        self.store.set_status(&key, EnvStatus::Deleting, None)?;
        info!(env = %key, "deleting environment");

        let this = self.clone();
        let job_key = key.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let deployed: Vec<ServiceInstance> = env
                .services()
                .filter(|s| env.is_deployed(&s.name))
                .cloned()
                .collect();
            let failures = this.uninstall_services(&env.header, &deployed).await;
            if failures.is_empty() {
                if let Err(e) = this.store.delete_environment(&job_key) {
                    let e = EngineError::from(e);
                    error!(env = %job_key, error = %e, "failed to remove environment documents");
                    this.mark_unknown(&job_key, &e);
                    return Err(e);
                }
                info!(env = %job_key, "environment deleted");
            } else {
                warn!(env = %job_key, error = %failures, "environment teardown incomplete");
                this.mark_unknown(&job_key, &failures);
            }
            Ok::<_, EngineError>(failures)
        });
        Ok(ApplyJob { key, handle })
    }

    /// Put the environment to sleep (`enable`) or wake it up.
    pub async fn set_sleeping(&self, project: &str, env_name: &str, enable: bool) -> EngineResult<()> {
        let _guard = self.locks.acquire(&update_lock_name(project)).await;
        let key = EnvironmentKey::new(project, env_name);

        let env = self.load_env(&key)?;
        let target = if enable {
            EnvStatus::Sleeping
        } else {
            EnvStatus::Running
        };
        if env.status() == target {
            return Err(EngineError::Validation(format!(
                "environment {key} is already {target}"
            )));
        }
        check_transition(&env, target)?;

        let mut header = env.header.clone();
        let mut failures = ApplyFailures::new();
        for service in env.services().filter(|s| env.is_deployed(&s.name)) {
            let apply_target = apply_target(&header, &service.name);
            if enable {
                match self.executor.suspend(&apply_target).await {
                    Ok(replicas) => {
                        header.pre_sleep_replicas.insert(service.name.clone(), replicas);
                    }
                    Err(e) => failures.push(service.name.clone(), e),
                }
            } else {
                let replicas = header
                    .pre_sleep_replicas
                    .get(&service.name)
                    .cloned()
                    .unwrap_or_default();
                match self.executor.resume(&apply_target, &replicas).await {
                    Ok(()) => {
                        header.pre_sleep_replicas.remove(&service.name);
                    }
                    Err(e) => failures.push(service.name.clone(), e),
                }
            }
        }

        if failures.is_empty() {
            header.status = target;
            header.error = None;
            info!(env = %key, status = %target, "environment status changed");
        } else {
            header.error = Some(failures.to_string());
            warn!(env = %key, error = %failures, "sleep state change incomplete");
        }
        header.updated_at = epoch_secs();
        self.store.put_header(&header)?;
        into_result(failures)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Status and per-service errors. Does not take the update lock.
    pub fn status(&self, project: &str, env_name: &str) -> EngineResult<EnvStatusReport> {
        let env = self.load_env(&EnvironmentKey::new(project, env_name))?;
        Ok(EnvStatusReport::from_environment(&env))
    }

    pub fn list(&self, project: &str) -> EngineResult<Vec<EnvironmentHeader>> {
        Ok(self.store.list_environments(project)?)
    }

    /// Template-declared global variables the environment does not define.
    pub async fn global_variable_candidates(
        &self,
        project: &str,
        env_name: &str,
    ) -> EngineResult<Vec<TemplateVariable>> {
        let env = self.load_env(&EnvironmentKey::new(project, env_name))?;
        let template = self.load_template(project).await?;
        Ok(template
            .global_variables
            .into_iter()
            .filter(|v| env.global_variable(&v.key).is_none())
            .collect())
    }

    /// Show what a global-variable update would render, without committing.
    ///
    /// Render failures are reported per service instead of failing the call.
    pub async fn preview_global_variables(
        &self,
        project: &str,
        env_name: &str,
        variables: Vec<GlobalVariable>,
    ) -> EngineResult<Vec<ServiceDiff>> {
        let env = self.load_env(&EnvironmentKey::new(project, env_name))?;
        let propagation = propagate(&env, &variables)?;
        let ctx = render_context(&env.header);

        let mut diffs = Vec::with_capacity(propagation.renders.len());
        for (name, render) in propagation.renders {
            let Some(instance) = env.service(&name) else {
                continue;
            };
            let mut diff = ServiceDiff {
                service: name.clone(),
                ..ServiceDiff::default()
            };
            let job = ServiceJob::from_instance(instance, apply_target(&env.header, &name));

            diff.current = match &instance.kind {
                ServiceKind::RawManifest {
                    applied_manifest, ..
                } if !applied_manifest.is_empty() => applied_manifest.clone(),
                _ => match self.executor.render(&ctx, &job).await {
                    Ok(rendered) => rendered.output.text().to_string(),
                    Err(e) => {
                        diff.error = Some(format!("current: {e}"));
                        String::new()
                    }
                },
            };

            let latest = ServiceJob { render, ..job };
            match self.executor.render(&ctx, &latest).await {
                Ok(rendered) => diff.latest = rendered.output.text().to_string(),
                Err(e) => diff.error = Some(format!("latest: {e}")),
            }
            diffs.push(diff);
        }
        Ok(diffs)
    }

    /// Services a default-values change may affect. Advisory only.
    pub fn preview_default_values(
        &self,
        project: &str,
        env_name: &str,
        default_values: &str,
    ) -> EngineResult<Vec<String>> {
        let env = self.load_env(&EnvironmentKey::new(project, env_name))?;
        affected_by_default_values(&env.header.default_values, default_values, env.services())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn load_env(&self, key: &EnvironmentKey) -> EngineResult<Environment> {
        self.store
            .get_environment(key)?
            .ok_or_else(|| EngineError::NotFound(key.to_string()))
    }

    async fn load_template(&self, project: &str) -> EngineResult<Template> {
        self.templates
            .load(project)
            .await
            .map_err(|source| EngineError::TemplateLoad {
                project: project.to_string(),
                source,
            })
    }

    /// Diff, plan and build the next environment state. Writes nothing.
    fn prepare(
        &self,
        env: &Environment,
        template: &Template,
        updates: &[ServiceUpdate],
    ) -> EngineResult<Prepared> {
        let keys = resolve_keys(env, template, updates)?;
        let by_name: BTreeMap<&str, &ServiceUpdate> =
            updates.iter().map(|u| (u.name.as_str(), u)).collect();
        let record = RevisionRecord::classify(env, template, &keys);
        let plan = plan_groups(env, template, &record);
        let ctx = render_context(&env.header);
        let now = epoch_secs();

        let mut touched = BTreeSet::new();
        let mut groups = Vec::with_capacity(plan.len());
        for planned in &plan {
            let mut group = Vec::with_capacity(planned.len());
            for slot in planned {
                let instance = match *slot {
                    PlannedService::Keep(service) => service.clone(),
                    PlannedService::FromTemplate { template, current } => {
                        touched.insert(template.name.clone());
                        let update = by_name.get(template.name.as_str()).copied();
                        self.instance_from_template(&ctx, template, current, update, now)?
                    }
                    PlannedService::Chart { name, current } => {
                        touched.insert(name.to_string());
                        let update = by_name.get(name).copied();
                        instance_for_chart(name, current, update, now)?
                    }
                };
                group.push(instance);
            }
            groups.push(group);
        }

        let mut next = Environment {
            header: env.header.clone(),
            groups,
            global_variables: env.global_variables.clone(),
            deploy_strategy: env.deploy_strategy.clone(),
        };
        next.reindex();

        let uninstall: Vec<ServiceInstance> = record
            .deleted()
            .filter_map(|key| env.services().find(|s| &s.key() == key))
            .filter(|s| env.is_deployed(&s.name))
            .cloned()
            .collect();
        for key in record.deleted() {
            if next.service(&key.name).is_none() {
                next.deploy_strategy.remove(&key.name);
            }
        }
        for update in updates {
            if next.service(&update.name).is_some() {
                next.deploy_strategy
                    .insert(update.name.clone(), update.deploy_strategy);
            }
        }

        refresh_related_services(&mut next.global_variables, next.groups.iter().flatten());
        for service in next.services().filter(|s| touched.contains(&s.name)) {
            validate_render_variables(&service.name, &service.render, &next.global_variables)?;
        }

        Ok(Prepared {
            next,
            touched,
            uninstall,
        })
    }

    fn instance_from_template(
        &self,
        ctx: &RenderContext,
        template: &TemplateService,
        current: Option<&ServiceInstance>,
        update: Option<&ServiceUpdate>,
        now: u64,
    ) -> EngineResult<ServiceInstance> {
        let kind = match &template.kind {
            TemplateServiceKind::RawManifest { manifest } => ServiceKind::RawManifest {
                template: manifest.clone(),
                applied_manifest: match current.map(|c| &c.kind) {
                    Some(ServiceKind::RawManifest {
                        applied_manifest, ..
                    }) => applied_manifest.clone(),
                    _ => String::new(),
                },
            },
            TemplateServiceKind::HelmTemplate {
                values_yaml,
                release_naming,
            } => {
                let release_name = match current.and_then(|c| c.kind.release_name()) {
                    Some(existing) => existing.to_string(),
                    None => ctx.release_name(
                        release_naming.as_deref().unwrap_or(&self.release_naming),
                        &template.name,
                    ),
                };
                ServiceKind::HelmTemplate {
                    release_name,
                    values_yaml: values_yaml.clone(),
                }
            }
        };

        let mut render = match current {
            Some(current) => current.render.clone(),
            None => {
                let mut render = ServiceRender {
                    variables: template
                        .variables
                        .iter()
                        .map(|v| ServiceVariable {
                            key: v.key.clone(),
                            value: v.value.clone(),
                            use_global_variable: false,
                        })
                        .collect(),
                    ..ServiceRender::default()
                };
                render.regenerate_override_yaml().map_err(RenderError::from)?;
                render
            }
        };
        if let Some(update) = update {
            apply_update(&mut render, update)?;
        }

        Ok(ServiceInstance {
            name: template.name.clone(),
            kind,
            revision: template.revision,
            containers: template
                .containers
                .iter()
                .map(|c| Container {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    image_path: c.image_path.clone(),
                })
                .collect(),
            render,
            error: current.and_then(|c| c.error.clone()),
            updated_at: now,
            position: Default::default(),
        })
    }

    /// Status `Updating` on its own, then the desired state in one
    /// transaction. A failed transaction restores the previous status.
    fn commit_desired(&self, previous: &Environment, next: &mut Environment) -> EngineResult<()> {
        let key = next.key();
        self.store.set_status(&key, EnvStatus::Updating, None)?;

        next.header.status = EnvStatus::Updating;
        next.header.error = None;
        next.header.revision = previous.header.revision + 1;
        next.header.updated_at = epoch_secs();

        if let Err(e) = write_desired(&self.store, next) {
            error!(env = %key, error = %e, "desired state transaction failed");
            if let Err(restore) = self.store.set_status(
                &key,
                previous.header.status,
                previous.header.error.as_deref(),
            ) {
                error!(env = %key, error = %restore, "failed to restore previous status");
            }
            return Err(e.into());
        }
        debug!(env = %key, revision = next.header.revision, "desired state committed");
        Ok(())
    }

    /// Apply groups in order, persisting each group after its barrier.
    async fn execute(
        &self,
        env: &mut Environment,
        jobs: Vec<(usize, Vec<ServiceJob>)>,
    ) -> EngineResult<ApplyFailures> {
        let ctx = render_context(&env.header);
        let key = env.key();
        let store = &self.store;
        let groups = &mut env.groups;
        self.executor
            .run(&ctx, jobs, |index, outcomes| {
                let Some(group) = groups.get_mut(index) else {
                    return Ok(());
                };
                let now = epoch_secs();
                for outcome in outcomes {
                    if let Some(service) = group.iter_mut().find(|s| s.name == outcome.service) {
                        record_outcome(service, outcome, now);
                    }
                }
                store.put_group(&key, index, group)?;
                Ok(())
            })
            .await
    }

    /// Run the apply and write the final status, whatever happened.
    async fn apply_and_finish(
        &self,
        env: &mut Environment,
        jobs: Vec<(usize, Vec<ServiceJob>)>,
        failures: &mut ApplyFailures,
    ) -> EngineResult<()> {
        let key = env.key();
        match self.execute(env, jobs).await {
            Ok(applied) => {
                failures.extend(applied);
                self.finish(&key, EnvStatus::Running, failures);
                Ok(())
            }
            Err(e) => {
                self.finish_with_error(&key, &e);
                Err(e)
            }
        }
    }

    async fn uninstall_services(
        &self,
        header: &EnvironmentHeader,
        services: &[ServiceInstance],
    ) -> ApplyFailures {
        let mut failures = ApplyFailures::new();
        for service in services {
            let target = apply_target(header, &service.name);
            if let Err(e) = self.executor.uninstall(&target, &service.kind).await {
                warn!(service = %service.name, error = %e, "uninstall failed");
                failures.push(service.name.clone(), e);
            }
        }
        failures
    }

    /// Final status write. Failure to persist is logged only: the cluster
    /// side already happened.
    fn finish(&self, key: &EnvironmentKey, success: EnvStatus, failures: &ApplyFailures) {
        let (status, error) = if failures.is_empty() {
            (success, None)
        } else {
            (EnvStatus::Failed, Some(failures.to_string()))
        };
        match self.store.set_status(key, status, error.as_deref()) {
            Ok(()) => info!(env = %key, %status, failed = failures.len(), "environment settled"),
            Err(e) => error!(env = %key, %status, error = %e, "failed to persist final status"),
        }
    }

    /// Teardown outcome unclear: leave the environment deletable again.
    fn mark_unknown(&self, key: &EnvironmentKey, error: &impl std::fmt::Display) {
        let text = error.to_string();
        if let Err(e) = self.store.set_status(key, EnvStatus::Unknown, Some(&text)) {
            error!(env = %key, error = %e, "failed to persist final status");
        }
    }

    fn finish_with_error(&self, key: &EnvironmentKey, error: &EngineError) {
        let text = error.to_string();
        if let Err(e) = self.store.set_status(key, EnvStatus::Failed, Some(&text)) {
            error!(env = %key, error = %e, "failed to persist final status");
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn check_transition(env: &Environment, next: EnvStatus) -> EngineResult<()> {
    let from = env.status();
    if from.can_transition_to(next) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            env: env.key().to_string(),
            from,
            to: next,
        })
    }
}

fn render_context(header: &EnvironmentHeader) -> RenderContext {
    RenderContext {
        project: header.project.clone(),
        env_name: header.name.clone(),
        namespace: header.namespace.clone(),
        default_values: header.default_values.clone(),
    }
}

fn apply_target(header: &EnvironmentHeader, service: &str) -> ApplyTarget {
    ApplyTarget {
        project: header.project.clone(),
        env: header.name.clone(),
        namespace: header.namespace.clone(),
        cluster_id: header.cluster_id.clone(),
        service: service.to_string(),
    }
}

/// Resolve each requested name to its `name+type` key and validate the
/// request shape.
fn resolve_keys(
    env: &Environment,
    template: &Template,
    updates: &[ServiceUpdate],
) -> EngineResult<BTreeSet<ServiceKey>> {
    let mut keys = BTreeSet::new();
    let mut seen = BTreeSet::new();
    for update in updates {
        if update.name.trim().is_empty() {
            return Err(EngineError::Validation("service name is required".to_string()));
        }
        if !seen.insert(update.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "service {} listed more than once",
                update.name
            )));
        }
        if let Some(yaml) = &update.override_yaml {
            parse_document(yaml).map_err(|e| {
                EngineError::Validation(format!("override yaml of {}: {e}", update.name))
            })?;
        }
        let service_type = if update.chart.is_some() {
            ServiceType::HelmChart
        } else if let Some(service) = template.service(&update.name) {
            template_service_type(service)
        } else if let Some(service) = env.service(&update.name) {
            service.service_type()
        } else {
            return Err(EngineError::Validation(format!(
                "service {} is neither in the template nor in the environment",
                update.name
            )));
        };
        keys.insert(ServiceKey::new(update.name.clone(), service_type));
    }
    Ok(keys)
}

/// Merge a request's overrides into a render record. Variables, when given,
/// regenerate the override YAML.
fn apply_update(render: &mut ServiceRender, update: &ServiceUpdate) -> EngineResult<()> {
    if let Some(yaml) = &update.override_yaml {
        render.override_yaml = yaml.clone();
    }
    if let Some(values) = &update.override_values {
        render.override_values = values.clone();
    }
    if let Some(variables) = &update.variables {
        render.variables = variables.clone();
        render.regenerate_override_yaml().map_err(RenderError::from)?;
    }
    Ok(())
}

fn instance_for_chart(
    name: &str,
    current: Option<&ServiceInstance>,
    update: Option<&ServiceUpdate>,
    now: u64,
) -> EngineResult<ServiceInstance> {
    let kind = match (update.and_then(|u| u.chart.as_ref()), current) {
        (Some(deploy), _) => ServiceKind::HelmChart {
            release_name: deploy.release_name.clone(),
            chart: deploy.chart.clone(),
        },
        (None, Some(current)) => current.kind.clone(),
        (None, None) => {
            return Err(EngineError::Validation(format!(
                "chart service {name} needs chart coordinates"
            )));
        }
    };
    let mut render = current.map(|c| c.render.clone()).unwrap_or_default();
    if let Some(update) = update {
        apply_update(&mut render, update)?;
    }
    Ok(ServiceInstance {
        name: name.to_string(),
        kind,
        revision: 0,
        containers: current.map(|c| c.containers.clone()).unwrap_or_default(),
        render,
        error: current.and_then(|c| c.error.clone()),
        updated_at: now,
        position: Default::default(),
    })
}

/// Jobs for the named services that are meant to be live, per group.
fn jobs_for(env: &Environment, names: &BTreeSet<String>) -> Vec<(usize, Vec<ServiceJob>)> {
    env.groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let jobs = group
                .iter()
                .filter(|s| names.contains(&s.name) && env.is_deployed(&s.name))
                .map(|s| ServiceJob::from_instance(s, apply_target(&env.header, &s.name)))
                .collect::<Vec<_>>();
            (index, jobs)
        })
        .filter(|(_, jobs)| !jobs.is_empty())
        .collect()
}

fn record_outcome(service: &mut ServiceInstance, outcome: &ServiceOutcome, now: u64) {
    service.updated_at = now;
    match &outcome.result {
        Ok(applied) => {
            service.error = None;
            service.containers = applied.containers.clone();
            if let (
                Some(manifest),
                ServiceKind::RawManifest {
                    applied_manifest, ..
                },
            ) = (&applied.manifest, &mut service.kind)
            {
                *applied_manifest = manifest.clone();
            }
        }
        Err(e) => service.error = Some(e.to_string()),
    }
}

fn write_desired(store: &StateStore, env: &Environment) -> StateResult<()> {
    let mut txn = store.begin(&env.key())?;
    txn.put_header(&env.header)?;
    txn.put_groups(&env.groups)?;
    txn.put_global_variables(&env.global_variables)?;
    txn.put_deploy_strategy(&env.deploy_strategy)?;
    txn.commit()
}

fn into_result(failures: ApplyFailures) -> EngineResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::ServicesFailed(failures))
    }
}
