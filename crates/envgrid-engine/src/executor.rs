//! Concurrent apply executor.
//!
//! Groups are applied strictly in ascending index order: every task of a
//! group is joined and the group's results handed to the caller's sink
//! before the next group starts. Inside a group each raw-manifest service
//! runs in its own task with a single attempt; Helm services share one
//! retry batch:
//!
//! ```text
//!   pass 0:  all items ──► failed subset
//!   pass 1:  sleep(pass_interval), failed subset ──► failed subset
//!   ...      up to `attempts` retry passes
//! ```
//!
//! Items within a pass start `item_interval` apart. An item that succeeds
//! is never run again; render failures are final on the first pass.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use envgrid_core::config::ApplyConfig;
use envgrid_state::{ChartRef, Container, ServiceInstance, ServiceKind, ServiceRender};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    ApplyTarget, ChartFetcher, ChartSource, Collaborators, HelmClient, HelmRelease,
    ResourceApplier,
};
use crate::error::{ApplyFailures, EngineResult, ServiceApplyError};
use crate::render::{RenderContext, RenderSource, RenderedService, render_service};

/// Bounded retry for the Helm batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry passes after the first one.
    pub attempts: u32,
    pub pass_interval: Duration,
    pub item_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pass_interval: Duration::from_secs(3),
            item_interval: Duration::from_millis(500),
        }
    }
}

impl From<&ApplyConfig> for RetryPolicy {
    fn from(config: &ApplyConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            pass_interval: config.retry_interval(),
            item_interval: config.item_interval(),
        }
    }
}

/// How one service gets applied.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    Manifest {
        template: String,
        previous: String,
    },
    HelmTemplate {
        values_yaml: String,
        release_name: String,
        revision: u64,
    },
    HelmChart {
        chart: ChartRef,
        release_name: String,
    },
}

/// Everything needed to render and apply one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceJob {
    pub target: ApplyTarget,
    pub kind: JobKind,
    pub render: ServiceRender,
    pub containers: Vec<Container>,
}

impl ServiceJob {
    pub fn from_instance(instance: &ServiceInstance, target: ApplyTarget) -> Self {
        let kind = match &instance.kind {
            ServiceKind::RawManifest {
                template,
                applied_manifest,
            } => JobKind::Manifest {
                template: template.clone(),
                previous: applied_manifest.clone(),
            },
            ServiceKind::HelmTemplate {
                release_name,
                values_yaml,
            } => JobKind::HelmTemplate {
                values_yaml: values_yaml.clone(),
                release_name: release_name.clone(),
                revision: instance.revision,
            },
            ServiceKind::HelmChart {
                release_name,
                chart,
            } => JobKind::HelmChart {
                chart: chart.clone(),
                release_name: release_name.clone(),
            },
        };
        Self {
            target,
            kind,
            render: instance.render.clone(),
            containers: instance.containers.clone(),
        }
    }

    pub fn service(&self) -> &str {
        &self.target.service
    }

    pub fn is_helm(&self) -> bool {
        !matches!(self.kind, JobKind::Manifest { .. })
    }
}

/// What a successful apply produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub containers: Vec<Container>,
    /// The manifest now live, for raw-manifest services.
    pub manifest: Option<String>,
}

#[derive(Debug)]
pub struct ServiceOutcome {
    pub service: String,
    pub result: Result<Applied, ServiceApplyError>,
}

/// Run `handler` over `items`, retrying only the retryable failures.
///
/// Returns every item with its final result, in completion-pass order.
pub async fn run_with_retry<T, O, F, Fut>(
    items: Vec<T>,
    policy: &RetryPolicy,
    handler: F,
) -> Vec<(T, Result<O, ServiceApplyError>)>
where
    T: Clone,
    F: Fn(T, u32) -> Fut,
    Fut: Future<Output = Result<O, ServiceApplyError>>,
{
    let mut pending = items;
    let mut done = Vec::with_capacity(pending.len());

    for attempt in 0..=policy.attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.pass_interval).await;
            info!(attempt, remaining = pending.len(), "retrying failed items");
        }

        let passes = pending.iter().cloned().enumerate().map(|(i, item)| {
            let delay = policy.item_interval * i as u32;
            let fut = handler(item, attempt);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                fut.await
            }
        });
        let results = join_all(passes).await;

        let last = attempt == policy.attempts;
        let mut retry = Vec::new();
        for (item, result) in pending.into_iter().zip(results) {
            match result {
                Err(e) if !last && e.is_retryable() => {
                    debug!(attempt, error = %e, "item failed, will retry");
                    retry.push(item);
                }
                result => done.push((item, result)),
            }
        }
        if retry.is_empty() {
            break;
        }
        pending = retry;
    }
    done
}

/// Applies service jobs through the collaborators.
#[derive(Clone)]
pub struct ApplyExecutor {
    applier: Arc<dyn ResourceApplier>,
    helm: Arc<dyn HelmClient>,
    charts: Arc<dyn ChartFetcher>,
    policy: RetryPolicy,
}

impl ApplyExecutor {
    pub fn new(collaborators: &Collaborators, policy: RetryPolicy) -> Self {
        Self {
            applier: collaborators.applier.clone(),
            helm: collaborators.helm.clone(),
            charts: collaborators.charts.clone(),
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply groups in order. `on_group` runs after each group's barrier;
    /// an error from it stops the remaining groups.
    pub async fn run<F>(
        &self,
        ctx: &RenderContext,
        groups: Vec<(usize, Vec<ServiceJob>)>,
        mut on_group: F,
    ) -> EngineResult<ApplyFailures>
    where
        F: FnMut(usize, &[ServiceOutcome]) -> EngineResult<()>,
    {
        let mut failures = ApplyFailures::new();
        for (index, jobs) in groups {
            if jobs.is_empty() {
                continue;
            }
            info!(
                project = %ctx.project,
                env = %ctx.env_name,
                group = index,
                services = jobs.len(),
                "applying service group"
            );
            let outcomes = self.run_group(ctx, jobs).await;
            on_group(index, &outcomes)?;
            for outcome in outcomes {
                if let Err(e) = outcome.result {
                    failures.push(outcome.service, e);
                }
            }
        }
        Ok(failures)
    }

    /// Apply one group and wait for every task in it.
    pub async fn run_group(&self, ctx: &RenderContext, jobs: Vec<ServiceJob>) -> Vec<ServiceOutcome> {
        let ctx = Arc::new(ctx.clone());
        let (helm, manifests): (Vec<_>, Vec<_>) = jobs.into_iter().partition(ServiceJob::is_helm);

        let mut names = Vec::new();
        let mut handles = Vec::new();
        for job in manifests {
            let this = self.clone();
            let ctx = ctx.clone();
            names.push(vec![job.service().to_string()]);
            handles.push(tokio::spawn(async move {
                let result = this.apply_once(&ctx, &job, false).await;
                log_outcome(&job, &result);
                vec![ServiceOutcome {
                    service: job.target.service,
                    result,
                }]
            }));
        }
        if !helm.is_empty() {
            let this = self.clone();
            let ctx = ctx.clone();
            names.push(helm.iter().map(|j| j.service().to_string()).collect());
            handles.push(tokio::spawn(async move {
                this.apply_helm_batch(&ctx, helm).await
            }));
        }

        let mut outcomes = Vec::new();
        for (names, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(batch) => outcomes.extend(batch),
                Err(e) => {
                    error!(services = ?names, error = %e, "apply task did not complete");
                    outcomes.extend(names.into_iter().map(|service| ServiceOutcome {
                        service,
                        result: Err(ServiceApplyError::Apply(format!("apply task aborted: {e}"))),
                    }));
                }
            }
        }
        outcomes
    }

    async fn apply_helm_batch(&self, ctx: &RenderContext, jobs: Vec<ServiceJob>) -> Vec<ServiceOutcome> {
        let results = run_with_retry(jobs, &self.policy, |job, attempt| async move {
            let result = self.apply_once(ctx, &job, attempt > 0).await;
            log_outcome(&job, &result);
            result
        })
        .await;
        results
            .into_iter()
            .map(|(job, result)| ServiceOutcome {
                service: job.target.service,
                result,
            })
            .collect()
    }

    /// Render a job, fetching the chart first for chart services.
    pub async fn render(
        &self,
        ctx: &RenderContext,
        job: &ServiceJob,
    ) -> Result<RenderedService, ServiceApplyError> {
        let service = job.service();
        let rendered = match &job.kind {
            JobKind::Manifest { template, .. } => render_service(
                ctx,
                service,
                RenderSource::Manifest(template),
                &job.render,
                &job.containers,
            )?,
            JobKind::HelmTemplate { values_yaml, .. } => render_service(
                ctx,
                service,
                RenderSource::Chart { values_yaml },
                &job.render,
                &job.containers,
            )?,
            JobKind::HelmChart { chart, .. } => {
                let values_yaml = self
                    .charts
                    .fetch(chart)
                    .await
                    .map_err(|e| ServiceApplyError::ChartFetch(format!("{chart}: {e:#}")))?;
                render_service(
                    ctx,
                    service,
                    RenderSource::Chart {
                        values_yaml: &values_yaml,
                    },
                    &job.render,
                    &job.containers,
                )?
            }
        };
        Ok(rendered)
    }

    async fn apply_once(
        &self,
        ctx: &RenderContext,
        job: &ServiceJob,
        is_retry: bool,
    ) -> Result<Applied, ServiceApplyError> {
        let rendered = self.render(ctx, job).await?;
        let (release_name, chart) = match &job.kind {
            JobKind::Manifest { previous, .. } => {
                let desired = rendered.output.text();
                self.applier
                    .apply(&job.target, previous, desired)
                    .await
                    .map_err(|e| ServiceApplyError::Apply(format!("{e:#}")))?;
                return Ok(Applied {
                    manifest: Some(desired.to_string()),
                    containers: rendered.containers,
                });
            }
            JobKind::HelmTemplate {
                release_name,
                revision,
                ..
            } => (
                release_name,
                ChartSource::Template {
                    revision: *revision,
                },
            ),
            JobKind::HelmChart {
                chart,
                release_name,
            } => (release_name, ChartSource::Remote(chart.clone())),
        };

        let release = HelmRelease {
            target: job.target.clone(),
            release_name: release_name.clone(),
            chart,
            values_yaml: rendered.output.text().to_string(),
        };
        self.helm
            .install_or_upgrade(&release, is_retry)
            .await
            .map_err(|e| ServiceApplyError::Apply(format!("{e:#}")))?;
        debug!(service = %job.service(), release = %release.release_name, is_retry, "release installed");
        Ok(Applied {
            containers: rendered.containers,
            manifest: None,
        })
    }

    /// Remove a service from the cluster.
    pub async fn uninstall(
        &self,
        target: &ApplyTarget,
        kind: &ServiceKind,
    ) -> Result<(), ServiceApplyError> {
        let result = match kind.release_name() {
            Some(release) => self.helm.uninstall(target, release).await,
            None => self.applier.uninstall(target, true).await,
        };
        result.map_err(|e| ServiceApplyError::Apply(format!("uninstall: {e:#}")))?;
        info!(service = %target.service, namespace = %target.namespace, "service uninstalled");
        Ok(())
    }

    /// Scale a service's workloads to zero.
    pub async fn suspend(
        &self,
        target: &ApplyTarget,
    ) -> Result<BTreeMap<String, u32>, ServiceApplyError> {
        self.applier
            .suspend(target)
            .await
            .map_err(|e| ServiceApplyError::Apply(format!("suspend: {e:#}")))
    }

    /// Restore replica counts recorded at suspend time.
    pub async fn resume(
        &self,
        target: &ApplyTarget,
        replicas: &BTreeMap<String, u32>,
    ) -> Result<(), ServiceApplyError> {
        self.applier
            .resume(target, replicas)
            .await
            .map_err(|e| ServiceApplyError::Apply(format!("resume: {e:#}")))
    }
}

fn log_outcome(job: &ServiceJob, result: &Result<Applied, ServiceApplyError>) {
    match result {
        Ok(_) => debug!(service = %job.service(), "service applied"),
        Err(e) => warn!(service = %job.service(), error = %e, "service apply failed"),
    }
}
