//! envgrid-engine — environment reconciliation.
//!
//! Drives an environment's stored desired state towards its project
//! template and propagates variable changes into the affected services.
//! The [`Reconciler`]:
//!
//! - Diffs the environment against the template for the requested services
//! - Commits the next desired state atomically before touching the cluster
//! - Applies service groups in order, with bounded retry for Helm releases
//! - Propagates global variables to their subscribed services only
//! - Serialises updates per project with named locks
//!
//! # Architecture
//!
//! ```text
//! Reconciler
//!   ├── LockRegistry ("update:{project}", "bulk-update")
//!   ├── StateStore (environment documents, transactional commit)
//!   ├── TemplateSource (current project template)
//!   ├── diff / variables (pure planning, no I/O)
//!   └── ApplyExecutor
//!       ├── render (defaults → chart values → overrides → key/values)
//!       ├── ResourceApplier (raw manifests, one attempt)
//!       ├── HelmClient (retry batch, staggered passes)
//!       └── ChartFetcher (remote chart values)
//! ```

pub mod collaborators;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod executor;
pub mod lock;
pub mod render;
pub mod variables;

pub use collaborators::{
    ApplyTarget, ChartFetcher, ChartSource, Collaborators, HelmClient, HelmRelease,
    ResourceApplier, TemplateSource,
};
pub use coordinator::{
    ApplyJob, BulkUpdateReport, ChartDeploy, CreateEnvironmentRequest, EnvStatusReport,
    Reconciler, ServiceDiff, ServiceStatus, ServiceUpdate,
};
pub use error::{ApplyFailures, EngineError, EngineResult, RenderError, ServiceApplyError};
pub use executor::{ApplyExecutor, RetryPolicy};
pub use lock::LockRegistry;
