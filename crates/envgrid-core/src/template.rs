//! Template catalog model.
//!
//! A template is the read-only desired service set of a project: ordered
//! service groups as authored, the global variables it declares and the
//! default-values document new environments start from. Templates are
//! authored as YAML:
//!
//! ```yaml
//! project: shop
//! default_values: |
//!   replica: 1
//! global_variables:
//!   - key: replica
//!     value: 1
//! groups:
//!   - - name: db
//!       revision: 3
//!       type: raw_manifest
//!       manifest: |
//!         kind: Deployment
//!         metadata: { name: db, namespace: $Namespace$ }
//!       containers:
//!         - { name: db, image: postgres:15 }
//!   - - name: web
//!       revision: 7
//!       type: helm_template
//!       values_yaml: |
//!         image: { repository: shop/web, tag: v1 }
//!       containers:
//!         - name: web
//!           image: shop/web:v1
//!           image_path: { image: image.repository, tag: image.tag }
//! ```

use std::collections::HashSet;

use envgrid_values::ImageSearchPattern;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),

    #[error("service {0} declared more than once")]
    DuplicateService(String),

    #[error("template has an empty service name")]
    EmptyName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub project: String,
    #[serde(default)]
    pub default_values: String,
    #[serde(default)]
    pub global_variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub groups: Vec<Vec<TemplateService>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_path: Option<ImageSearchPattern>,
}

/// One service definition at its current revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateService {
    pub name: String,
    pub revision: u64,
    #[serde(flatten)]
    pub kind: TemplateServiceKind,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    /// Render variables a fresh deploy of the service starts with.
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateServiceKind {
    RawManifest {
        manifest: String,
    },
    HelmTemplate {
        /// The chart's own `values.yaml`.
        #[serde(default)]
        values_yaml: String,
        /// Overrides the configured release naming template.
        #[serde(default)]
        release_naming: Option<String>,
    },
}

impl Template {
    pub fn from_yaml(text: &str) -> Result<Self, TemplateError> {
        let template: Template =
            serde_yaml::from_str(text).map_err(|e| TemplateError::Parse(e.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    fn validate(&self) -> Result<(), TemplateError> {
        let mut seen = HashSet::new();
        for service in self.services() {
            if service.name.is_empty() {
                return Err(TemplateError::EmptyName);
            }
            if !seen.insert(service.name.as_str()) {
                return Err(TemplateError::DuplicateService(service.name.clone()));
            }
        }
        Ok(())
    }

    pub fn services(&self) -> impl Iterator<Item = &TemplateService> {
        self.groups.iter().flatten()
    }

    pub fn service(&self, name: &str) -> Option<&TemplateService> {
        self.services().find(|s| s.name == name)
    }
}
