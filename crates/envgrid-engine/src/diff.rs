//! Revision diff: classify services and plan the next group layout.
//!
//! For the services a caller asked to update, compare the environment with
//! the template's current revision:
//!
//! ```text
//!   requested?  in template?  in env?   →  class
//!   no          -             -            Unchanged  (carried over verbatim)
//!   yes         yes           yes          Updatable
//!   yes         yes           no           Updatable  (added)
//!   yes         no            yes          Deleted
//!   yes (chart) -             any          Updatable  (chart services are not in templates)
//! ```
//!
//! Keys are `name+type`, so a service that changed type is a delete of the
//! old key and an add of the new one.

use std::collections::{BTreeMap, BTreeSet};

use envgrid_core::{Template, TemplateService, TemplateServiceKind};
use envgrid_state::{Environment, ServiceInstance, ServiceKey, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Deleted,
    Updatable { added: bool },
    Unchanged,
}

pub fn template_service_type(service: &TemplateService) -> ServiceType {
    match service.kind {
        TemplateServiceKind::RawManifest { .. } => ServiceType::RawManifest,
        TemplateServiceKind::HelmTemplate { .. } => ServiceType::HelmTemplate,
    }
}

pub fn template_service_key(service: &TemplateService) -> ServiceKey {
    ServiceKey::new(service.name.clone(), template_service_type(service))
}

/// Per-call classification of every service known to the environment or
/// the template. Not persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionRecord {
    entries: BTreeMap<ServiceKey, Classification>,
}

impl RevisionRecord {
    pub fn classify(env: &Environment, template: &Template, update: &BTreeSet<ServiceKey>) -> Self {
        let template_keys: BTreeSet<ServiceKey> =
            template.services().map(template_service_key).collect();
        let env_keys: BTreeSet<ServiceKey> = env.services().map(ServiceInstance::key).collect();

        let mut entries = BTreeMap::new();
        for key in template_keys.iter().chain(&env_keys) {
            let class = if !update.contains(key) {
                Classification::Unchanged
            } else if key.service_type == ServiceType::HelmChart || template_keys.contains(key) {
                Classification::Updatable {
                    added: !env_keys.contains(key),
                }
            } else {
                Classification::Deleted
            };
            entries.insert(key.clone(), class);
        }
        for key in update {
            if key.service_type == ServiceType::HelmChart && !env_keys.contains(key) {
                entries.insert(key.clone(), Classification::Updatable { added: true });
            }
        }
        // A stored instance whose name is being refreshed under another type
        // is replaced, not kept alongside.
        let refreshed: BTreeMap<&str, ServiceType> = entries
            .iter()
            .filter(|(_, c)| matches!(c, Classification::Updatable { .. }))
            .map(|(k, _)| (k.name.as_str(), k.service_type))
            .collect();
        let replaced: Vec<ServiceKey> = env_keys
            .iter()
            .filter(|k| {
                refreshed
                    .get(k.name.as_str())
                    .is_some_and(|ty| *ty != k.service_type)
            })
            .cloned()
            .collect();
        for key in replaced {
            entries.insert(key, Classification::Deleted);
        }
        Self { entries }
    }

    pub fn get(&self, key: &ServiceKey) -> Option<Classification> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServiceKey, Classification)> {
        self.entries.iter().map(|(k, c)| (k, *c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &ServiceKey> {
        self.iter()
            .filter(|(_, c)| *c == Classification::Deleted)
            .map(|(k, _)| k)
    }

    pub fn updatable(&self) -> impl Iterator<Item = &ServiceKey> {
        self.iter()
            .filter(|(_, c)| matches!(c, Classification::Updatable { .. }))
            .map(|(k, _)| k)
    }

    pub fn unchanged(&self) -> impl Iterator<Item = &ServiceKey> {
        self.iter()
            .filter(|(_, c)| *c == Classification::Unchanged)
            .map(|(k, _)| k)
    }

    fn is_updatable(&self, key: &ServiceKey) -> bool {
        matches!(self.get(key), Some(Classification::Updatable { .. }))
    }
}

/// One slot of the next group layout.
#[derive(Debug, Clone, Copy)]
pub enum PlannedService<'a> {
    /// Carried over verbatim.
    Keep(&'a ServiceInstance),
    /// Refreshed to the template's current revision.
    FromTemplate {
        template: &'a TemplateService,
        current: Option<&'a ServiceInstance>,
    },
    /// Chart service updated from the request.
    Chart {
        name: &'a str,
        current: Option<&'a ServiceInstance>,
    },
}

impl PlannedService<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::Keep(service) => &service.name,
            Self::FromTemplate { template, .. } => &template.name,
            Self::Chart { name, .. } => name,
        }
    }
}

/// Lay out the environment's next service groups.
///
/// Template services follow template order. Services the template does not
/// know (chart services, or services kept but no longer templated) stay in
/// the group they were in. Chart services new to the environment join the
/// last group. Deleted services are dropped; trailing empty groups are
/// trimmed.
pub fn plan_groups<'a>(
    env: &'a Environment,
    template: &'a Template,
    record: &'a RevisionRecord,
) -> Vec<Vec<PlannedService<'a>>> {
    let mut groups: Vec<Vec<PlannedService<'a>>> =
        (0..template.groups.len().max(env.groups.len())).map(|_| Vec::new()).collect();
    let find = move |key: &ServiceKey| env.services().find(|s| &s.key() == key);

    let mut template_keys = BTreeSet::new();
    for (index, services) in template.groups.iter().enumerate() {
        for service in services {
            let key = template_service_key(service);
            let current = find(&key);
            if record.is_updatable(&key) {
                groups[index].push(PlannedService::FromTemplate {
                    template: service,
                    current,
                });
            } else if let Some(current) = current {
                groups[index].push(PlannedService::Keep(current));
            }
            template_keys.insert(key);
        }
    }

    for service in env.services() {
        let key = service.key();
        if template_keys.contains(&key) {
            continue;
        }
        let slot = match record.get(&key) {
            Some(Classification::Deleted) => continue,
            Some(Classification::Updatable { .. }) => PlannedService::Chart {
                name: &service.name,
                current: Some(service),
            },
            _ => PlannedService::Keep(service),
        };
        let index = service.position.group.min(groups.len().saturating_sub(1));
        if groups.is_empty() {
            groups.push(Vec::new());
        }
        groups[index].push(slot);
    }

    while groups.last().is_some_and(Vec::is_empty) {
        groups.pop();
    }

    for (key, class) in record.iter() {
        if key.service_type == ServiceType::HelmChart
            && class == (Classification::Updatable { added: true })
        {
            if groups.is_empty() {
                groups.push(Vec::new());
            }
            if let Some(last) = groups.last_mut() {
                last.push(PlannedService::Chart {
                    name: &key.name,
                    current: None,
                });
            }
        }
    }
    groups
}
