//! Global variable bookkeeping and its effect on services.
//!
//! Two separate algorithms decide which services a change touches:
//!
//! - [`propagate`] follows explicit subscriptions. It is what an actual
//!   global-variable update commits.
//! - [`affected_by_default_values`] compares flattened root keys and is only
//!   used to preview a default-values change. It is more conservative and
//!   may disagree with [`propagate`].

use std::collections::{BTreeMap, BTreeSet};

use envgrid_state::{Environment, GlobalVariable, ServiceInstance, ServiceRender, ServiceVariable};
use envgrid_values::{flatten_document, root_key, yaml_equal};
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult, RenderError};

/// Key sets of a requested global-variable update relative to the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalVariableChange {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    /// Keys present on both sides whose value differs.
    pub changed: BTreeSet<String>,
}

impl GlobalVariableChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Validate a requested variable set against the current one.
///
/// A removed key must have no subscribers; an added key must arrive with
/// none.
pub fn diff_global_variables(
    current: &[GlobalVariable],
    requested: &[GlobalVariable],
) -> EngineResult<GlobalVariableChange> {
    let current_map: BTreeMap<&str, &GlobalVariable> =
        current.iter().map(|v| (v.key.as_str(), v)).collect();
    let requested_map: BTreeMap<&str, &GlobalVariable> =
        requested.iter().map(|v| (v.key.as_str(), v)).collect();
    if requested_map.len() != requested.len() {
        return Err(EngineError::Validation(
            "global variable keys must be unique".to_string(),
        ));
    }

    let mut change = GlobalVariableChange::default();
    for (key, variable) in &current_map {
        if !requested_map.contains_key(key) {
            if !variable.related_services.is_empty() {
                return Err(EngineError::KeyInUse {
                    key: key.to_string(),
                    services: variable.related_services.iter().cloned().collect(),
                });
            }
            change.removed.insert(key.to_string());
        }
    }
    for (key, variable) in &requested_map {
        match current_map.get(key) {
            None => {
                if !variable.related_services.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "new global variable {key} cannot have related services"
                    )));
                }
                change.added.insert(key.to_string());
            }
            Some(existing) if existing.value != variable.value => {
                change.changed.insert(key.to_string());
            }
            Some(_) => {}
        }
    }
    Ok(change)
}

/// Result of applying a requested global-variable set to an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    pub change: GlobalVariableChange,
    /// The variable set to store. Subscriptions of surviving keys are kept.
    pub global_variables: Vec<GlobalVariable>,
    /// Regenerated render records of the affected services.
    pub renders: BTreeMap<String, ServiceRender>,
}

/// Explicit-subscription propagation.
///
/// Every subscriber of a changed key gets the new value merged into its
/// render variables and its override YAML regenerated from them. Services
/// not subscribed to a changed key are left alone.
pub fn propagate(env: &Environment, requested: &[GlobalVariable]) -> EngineResult<Propagation> {
    let change = diff_global_variables(&env.global_variables, requested)?;

    let global_variables: Vec<GlobalVariable> = requested
        .iter()
        .map(|v| GlobalVariable {
            key: v.key.clone(),
            value: v.value.clone(),
            related_services: env
                .global_variable(&v.key)
                .map(|existing| existing.related_services.clone())
                .unwrap_or_default(),
        })
        .collect();

    let mut renders: BTreeMap<String, ServiceRender> = BTreeMap::new();
    for key in &change.changed {
        let Some(current) = env.global_variable(key) else {
            continue;
        };
        let Some(value) = requested.iter().find(|v| &v.key == key).map(|v| &v.value) else {
            continue;
        };
        for service in &current.related_services {
            let Some(instance) = env.service(service) else {
                warn!(
                    project = %env.header.project,
                    env = %env.header.name,
                    service = %service,
                    key = %key,
                    "subscribed service not found in environment"
                );
                continue;
            };
            let render = renders
                .entry(service.clone())
                .or_insert_with(|| instance.render.clone());
            set_render_variable(render, key, value.clone());
        }
    }

    for (service, render) in renders.iter_mut() {
        render.regenerate_override_yaml().map_err(RenderError::from)?;
        debug!(service = %service, "override yaml regenerated");
    }

    Ok(Propagation {
        change,
        global_variables,
        renders,
    })
}

/// Point a service's global-backed variable at a new value, adding the
/// variable if the service has none for `key`.
pub fn set_render_variable(render: &mut ServiceRender, key: &str, value: Value) {
    match render
        .variables
        .iter_mut()
        .find(|v| v.key == key && v.use_global_variable)
    {
        Some(variable) => variable.value = value,
        None => render.variables.push(ServiceVariable {
            key: key.to_string(),
            value,
            use_global_variable: true,
        }),
    }
}

/// Rebuild every variable's related-services set from the services' render
/// variables.
pub fn refresh_related_services<'a>(
    variables: &mut [GlobalVariable],
    services: impl IntoIterator<Item = &'a ServiceInstance>,
) {
    let mut subscriptions: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for service in services {
        for variable in service.render.variables.iter().filter(|v| v.use_global_variable) {
            subscriptions
                .entry(variable.key.as_str())
                .or_default()
                .insert(service.name.clone());
        }
    }
    for variable in variables.iter_mut() {
        variable.related_services = subscriptions.remove(variable.key.as_str()).unwrap_or_default();
    }
}

/// Global-backed render variables must reference an existing key.
pub fn validate_render_variables(
    service: &str,
    render: &ServiceRender,
    variables: &[GlobalVariable],
) -> EngineResult<()> {
    for variable in render.variables.iter().filter(|v| v.use_global_variable) {
        if !variables.iter().any(|g| g.key == variable.key) {
            return Err(EngineError::Validation(format!(
                "service {service} uses global variable {} which does not exist",
                variable.key
            )));
        }
    }
    Ok(())
}

/// Whether two variable sets assign the same values, ignoring order and
/// subscriptions.
pub fn variables_equal(a: &[GlobalVariable], b: &[GlobalVariable]) -> bool {
    let map = |vars: &[GlobalVariable]| -> BTreeMap<String, Value> {
        vars.iter().map(|v| (v.key.clone(), v.value.clone())).collect()
    };
    a.len() == b.len() && map(a) == map(b)
}

/// Flat-key containment heuristic for a default-values change.
///
/// Returns the names of services the change may affect. A service is
/// unaffected only when its own overrides cover every changed root key.
pub fn affected_by_default_values<'a>(
    current: &str,
    requested: &str,
    services: impl IntoIterator<Item = &'a ServiceInstance>,
) -> EngineResult<Vec<String>> {
    let invalid = |e: envgrid_values::ValuesError| EngineError::Validation(e.to_string());
    if yaml_equal(current, requested).map_err(invalid)? {
        return Ok(Vec::new());
    }
    let current = flatten_document(current).map_err(invalid)?;
    let requested = flatten_document(requested).map_err(invalid)?;

    let changed_roots: BTreeSet<&str> = current
        .keys()
        .chain(requested.keys())
        .filter(|k| current.get(*k) != requested.get(*k))
        .map(|k| root_key(k))
        .collect();

    let mut affected = Vec::new();
    for service in services {
        let render = &service.render;
        if render.is_empty() {
            affected.push(service.name.clone());
            continue;
        }
        let own = flatten_document(&render.override_yaml).map_err(invalid)?;
        let mut own_roots: BTreeSet<&str> = own.keys().map(|k| root_key(k)).collect();
        own_roots.extend(render.override_values.iter().map(|kv| root_key(&kv.key)));

        if !own_roots.is_superset(&changed_roots) {
            affected.push(service.name.clone());
        }
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envgrid_state::{
        EnvStatus, EnvironmentHeader, ServiceKind, ServicePosition,
    };
    use envgrid_values::KeyValue;

    fn service(name: &str, render: ServiceRender) -> ServiceInstance {
        ServiceInstance {
            name: name.to_string(),
            kind: ServiceKind::RawManifest {
                template: String::new(),
                applied_manifest: String::new(),
            },
            revision: 1,
            containers: Vec::new(),
            render,
            error: None,
            updated_at: 0,
            position: ServicePosition::default(),
        }
    }

    fn global_render(key: &str, value: i64) -> ServiceRender {
        let mut render = ServiceRender {
            variables: vec![ServiceVariable {
                key: key.to_string(),
                value: Value::from(value),
                use_global_variable: true,
            }],
            ..ServiceRender::default()
        };
        render.regenerate_override_yaml().unwrap();
        render
    }

    fn env() -> Environment {
        let untouched = ServiceRender {
            override_yaml: "debug: true\n".to_string(),
            ..ServiceRender::default()
        };
        let mut env = Environment {
            header: EnvironmentHeader {
                project: "shop".into(),
                name: "dev".into(),
                namespace: "shop-dev".into(),
                cluster_id: "local".into(),
                default_values: String::new(),
                status: EnvStatus::Running,
                error: None,
                revision: 4,
                created_at: 0,
                updated_at: 0,
                pre_sleep_replicas: BTreeMap::new(),
            },
            groups: vec![vec![
                service("web", global_render("replica", 2)),
                service("api", global_render("region", 1)),
                service("db", untouched),
            ]],
            global_variables: vec![
                GlobalVariable::new("replica", 2).with_related(["web"]),
                GlobalVariable::new("region", "eu").with_related(["api"]),
                GlobalVariable::new("unused", "x"),
            ],
            deploy_strategy: BTreeMap::new(),
        };
        env.reindex();
        env
    }

    fn requested(overrides: &[(&str, Value)]) -> Vec<GlobalVariable> {
        let mut vars: Vec<GlobalVariable> = env()
            .global_variables
            .iter()
            .map(|v| GlobalVariable::new(v.key.clone(), v.value.clone()))
            .collect();
        for (key, value) in overrides {
            if let Some(v) = vars.iter_mut().find(|v| v.key == *key) {
                v.value = value.clone();
            }
        }
        vars
    }

    #[test]
    fn changed_value_regenerates_only_subscribers() {
        let env = env();
        let result = propagate(&env, &requested(&[("replica", Value::from(3))])).unwrap();

        assert_eq!(result.change.changed, BTreeSet::from(["replica".to_string()]));
        assert_eq!(result.renders.len(), 1);
        let web = &result.renders["web"];
        assert_eq!(web.override_yaml, "replica: 3\n");
        assert_eq!(web.variables[0].value, Value::from(3));

        // Subscriptions survive the update.
        let replica = result.global_variables.iter().find(|v| v.key == "replica").unwrap();
        assert_eq!(replica.value, Value::from(3));
        assert!(replica.related_services.contains("web"));
    }

    #[test]
    fn removing_subscribed_key_is_key_in_use() {
        let env = env();
        let without_region: Vec<_> = requested(&[])
            .into_iter()
            .filter(|v| v.key != "region")
            .collect();

        for _ in 0..2 {
            let err = propagate(&env, &without_region).unwrap_err();
            match err {
                EngineError::KeyInUse { key, services } => {
                    assert_eq!(key, "region");
                    assert_eq!(services, vec!["api".to_string()]);
                }
                other => panic!("expected KeyInUse, got {other:?}"),
            }
        }
    }

    #[test]
    fn removing_unsubscribed_key_is_allowed() {
        let env = env();
        let vars: Vec<_> = requested(&[]).into_iter().filter(|v| v.key != "unused").collect();
        let result = propagate(&env, &vars).unwrap();
        assert_eq!(result.change.removed, BTreeSet::from(["unused".to_string()]));
        assert!(result.renders.is_empty());
    }

    #[test]
    fn new_key_with_subscribers_is_rejected() {
        let env = env();
        let mut vars = requested(&[]);
        vars.push(GlobalVariable::new("zone", "a").with_related(["web"]));
        assert!(matches!(
            propagate(&env, &vars),
            Err(EngineError::Validation(_))
        ));

        let mut vars = requested(&[]);
        vars.push(GlobalVariable::new("zone", "a"));
        let result = propagate(&env, &vars).unwrap();
        assert_eq!(result.change.added, BTreeSet::from(["zone".to_string()]));
        assert!(result.renders.is_empty());
    }

    #[test]
    fn related_services_follow_render_variables() {
        let mut env = env();
        let services: Vec<ServiceInstance> = env.services().cloned().collect();
        env.global_variables[1].related_services.clear();
        refresh_related_services(&mut env.global_variables, &services);

        assert_eq!(
            env.global_variables[1].related_services,
            BTreeSet::from(["api".to_string()])
        );
        assert!(env.global_variables[2].related_services.is_empty());
    }

    #[test]
    fn render_variable_must_reference_existing_key() {
        let env = env();
        let render = global_render("missing", 1);
        assert!(matches!(
            validate_render_variables("web", &render, &env.global_variables),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_render_variables("web", &global_render("replica", 1), &env.global_variables).is_ok());
    }

    #[test]
    fn heuristic_equal_documents_affect_nothing() {
        let env = env();
        let affected =
            affected_by_default_values("a: 1\nb: 2\n", "b: 2\na: 1\n", env.services()).unwrap();
        assert!(affected.is_empty());
    }

    #[test]
    fn heuristic_spares_services_shadowing_every_changed_root() {
        let shadowing = ServiceRender {
            override_yaml: "image:\n  tag: pinned\n".to_string(),
            override_values: vec![KeyValue::new("ports[0].port", 80)],
            ..ServiceRender::default()
        };
        let partial = ServiceRender {
            override_yaml: "image:\n  tag: pinned\n".to_string(),
            ..ServiceRender::default()
        };
        let services = vec![
            service("covered", shadowing),
            service("partial", partial),
            service("bare", ServiceRender::default()),
        ];

        let affected = affected_by_default_values(
            "image:\n  tag: v1\nports:\n  - port: 8080\n",
            "image:\n  tag: v2\nports:\n  - port: 9090\n",
            &services,
        )
        .unwrap();
        assert_eq!(affected, vec!["partial".to_string(), "bare".to_string()]);
    }

    #[test]
    fn variables_equal_ignores_order_and_subscriptions() {
        let a = vec![
            GlobalVariable::new("a", 1).with_related(["web"]),
            GlobalVariable::new("b", 2),
        ];
        let b = vec![GlobalVariable::new("b", 2), GlobalVariable::new("a", 1)];
        assert!(variables_equal(&a, &b));
        assert!(!variables_equal(&a, &b[..1]));
    }
}
