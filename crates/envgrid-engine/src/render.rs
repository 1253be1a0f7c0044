//! Render pipeline: layered values → manifest text or Helm values.
//!
//! Layers, lowest precedence first:
//!
//! 1. the environment's default-values document
//! 2. the chart's own `values.yaml` (Helm services only)
//! 3. the service's override YAML
//! 4. the service's override key/values, applied last as path assignments
//!
//! Mappings merge deeply, sequences are replaced wholesale. Raw manifests
//! then get their built-in placeholders and `{{.path}}` lookups substituted.

use envgrid_state::{Container, ServiceRender};
use envgrid_values::{
    FlatMap, apply_key_values, derive_image_uri, flatten, merge_documents, scalar_to_string,
    to_yaml_string,
};
use regex::{Captures, Regex};
use serde_yaml::Value;

use crate::error::RenderError;

/// Environment-level inputs shared by every service of one render pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    pub project: String,
    pub env_name: String,
    pub namespace: String,
    pub default_values: String,
}

impl RenderContext {
    /// Substitute `$Namespace$`, `$EnvName$`, `$Product$` and `$Service$`.
    pub fn substitute_builtins(&self, text: &str, service: &str) -> String {
        text.replace("$Namespace$", &self.namespace)
            .replace("$EnvName$", &self.env_name)
            .replace("$Product$", &self.project)
            .replace("$Service$", service)
    }

    /// Release name for a service under a naming template.
    pub fn release_name(&self, naming: &str, service: &str) -> String {
        self.substitute_builtins(naming, service)
    }
}

/// What a service renders from.
#[derive(Debug, Clone, Copy)]
pub enum RenderSource<'a> {
    Manifest(&'a str),
    Chart { values_yaml: &'a str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedOutput {
    Manifest(String),
    Values(String),
}

impl RenderedOutput {
    pub fn text(&self) -> &str {
        match self {
            Self::Manifest(text) | Self::Values(text) => text,
        }
    }
}

/// A service ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedService {
    pub output: RenderedOutput,
    /// Containers with the images this deploy runs.
    pub containers: Vec<Container>,
}

/// Merge the four value layers.
pub fn merge_values(
    default_values: &str,
    chart_values: Option<&str>,
    render: &ServiceRender,
) -> Result<Value, RenderError> {
    let mut merged = merge_documents([
        default_values,
        chart_values.unwrap_or_default(),
        render.override_yaml.as_str(),
    ])?;
    apply_key_values(&mut merged, &render.override_values)?;
    Ok(merged)
}

/// Replace `{{.dotted.path}}` lookups with values from `flat`.
pub fn substitute_values(text: &str, flat: &FlatMap) -> Result<String, RenderError> {
    let pattern = Regex::new(r"\{\{\s*\.([A-Za-z0-9_\-.\[\]]+)\s*\}\}")?;
    let mut missing = None;
    let rendered = pattern.replace_all(text, |caps: &Captures<'_>| {
        let path = &caps[1];
        match flat.get(path) {
            Some(value) => scalar_to_string(value),
            None => {
                missing.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(path) => Err(RenderError::Unresolved(path)),
        None => Ok(rendered.into_owned()),
    }
}

/// Derive each container's image from the merged values where it has a
/// search pattern; other containers keep their declared image.
pub fn resolve_images(
    containers: &[Container],
    flat: &FlatMap,
) -> Result<Vec<Container>, RenderError> {
    containers
        .iter()
        .map(|container| {
            let image = match &container.image_path {
                Some(pattern) => derive_image_uri(pattern, flat)?,
                None => container.image.clone(),
            };
            Ok(Container {
                image,
                ..container.clone()
            })
        })
        .collect()
}

/// Produce the manifest (or Helm values) and image list for one service.
pub fn render_service(
    ctx: &RenderContext,
    service: &str,
    source: RenderSource<'_>,
    render: &ServiceRender,
    containers: &[Container],
) -> Result<RenderedService, RenderError> {
    let chart_values = match source {
        RenderSource::Manifest(_) => None,
        RenderSource::Chart { values_yaml } => Some(values_yaml),
    };
    let merged = merge_values(&ctx.default_values, chart_values, render)?;
    let flat = flatten(&merged);
    let containers = resolve_images(containers, &flat)?;

    let output = match source {
        RenderSource::Manifest(template) => {
            let text = ctx.substitute_builtins(template, service);
            RenderedOutput::Manifest(substitute_values(&text, &flat)?)
        }
        RenderSource::Chart { .. } => RenderedOutput::Values(to_yaml_string(&merged)?),
    };
    Ok(RenderedService { output, containers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use envgrid_values::{ImageSearchPattern, KeyValue, parse_document};

    fn ctx() -> RenderContext {
        RenderContext {
            project: "shop".into(),
            env_name: "dev".into(),
            namespace: "shop-dev".into(),
            default_values: "replica: 1\nimage:\n  repository: shop/web\n  tag: v0\n".into(),
        }
    }

    #[test]
    fn override_values_win_over_override_yaml() {
        let render = ServiceRender {
            override_yaml: "image:\n  tag: v1\n".into(),
            override_values: vec![KeyValue::new("image.tag", "v2")],
            ..ServiceRender::default()
        };
        let merged = merge_values("", None, &render).unwrap();
        assert_eq!(merged["image"]["tag"], Value::from("v2"));
    }

    #[test]
    fn layer_precedence_is_default_chart_override_kv() {
        let render = ServiceRender {
            override_yaml: "b: override\nlist: [3]\n".into(),
            override_values: vec![KeyValue::new("c", "kv")],
            ..ServiceRender::default()
        };
        let merged = merge_values(
            "a: default\nb: default\nc: default\nd: default\n",
            Some("a: chart\nb: chart\nlist: [1, 2]\n"),
            &render,
        )
        .unwrap();
        let expected = parse_document(
            "a: chart\nb: override\nc: kv\nd: default\nlist: [3]\n",
        )
        .unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn merging_kv_last_matches_single_pass() {
        // Grouping the first three layers into one document first does not
        // change the result.
        let render = ServiceRender {
            override_yaml: "image:\n  tag: v1\n".into(),
            override_values: vec![KeyValue::new("image.tag", "v2"), KeyValue::new("x.y", 1)],
            ..ServiceRender::default()
        };
        let default = "image:\n  repository: r\n";
        let chart = "x:\n  z: 2\n";
        let single = merge_values(default, Some(chart), &render).unwrap();

        let base = to_yaml_string(
            &merge_documents([default, chart, render.override_yaml.as_str()]).unwrap(),
        )
        .unwrap();
        let kv_only = ServiceRender {
            override_values: render.override_values.clone(),
            ..ServiceRender::default()
        };
        let grouped = merge_values(&base, None, &kv_only).unwrap();
        assert_eq!(single, grouped);
    }

    #[test]
    fn manifest_placeholders_are_substituted() {
        let template = "metadata:\n  name: $Service$\n  namespace: $Namespace$\n\
                        spec:\n  replicas: {{.replica}}\n  image: {{ .image.repository }}:{{.image.tag}}\n";
        let rendered =
            render_service(&ctx(), "web", RenderSource::Manifest(template), &ServiceRender::default(), &[])
                .unwrap();
        assert_eq!(
            rendered.output,
            RenderedOutput::Manifest(
                "metadata:\n  name: web\n  namespace: shop-dev\n\
                 spec:\n  replicas: 1\n  image: shop/web:v0\n"
                    .into()
            )
        );
    }

    #[test]
    fn unresolved_placeholder_is_render_error() {
        let result = render_service(
            &ctx(),
            "web",
            RenderSource::Manifest("port: {{.service.port}}"),
            &ServiceRender::default(),
            &[],
        );
        assert!(matches!(result, Err(RenderError::Unresolved(p)) if p == "service.port"));
    }

    #[test]
    fn chart_values_and_images_derive_from_merged_layers() {
        let render = ServiceRender {
            override_values: vec![KeyValue::new("image.tag", "v7")],
            ..ServiceRender::default()
        };
        let containers = vec![Container {
            name: "web".into(),
            image: "shop/web:v0".into(),
            image_path: Some(ImageSearchPattern {
                image: "image.repository".into(),
                tag: Some("image.tag".into()),
                ..ImageSearchPattern::default()
            }),
        }];
        let rendered = render_service(
            &ctx(),
            "web",
            RenderSource::Chart {
                values_yaml: "service:\n  port: 80\n",
            },
            &render,
            &containers,
        )
        .unwrap();

        assert_eq!(rendered.containers[0].image, "shop/web:v7");
        let values = parse_document(rendered.output.text()).unwrap();
        assert_eq!(values["service"]["port"], Value::from(80));
        assert_eq!(values["replica"], Value::from(1));

        // Deriving again from the same inputs gives the same images.
        let again = render_service(
            &ctx(),
            "web",
            RenderSource::Chart {
                values_yaml: "service:\n  port: 80\n",
            },
            &render,
            &rendered.containers,
        )
        .unwrap();
        assert_eq!(again.containers, rendered.containers);
    }

    #[test]
    fn release_naming_uses_builtins() {
        assert_eq!(ctx().release_name("$Service$-$EnvName$", "web"), "web-dev");
        assert_eq!(
            ctx().release_name("$Product$-$Namespace$-$Service$", "api"),
            "shop-shop-dev-api"
        );
    }
}
