pub mod config;
pub mod template;

pub use config::EnvgridConfig;
pub use template::{
    ContainerSpec, Template, TemplateError, TemplateService, TemplateServiceKind,
    TemplateVariable,
};
