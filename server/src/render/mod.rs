//! Configuration artifact rendering
//!
//! Templates come from the component catalog and use `{{name}}`
//! placeholders with flat string/number/bool variables. Rendering never
//! touches the remote host and never runs upstream validators; the
//! deployment pipeline does that on the target.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::catalog::ComponentSpec;
use crate::errors::ControlError;

/// Variable map for template rendering
pub type Variables = HashMap<String, Value>;

/// What kind of artifact a template produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    ConfigFile,
    SystemdUnit,
}

/// A rendered configuration file destined for one remote path
#[derive(Debug, Clone)]
pub struct Artifact {
    pub target_path: String,
    pub content: String,
    pub mode: u32,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex"));

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Substitute `{{name}}` placeholders. Any placeholder without a variable,
/// or bound to a non-scalar value, fails the render.
pub fn render_str(template: &str, vars: &Variables) -> Result<String, ControlError> {
    let mut missing: Option<String> = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match vars.get(name).and_then(value_to_string) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ControlError::TemplateUnresolved(name)),
        None => Ok(rendered.into_owned()),
    }
}

/// Catalog-derived defaults every template may reference
fn base_vars(spec: &ComponentSpec) -> Variables {
    let mut vars = Variables::new();
    vars.insert("component".to_string(), Value::from(spec.name.clone()));
    vars.insert("port".to_string(), Value::from(spec.default_port));
    if let Some(path) = &spec.binary_path {
        vars.insert("binary_path".to_string(), Value::from(path.clone()));
    }
    if let Some(user) = &spec.service_user {
        vars.insert("service_user".to_string(), Value::from(user.clone()));
    }
    vars
}

fn merged_vars(spec: &ComponentSpec, vars: &Variables) -> Variables {
    let mut merged = base_vars(spec);
    merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Render a file artifact for a component from its catalog template
pub fn render_artifact(
    spec: &ComponentSpec,
    kind: ArtifactKind,
    vars: &Variables,
) -> Result<Artifact, ControlError> {
    let merged = merged_vars(spec, vars);
    match kind {
        ArtifactKind::ConfigFile => {
            let template = spec.config_template.as_deref().ok_or_else(|| {
                ControlError::NotFound(format!("no config template for component {}", spec.name))
            })?;
            let target_path = match merged.get("target_path").and_then(value_to_string) {
                Some(path) => path,
                None => spec
                    .config_paths
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        ControlError::ConfigError(format!(
                            "component {} has no config path",
                            spec.name
                        ))
                    })?,
            };
            Ok(Artifact {
                target_path,
                content: render_str(template, &merged)?,
                mode: 0o644,
                owner_user: None,
                owner_group: None,
            })
        }
        ArtifactKind::SystemdUnit => {
            let template = spec.systemd_unit.as_deref().ok_or_else(|| {
                ControlError::NotFound(format!("no systemd unit template for {}", spec.name))
            })?;
            Ok(Artifact {
                target_path: format!("/etc/systemd/system/{}.service", spec.service_name()),
                content: render_str(template, &merged)?,
                mode: 0o644,
                owner_user: None,
                owner_group: None,
            })
        }
    }
}

/// Render a component's container image reference for a version
pub fn render_image(spec: &ComponentSpec, version: &str) -> Result<String, ControlError> {
    let template = spec
        .image
        .as_deref()
        .ok_or_else(|| ControlError::NotFound(format!("no image template for {}", spec.name)))?;
    let mut vars = Variables::new();
    vars.insert("version".to_string(), Value::from(version));
    render_str(template, &vars)
}

/// Render the container run command for a version
pub fn render_run_command(spec: &ComponentSpec, version: &str) -> Result<String, ControlError> {
    let template = spec.run_command.as_deref().ok_or_else(|| {
        ControlError::NotFound(format!("no run command template for {}", spec.name))
    })?;
    let mut vars = base_vars(spec);
    vars.insert("version".to_string(), Value::from(version));
    vars.insert("image".to_string(), Value::from(render_image(spec, version)?));
    render_str(template, &vars)
}

/// Render the release archive URL for a version
pub fn render_download_url(spec: &ComponentSpec, version: &str) -> Result<String, ControlError> {
    let template = spec.download_url.as_deref().ok_or_else(|| {
        ControlError::NotFound(format!("no download URL template for {}", spec.name))
    })?;
    let mut vars = Variables::new();
    vars.insert("version".to_string(), Value::from(version));
    render_str(template, &vars)
}

/// Render the path of the binary inside the release archive
pub fn render_archive_binary(spec: &ComponentSpec, version: &str) -> Result<String, ControlError> {
    let template = spec.archive_binary.as_deref().ok_or_else(|| {
        ControlError::NotFound(format!("no archive layout for {}", spec.name))
    })?;
    let mut vars = Variables::new();
    vars.insert("version".to_string(), Value::from(version));
    render_str(template, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_str_substitutes() {
        let out = render_str(
            "listen on {{port}}, debug={{debug}}",
            &vars(&[("port", Value::from(9100)), ("debug", Value::from(false))]),
        )
        .unwrap();
        assert_eq!(out, "listen on 9100, debug=false");
    }

    #[test]
    fn test_render_str_unresolved_fails() {
        let err = render_str("host={{host}}", &Variables::new()).unwrap_err();
        match err {
            ControlError::TemplateUnresolved(name) => assert_eq!(name, "host"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_render_str_rejects_non_scalar() {
        let err = render_str(
            "v={{list}}",
            &vars(&[("list", serde_json::json!([1, 2]))]),
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::TemplateUnresolved(_)));
    }

    #[test]
    fn test_render_run_command() {
        let spec = catalog::global().get("prometheus").unwrap();
        let cmd = render_run_command(spec, "3.0.1").unwrap();
        assert!(cmd.contains("prom/prometheus:3.0.1"));
        assert!(cmd.contains("--config.file=/etc/prometheus/prometheus.yml"));
    }

    #[test]
    fn test_render_systemd_unit() {
        let spec = catalog::global().get("node-exporter").unwrap();
        let artifact = render_artifact(spec, ArtifactKind::SystemdUnit, &Variables::new()).unwrap();
        assert_eq!(artifact.target_path, "/etc/systemd/system/node-exporter.service");
        assert!(artifact.content.contains("ExecStart=/usr/local/bin/node_exporter"));
        assert!(artifact.content.contains("User=node_exporter"));
    }

    #[test]
    fn test_render_download_url() {
        let spec = catalog::global().get("node-exporter").unwrap();
        let url = render_download_url(spec, "1.7.0").unwrap();
        assert!(url.contains("v1.7.0/node_exporter-1.7.0.linux-amd64.tar.gz"));
    }
}
