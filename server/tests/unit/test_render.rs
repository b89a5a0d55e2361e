//! Artifact renderer unit tests

use monplane::catalog;
use monplane::errors::ControlError;
use monplane::render::{
    render_artifact, render_download_url, render_run_command, render_str, ArtifactKind, Variables,
};
use serde_json::Value;

fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_config_render_with_variables() {
    let spec = catalog::global().get("prometheus").unwrap();
    let artifact = render_artifact(
        spec,
        ArtifactKind::ConfigFile,
        &vars(&[
            ("scrape_interval", Value::from("15s")),
            ("job_name", Value::from("node")),
            ("scrape_target", Value::from("10.0.0.5:9100")),
        ]),
    )
    .unwrap();

    assert_eq!(artifact.target_path, "/etc/prometheus/prometheus.yml");
    assert_eq!(artifact.mode, 0o644);
    assert!(artifact.content.contains("scrape_interval: 15s"));
    assert!(artifact.content.contains("job_name: 'node'"));
    assert!(artifact.content.contains("targets: ['10.0.0.5:9100']"));
}

#[test]
fn test_config_render_target_path_override() {
    let spec = catalog::global().get("prometheus").unwrap();
    let artifact = render_artifact(
        spec,
        ArtifactKind::ConfigFile,
        &vars(&[
            ("scrape_interval", Value::from("30s")),
            ("job_name", Value::from("edge")),
            ("scrape_target", Value::from("10.0.0.9:9100")),
            ("target_path", Value::from("/etc/prometheus/edge.yml")),
        ]),
    )
    .unwrap();
    assert_eq!(artifact.target_path, "/etc/prometheus/edge.yml");
}

#[test]
fn test_missing_variable_names_the_placeholder() {
    let spec = catalog::global().get("prometheus").unwrap();
    let err = render_artifact(spec, ArtifactKind::ConfigFile, &Variables::new()).unwrap_err();
    match err {
        ControlError::TemplateUnresolved(name) => {
            assert_eq!(name, "scrape_interval");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_run_command_embeds_versioned_image() {
    let spec = catalog::global().get("victoriametrics").unwrap();
    let cmd = render_run_command(spec, "1.96.0").unwrap();
    assert!(cmd.contains("victoriametrics/victoria-metrics:1.96.0"));
    assert!(cmd.contains("--restart=unless-stopped"));
}

#[test]
fn test_download_url_substitutes_version_everywhere() {
    let spec = catalog::global().get("categraf").unwrap();
    let url = render_download_url(spec, "0.3.60").unwrap();
    assert_eq!(
        url,
        "https://github.com/flashcatcloud/categraf/releases/download/v0.3.60/categraf-v0.3.60-linux-amd64.tar.gz"
    );
}

#[test]
fn test_unit_render_for_component_without_unit_fails() {
    let spec = catalog::global().get("prometheus").unwrap();
    let err = render_artifact(spec, ArtifactKind::SystemdUnit, &Variables::new()).unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[test]
fn test_render_str_whitespace_tolerant_placeholders() {
    let out = render_str("{{ name }} up", &vars(&[("name", Value::from("vmagent"))])).unwrap();
    assert_eq!(out, "vmagent up");
}
