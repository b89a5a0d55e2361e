//! Component catalog
//!
//! One immutable catalog maps each well-known component name to its
//! packaging model and artifact locations: config and data paths, binary
//! path, container image and download URL templates, health-check and
//! log-tail commands. Loaded once at startup from an embedded resource.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// How a component is installed and operated on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackagingModel {
    /// Docker container managed by name
    Container,

    /// Static binary driven by a systemd unit
    ServiceUnitBinary,

    /// Plain binary on PATH with no unit
    BareBinary,
}

/// Catalog entry for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,

    pub packaging: PackagingModel,

    pub default_port: u16,

    /// Config files backed up before an upgrade and restored on rollback
    #[serde(default)]
    pub config_paths: Vec<String>,

    /// Data directories archived when `backup_data` is requested
    #[serde(default)]
    pub data_paths: Vec<String>,

    /// Installed binary location (binary packagings only)
    #[serde(default)]
    pub binary_path: Option<String>,

    /// Container image template, `{{version}}` placeholder
    #[serde(default)]
    pub image: Option<String>,

    /// Release archive URL template, `{{version}}` placeholder
    #[serde(default)]
    pub download_url: Option<String>,

    /// Path of the binary inside the release archive, `{{version}}` placeholder
    #[serde(default)]
    pub archive_binary: Option<String>,

    /// Container run command template, `{{image}}` placeholder
    #[serde(default)]
    pub run_command: Option<String>,

    /// systemd unit file template
    #[serde(default)]
    pub systemd_unit: Option<String>,

    /// Config artifact template
    #[serde(default)]
    pub config_template: Option<String>,

    /// Upstream validator invocation, `{{config_path}}` placeholder
    #[serde(default)]
    pub validate_command: Option<String>,

    /// Component-specific health probe run after start
    #[serde(default)]
    pub health_check: Option<String>,

    /// Recent-log command used by post-check
    #[serde(default)]
    pub log_tail: Option<String>,

    /// Unix account the unit runs under
    #[serde(default)]
    pub service_user: Option<String>,
}

impl ComponentSpec {
    /// systemd unit / container name; components use their own name
    pub fn service_name(&self) -> &str {
        &self.name
    }

    /// Conservative defaults for a component the catalog does not know:
    /// a bare binary with the conventional /etc and /var/lib locations.
    pub fn fallback(name: &str) -> Self {
        Self {
            name: name.to_string(),
            packaging: PackagingModel::BareBinary,
            default_port: 0,
            config_paths: vec![format!("/etc/{}/config.yml", name)],
            data_paths: vec![format!("/var/lib/{}", name)],
            binary_path: Some(format!("/usr/local/bin/{}", name)),
            image: None,
            download_url: None,
            archive_binary: None,
            run_command: None,
            systemd_unit: None,
            config_template: None,
            validate_command: None,
            health_check: None,
            log_tail: Some(format!("journalctl -u {} --lines 50", name)),
            service_user: None,
        }
    }
}

/// Config migration script for a major-version boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub component: String,
    pub from_major: u64,
    pub to_major: u64,
    pub script: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    components: Vec<ComponentSpec>,
    #[serde(default)]
    migrations: Vec<Migration>,
}

/// The loaded catalog
#[derive(Debug)]
pub struct Catalog {
    components: HashMap<String, ComponentSpec>,
    migrations: Vec<Migration>,
}

impl Catalog {
    fn from_embedded() -> Self {
        let file: CatalogFile = serde_json::from_str(include_str!("catalog.json"))
            .expect("embedded component catalog is well-formed");
        let components = file
            .components
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self {
            components,
            migrations: file.migrations,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.get(name)
    }

    /// Known spec, or the conventional fallback for unlisted components
    pub fn spec_or_fallback(&self, name: &str) -> ComponentSpec {
        self.components
            .get(name)
            .cloned()
            .unwrap_or_else(|| ComponentSpec::fallback(name))
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.components.keys().map(String::as_str).collect()
    }

    /// Migration script for a (component, fromMajor -> toMajor) boundary
    pub fn migration(&self, component: &str, from_major: u64, to_major: u64) -> Option<&Migration> {
        self.migrations.iter().find(|m| {
            m.component == component && m.from_major == from_major && m.to_major == to_major
        })
    }
}

static CATALOG: Lazy<Catalog> = Lazy::new(Catalog::from_embedded);

/// The process-wide component catalog
pub fn global() -> &'static Catalog {
    &CATALOG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_catalog_parses() {
        let catalog = global();
        assert!(catalog.get("prometheus").is_some());
        assert!(catalog.get("node-exporter").is_some());
    }

    #[test]
    fn test_packaging_models() {
        let catalog = global();
        assert_eq!(
            catalog.get("prometheus").unwrap().packaging,
            PackagingModel::Container
        );
        assert_eq!(
            catalog.get("categraf").unwrap().packaging,
            PackagingModel::ServiceUnitBinary
        );
    }

    #[test]
    fn test_fallback_spec() {
        let spec = global().spec_or_fallback("telegraf");
        assert_eq!(spec.packaging, PackagingModel::BareBinary);
        assert_eq!(spec.config_paths, vec!["/etc/telegraf/config.yml"]);
        assert_eq!(spec.binary_path.as_deref(), Some("/usr/local/bin/telegraf"));
    }

    #[test]
    fn test_migration_lookup() {
        let catalog = global();
        assert!(catalog.migration("prometheus", 2, 3).is_some());
        assert!(catalog.migration("prometheus", 1, 2).is_none());
    }
}
