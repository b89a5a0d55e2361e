//! Component catalog unit tests

use monplane::catalog::{self, PackagingModel};

#[test]
fn test_all_expected_components_present() {
    let names = catalog::global().component_names();
    for expected in [
        "prometheus",
        "grafana",
        "victoriametrics",
        "alertmanager",
        "vmagent",
        "vmalert",
        "snmp-exporter",
        "node-exporter",
        "categraf",
    ] {
        assert!(names.contains(&expected), "missing {expected}");
    }
}

#[test]
fn test_container_components_carry_run_commands() {
    let catalog = catalog::global();
    for name in ["prometheus", "grafana", "alertmanager", "victoriametrics"] {
        let spec = catalog.get(name).unwrap();
        assert_eq!(spec.packaging, PackagingModel::Container);
        assert!(spec.image.is_some(), "{name} has no image");
        assert!(spec.run_command.is_some(), "{name} has no run command");
        assert!(spec.health_check.is_some(), "{name} has no health check");
    }
}

#[test]
fn test_binary_components_carry_units_and_urls() {
    let catalog = catalog::global();
    for name in ["node-exporter", "categraf"] {
        let spec = catalog.get(name).unwrap();
        assert_eq!(spec.packaging, PackagingModel::ServiceUnitBinary);
        assert!(spec.binary_path.is_some());
        assert!(spec.download_url.is_some());
        assert!(spec.archive_binary.is_some());
        assert!(spec.systemd_unit.is_some());
    }
}

#[test]
fn test_validators_for_known_components() {
    let catalog = catalog::global();
    assert!(catalog
        .get("prometheus")
        .unwrap()
        .validate_command
        .as_deref()
        .unwrap()
        .contains("promtool"));
    assert!(catalog
        .get("snmp-exporter")
        .unwrap()
        .validate_command
        .as_deref()
        .unwrap()
        .contains("--dry-run"));
    assert!(catalog
        .get("categraf")
        .unwrap()
        .validate_command
        .as_deref()
        .unwrap()
        .contains("--test"));
    // grafana falls through to the generic YAML check
    assert!(catalog.get("grafana").unwrap().validate_command.is_none());
}

#[test]
fn test_fallback_for_unknown_component() {
    let spec = catalog::global().spec_or_fallback("telegraf");
    assert_eq!(spec.name, "telegraf");
    assert_eq!(spec.packaging, PackagingModel::BareBinary);
    assert_eq!(
        spec.log_tail.as_deref(),
        Some("journalctl -u telegraf --lines 50")
    );
}

#[test]
fn test_migration_boundaries() {
    let catalog = catalog::global();
    let migration = catalog.migration("prometheus", 2, 3).unwrap();
    assert!(migration.script.contains("/etc/prometheus/prometheus.yml"));
    assert!(catalog.migration("prometheus", 3, 2).is_none());
    assert!(catalog.migration("node-exporter", 1, 2).is_none());
}
