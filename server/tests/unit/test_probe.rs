//! Version detection unit tests

use std::cmp::Ordering;

use monplane::probe::{compare_versions, extract_version, parse_exec_start};

#[test]
fn test_compare_versions_is_numeric_not_lexical() {
    assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
    assert_eq!(compare_versions("1.9.9", "1.10.0"), Ordering::Less);
}

#[test]
fn test_compare_versions_pads_missing_elements() {
    assert_eq!(compare_versions("1.7", "1.7.0"), Ordering::Equal);
    assert_eq!(compare_versions("2", "2.0.0"), Ordering::Equal);
    assert_eq!(compare_versions("2", "2.0.1"), Ordering::Less);
}

#[test]
fn test_compare_versions_ignores_suffixes() {
    // leading digits only, as the upstream tools print them
    assert_eq!(compare_versions("1.7.0-rc1", "1.7.0"), Ordering::Equal);
}

#[test]
fn test_extract_version_word_form() {
    let output = "node_exporter, version 1.6.1 (branch: HEAD, revision: 4a1b1...)";
    assert_eq!(extract_version(output).as_deref(), Some("1.6.1"));
}

#[test]
fn test_extract_version_v_prefix() {
    assert_eq!(
        extract_version("Prometheus V2.48.0").as_deref(),
        Some("2.48.0")
    );
}

#[test]
fn test_extract_version_bare_triplet() {
    assert_eq!(extract_version("categraf 0.3.60").as_deref(), Some("0.3.60"));
}

#[test]
fn test_extract_version_first_line_wins() {
    let output = "tool version 3.2.1\nbuilt with go 1.21.0";
    assert_eq!(extract_version(output).as_deref(), Some("3.2.1"));
}

#[test]
fn test_extract_version_none() {
    assert_eq!(extract_version("usage: tool [flags]"), None);
}

#[test]
fn test_parse_exec_start_plain() {
    assert_eq!(
        parse_exec_start("ExecStart=/usr/local/bin/node_exporter").as_deref(),
        Some("/usr/local/bin/node_exporter")
    );
}

#[test]
fn test_parse_exec_start_with_arguments() {
    assert_eq!(
        parse_exec_start("ExecStart=/usr/local/bin/categraf --configs /etc/categraf/conf")
            .as_deref(),
        Some("/usr/local/bin/categraf")
    );
}

#[test]
fn test_parse_exec_start_structured_form() {
    let output = "ExecStart={ path=/usr/bin/prometheus ; argv[]=/usr/bin/prometheus }";
    assert_eq!(parse_exec_start(output).as_deref(), Some("/usr/bin/prometheus"));
}

#[test]
fn test_parse_exec_start_rejects_non_paths() {
    assert_eq!(parse_exec_start("MainPID=1234"), None);
}
