//! Component probe
//!
//! Observes one component on one host: packaging model actually present,
//! installed version, service state, backup presence. Detection order is
//! container, then service unit, then bare binary; first match wins.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{ComponentSpec, PackagingModel};
use crate::errors::ControlError;
use crate::remotefs::BACKUP_ROOT;
use crate::ssh::shell::CommandChannel;
use crate::utils::shell_quote;

pub const VERSION_UNKNOWN: &str = "unknown";
pub const VERSION_LATEST: &str = "latest";

/// Observed state of one component on one host. Derived on demand, never
/// authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub installed: bool,
    pub version: String,
    pub running: bool,
    pub config_backed_up: bool,
    pub last_observed: DateTime<Utc>,
    /// Packaging model the probe actually found, which may differ from the
    /// catalog's expectation
    pub packaging: Option<PackagingModel>,
}

impl Presence {
    fn absent() -> Self {
        Self {
            installed: false,
            version: String::new(),
            running: false,
            config_backed_up: false,
            last_observed: Utc::now(),
            packaging: None,
        }
    }
}

/// What the control plane should do about the observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Install,
    Skip,
    Update,
    Downgrade,
    Reinstall,
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub presence: Presence,
    pub action: RecommendedAction,
}

/// Probe a component, recommending an action against `target_version`
pub async fn probe(
    shell: &dyn CommandChannel,
    spec: &ComponentSpec,
    target_version: Option<&str>,
) -> Result<ProbeReport, ControlError> {
    let name = &spec.name;

    let detected = match detect_container(shell, name).await? {
        Some(version) => Some((version, PackagingModel::Container)),
        None => match detect_service_unit(shell, name).await? {
            Some(version) => Some((version, PackagingModel::ServiceUnitBinary)),
            None => detect_bare_binary(shell, name)
                .await?
                .map(|version| (version, PackagingModel::BareBinary)),
        },
    };

    let Some((version, packaging)) = detected else {
        debug!("component {} not found in any packaging model", name);
        return Ok(ProbeReport {
            presence: Presence::absent(),
            action: RecommendedAction::Install,
        });
    };

    let presence = Presence {
        installed: true,
        running: service_running(shell, name).await?,
        config_backed_up: has_backups(shell, name).await?,
        last_observed: Utc::now(),
        packaging: Some(packaging),
        version: version.clone(),
    };

    let action = recommend(&version, target_version);
    Ok(ProbeReport { presence, action })
}

fn recommend(current: &str, target: Option<&str>) -> RecommendedAction {
    let Some(target) = target else {
        return RecommendedAction::Skip;
    };
    if current == VERSION_UNKNOWN {
        return RecommendedAction::Reinstall;
    }
    if current == VERSION_LATEST {
        // A floating tag cannot be compared against a concrete semver
        return RecommendedAction::Reinstall;
    }
    match compare_versions(current, target) {
        Ordering::Equal => RecommendedAction::Skip,
        Ordering::Less => RecommendedAction::Update,
        Ordering::Greater => RecommendedAction::Downgrade,
    }
}

/// Container detection: inspect by container name, version from the image
/// tag unless it is `latest`, in which case the in-container binary is
/// asked directly.
async fn detect_container(
    shell: &dyn CommandChannel,
    name: &str,
) -> Result<Option<String>, ControlError> {
    let cmd = format!(
        "docker inspect {} --format='{{{{.Config.Image}}}}' 2>/dev/null",
        shell_quote(name)
    );
    let output = shell.run_cmd(&cmd).await?;
    if !output.success() || output.stdout_trimmed().is_empty() {
        return Ok(None);
    }

    let image = output.stdout_trimmed().to_string();
    if let Some(tag) = image.rsplit(':').next().filter(|tag| !tag.contains('/')) {
        if tag != VERSION_LATEST {
            return Ok(Some(tag.to_string()));
        }
    }

    // latest tag: ask the binary inside the container
    let cmd = format!(
        "docker exec {n} {n} --version 2>/dev/null || docker exec {n} {n} -version 2>/dev/null",
        n = shell_quote(name)
    );
    let output = shell.run_cmd(&cmd).await?;
    if output.success() {
        if let Some(version) = extract_version(&output.stdout) {
            return Ok(Some(version));
        }
    }
    Ok(Some(VERSION_LATEST.to_string()))
}

/// Service-unit detection: unit file present, exec path taken from the
/// unit's declared start command.
async fn detect_service_unit(
    shell: &dyn CommandChannel,
    name: &str,
) -> Result<Option<String>, ControlError> {
    let cmd = format!("systemctl list-unit-files {}.service", shell_quote(name));
    let output = shell.run_cmd(&cmd).await?;
    if !output.success() || !output.stdout.contains(name) {
        return Ok(None);
    }

    let cmd = format!("systemctl show {} --property=ExecStart", shell_quote(name));
    let output = shell.run_cmd(&cmd).await?;
    if output.success() {
        if let Some(exec_path) = parse_exec_start(&output.stdout) {
            let cmd = format!(
                "{p} --version 2>/dev/null || {p} -version 2>/dev/null || {p} version 2>/dev/null",
                p = shell_quote(&exec_path)
            );
            let output = shell.run_cmd(&cmd).await?;
            if output.success() {
                if let Some(version) = extract_version(&output.stdout) {
                    return Ok(Some(version));
                }
            }
        }
    }
    Ok(Some(VERSION_UNKNOWN.to_string()))
}

/// Bare-binary detection: look the name up on PATH and ask it
async fn detect_bare_binary(
    shell: &dyn CommandChannel,
    name: &str,
) -> Result<Option<String>, ControlError> {
    let output = shell
        .run_cmd(&format!("which {}", shell_quote(name)))
        .await?;
    if !output.success() {
        return Ok(None);
    }

    for flag in ["--version", "-version", "version"] {
        let output = shell
            .run_cmd(&format!("{} {} 2>/dev/null", shell_quote(name), flag))
            .await?;
        if output.success() {
            if let Some(version) = extract_version(&output.stdout) {
                return Ok(Some(version));
            }
        }
    }
    Ok(Some(VERSION_UNKNOWN.to_string()))
}

/// Parse the binary path out of `systemctl show -p ExecStart` output
pub fn parse_exec_start(output: &str) -> Option<String> {
    let rest = output.trim().strip_prefix("ExecStart=")?;
    let first = rest
        .split_whitespace()
        .map(|field| field.trim_start_matches('{'))
        .map(|field| field.strip_prefix("path=").unwrap_or(field))
        .find(|field| !field.is_empty())?;
    if first.starts_with('/') {
        Some(first.trim_end_matches(';').to_string())
    } else {
        None
    }
}

static VERSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"version\s+(\d+\.\d+\.\d+)",
        r"v(\d+\.\d+\.\d+)",
        r"(\d+\.\d+\.\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("version pattern"))
    .collect()
});

/// First semver-looking match in the lower-cased output, line by line
pub fn extract_version(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim().to_lowercase();
        for pattern in VERSION_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(&line) {
                return Some(caps[1].to_string());
            }
        }
    }
    None
}

/// Numeric element-wise dotted version comparison; short versions are
/// padded with zeros, so `1.10.0 > 1.9.9` and `1.7 == 1.7.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(leading_number).collect() };
    let left = parse(a);
    let right = parse(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn leading_number(part: &str) -> u64 {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// A service counts as running when its container status says `Up` or its
/// unit reports `active`
pub async fn service_running(
    shell: &dyn CommandChannel,
    name: &str,
) -> Result<bool, ControlError> {
    let cmd = format!(
        "docker ps --filter name={} --format '{{{{.Status}}}}'",
        shell_quote(name)
    );
    let output = shell.run_cmd(&cmd).await?;
    if output.success() && output.stdout.contains("Up") {
        return Ok(true);
    }

    let cmd = format!("systemctl is-active {}", shell_quote(name));
    let output = shell.run_cmd(&cmd).await?;
    Ok(output.success() && output.stdout_trimmed() == "active")
}

async fn has_backups(shell: &dyn CommandChannel, name: &str) -> Result<bool, ControlError> {
    let dir = format!("{}/{}", BACKUP_ROOT, name);
    let cmd = format!(
        "test -d {q} && ls {q} | wc -l",
        q = shell_quote(&dir)
    );
    let output = shell.run_cmd(&cmd).await?;
    Ok(output.success() && output.stdout_trimmed() != "0")
}
