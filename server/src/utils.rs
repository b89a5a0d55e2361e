//! Utility functions

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Version information for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Timestamp used in remote backup paths, e.g. `20260802_153045`
pub fn backup_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Calculate SHA256 hash of data as lowercase hex
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Generate a unique task ID
pub fn generate_task_id(kind: &str) -> String {
    format!("{}_{}", kind, uuid::Uuid::new_v4().simple())
}

/// Last `max` characters of a command's output, for step records
pub fn tail_chars(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max).collect()
}

/// Quote a string for safe interpolation into a remote shell command.
///
/// Single-quotes the value and escapes embedded single quotes, the only
/// metacharacter that survives inside single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
