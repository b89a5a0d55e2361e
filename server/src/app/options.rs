//! Application configuration options

use std::path::PathBuf;

use crate::fanout::FanoutOptions;
use crate::ssh::pool::PoolOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// HTTP server configuration
    pub server: ServerOptions,

    /// SSH pool configuration
    pub pool: PoolOptions,

    /// Fan-out executor configuration
    pub fanout: FanoutOptions,

    /// Default remote endpoint substituted into reload probes and
    /// remote-write templates
    pub remote_endpoint: Option<String>,

    /// Local state directory; when set, task records persist across
    /// restarts
    pub state_dir: Option<PathBuf>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            pool: PoolOptions::default(),
            fanout: FanoutOptions::default(),
            remote_endpoint: None,
            state_dir: None,
        }
    }
}

impl AppOptions {
    /// The only environment inputs the control plane consumes
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(endpoint) = std::env::var("MONPLANE_REMOTE_ENDPOINT") {
            if !endpoint.is_empty() {
                options.remote_endpoint = Some(endpoint);
            }
        }
        if let Ok(dir) = std::env::var("MONPLANE_STATE_DIR") {
            if !dir.is_empty() {
                options.state_dir = Some(PathBuf::from(dir));
            }
        }
        options
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 17700,
        }
    }
}
