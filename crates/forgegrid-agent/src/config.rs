//! Agent settings and their platform defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::auth::AuthMode;
use crate::lifecycle::LifecycleConfig;
use crate::tls::TlsFiles;

pub const ENV_NODE_ID: &str = "FORGED_NODE_ID";
pub const ENV_LISTEN: &str = "FORGED_LISTEN";
pub const ENV_DATA_ROOT: &str = "FORGED_DATA_ROOT";
pub const ENV_CERT_FILE: &str = "FORGED_CERT_FILE";
pub const ENV_KEY_FILE: &str = "FORGED_KEY_FILE";
pub const ENV_CA_FILE: &str = "FORGED_CA_FILE";
pub const ENV_INSECURE: &str = "FORGED_INSECURE";
pub const ENV_TOKEN: &str = "FORGED_TOKEN";
pub const ENV_DEFAULT_IMAGE: &str = "FORGED_DEFAULT_IMAGE";
pub const ENV_ENGINE: &str = "FORGED_ENGINE";
pub const ENV_STOP_TIMEOUT: &str = "FORGED_STOP_TIMEOUT";

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8444";

#[cfg(windows)]
fn program_data() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
        .join("forgegrid")
}

/// Directory holding certificates and keys.
pub fn default_config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        program_data()
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/forgegrid")
    }
}

/// Directory holding per-workload data.
pub fn default_data_root() -> PathBuf {
    #[cfg(windows)]
    {
        program_data().join("data")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/forgegrid")
    }
}

/// Agent certificate, key and CA under the config directory.
pub fn default_tls_files() -> TlsFiles {
    let dir = default_config_dir();
    TlsFiles {
        cert: dir.join("agent.pem"),
        key: dir.join("agent.key"),
        ca: dir.join("ca.pem"),
    }
}

/// Everything `forged agent` needs to run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub listen: SocketAddr,
    pub auth: AuthMode,
    pub lifecycle: LifecycleConfig,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, listen: SocketAddr, auth: AuthMode) -> Self {
        Self {
            node_id: node_id.into(),
            listen,
            auth,
            lifecycle: LifecycleConfig::new(default_data_root()),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_files_share_config_dir() {
        let files = default_tls_files();
        let dir = default_config_dir();
        assert!(files.cert.starts_with(&dir));
        assert!(files.key.starts_with(&dir));
        assert!(files.ca.starts_with(&dir));
    }

    #[test]
    fn default_listen_parses() {
        let addr: SocketAddr = DEFAULT_LISTEN.parse().unwrap();
        assert_eq!(addr.port(), 8444);
    }
}
