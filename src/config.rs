// src/config.rs

//! Parses and resolves the JULEA client configuration (spec §4.1, §6).
//!
//! The shape mirrors the teacher's `Config::from_file`: a `RawConfig` is
//! deserialized with permissive per-field defaults, then resolved into an
//! immutable, validated `Configuration`. Per the "Global singletons" design
//! note, no process-wide singleton is installed here — callers hold the
//! `Configuration` behind an `Arc` and pass it through a `Context`.

use crate::errors::{JuleaError, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Which server role a given list of addresses, a connection-pool slot, or
/// a wire message belongs to (used to index the connection pool, spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::EnumIter)]
pub enum BackendType {
    Object,
    Kv,
    Db,
}

/// The optional, load-only tiering policy (spec §4.1); the core never acts
/// on it, it only carries it through for a future HSM-aware backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HsmPolicyConfig {
    pub kv_backend: Option<String>,
    pub kv_path: Option<String>,
    pub policy: Option<String>,
    pub args: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawServers {
    #[serde(default)]
    object: Vec<String>,
    #[serde(default)]
    kv: Vec<String>,
    #[serde(default)]
    db: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawCore {
    #[serde(default = "default_max_operation_size")]
    max_operation_size: usize,
    max_inject_size: Option<usize>,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for RawCore {
    fn default() -> Self {
        Self {
            max_operation_size: default_max_operation_size(),
            max_inject_size: None,
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawClients {
    max_connections: Option<usize>,
    #[serde(default = "default_stripe_size")]
    stripe_size: usize,
}

impl Default for RawClients {
    fn default() -> Self {
        Self {
            max_connections: None,
            stripe_size: default_stripe_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawObjectSection {
    #[serde(rename = "hsm-policy", default)]
    hsm_policy: Option<HsmPolicyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    servers: RawServers,
    #[serde(default)]
    core: RawCore,
    #[serde(default)]
    clients: RawClients,
    #[serde(default)]
    object: RawObjectSection,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            servers: RawServers::default(),
            core: RawCore::default(),
            clients: RawClients::default(),
            object: RawObjectSection::default(),
        }
    }
}

fn default_max_operation_size() -> usize {
    8 * 1024 * 1024 // 8 MiB
}

fn default_port() -> u16 {
    // 4711 + (uid mod 1000), per spec §4.1.
    let uid = unsafe { libc::getuid() };
    4711 + (uid % 1000) as u16
}

fn default_stripe_size() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

/// The resolved, validated, immutable configuration (spec §4.1, C1).
#[derive(Debug, Clone)]
pub struct Configuration {
    object_servers: Vec<String>,
    kv_servers: Vec<String>,
    db_servers: Vec<String>,
    pub max_operation_size: usize,
    pub max_inject_size: usize,
    pub port: u16,
    pub max_connections: usize,
    pub stripe_size: usize,
    pub hsm_policy: Option<HsmPolicyConfig>,
}

impl Configuration {
    /// Parses a config file at an explicit path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            JuleaError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_str_contents(&contents)
    }

    fn from_str_contents(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents)?;
        Self::resolve(raw)
    }

    /// Parses configuration from an in-memory TOML string rather than a
    /// file path; useful for tests and benchmarks that don't want to touch
    /// the filesystem.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Self::from_str_contents(contents)
    }

    fn resolve(raw: RawConfig) -> Result<Self> {
        let max_operation_size = raw.core.max_operation_size;
        let max_inject_size = raw
            .core
            .max_inject_size
            .unwrap_or(max_operation_size / 1024);
        let max_connections = raw.clients.max_connections.unwrap_or_else(num_cpus);

        let config = Configuration {
            object_servers: raw.servers.object,
            kv_servers: raw.servers.kv,
            db_servers: raw.servers.db,
            max_operation_size,
            max_inject_size,
            port: raw.core.port,
            max_connections,
            stripe_size: raw.clients.stripe_size,
            hsm_policy: raw.object.hsm_policy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(JuleaError::Config("core.port cannot be 0".into()));
        }
        if self.max_operation_size == 0 {
            return Err(JuleaError::Config(
                "core.max-operation-size cannot be 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(JuleaError::Config(
                "clients.max-connections cannot be 0".into(),
            ));
        }
        if self.stripe_size == 0 {
            return Err(JuleaError::Config("clients.stripe-size cannot be 0".into()));
        }
        for (name, list) in [
            ("servers.object", &self.object_servers),
            ("servers.kv", &self.kv_servers),
        ] {
            for host_port in list {
                parse_host_port(host_port).map_err(|e| {
                    JuleaError::Config(format!("{name} entry '{host_port}' invalid: {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// The ordered server list for a backend type (spec §4.1 / §4.6).
    pub fn servers(&self, backend: BackendType) -> &[String] {
        match backend {
            BackendType::Object => &self.object_servers,
            BackendType::Kv => &self.kv_servers,
            BackendType::Db => &self.db_servers,
        }
    }

    /// Number of configured servers for a backend type.
    pub fn server_count(&self, backend: BackendType) -> usize {
        self.servers(backend).len()
    }

    /// Resolves server `index`'s address for `backend` into a `SocketAddr`.
    pub fn server_addr(&self, backend: BackendType, index: usize) -> Result<SocketAddr> {
        let entry = self.servers(backend).get(index).ok_or_else(|| {
            JuleaError::Config(format!("no server at index {index} for {backend:?}"))
        })?;
        parse_host_port(entry)
            .map_err(|e| JuleaError::Config(format!("invalid server address '{entry}': {e}")))
    }

    /// Loads the configuration following the search order from spec §6:
    /// `$JULEA_CONFIG` (if absolute), else `$XDG_CONFIG_HOME/julea/<name>`,
    /// else each `$XDG_CONFIG_DIRS/julea/<name>` in order.
    pub fn load(name: &str) -> Result<Self> {
        Self::from_file(Self::resolve_path(name)?)
    }

    fn resolve_path(name: &str) -> Result<PathBuf> {
        if let Ok(env_value) = env::var("JULEA_CONFIG") {
            let candidate = PathBuf::from(&env_value);
            if candidate.is_absolute() {
                return Ok(candidate);
            }
            // A non-absolute JULEA_CONFIG names a leaf file, searched like `name`.
            return Self::search_xdg(&env_value);
        }
        Self::search_xdg(name)
    }

    fn search_xdg(leaf: &str) -> Result<PathBuf> {
        if let Ok(home) = env::var("XDG_CONFIG_HOME") {
            let candidate = Path::new(&home).join("julea").join(leaf);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if let Ok(dirs) = env::var("XDG_CONFIG_DIRS") {
            for dir in dirs.split(':') {
                let candidate = Path::new(dir).join("julea").join(leaf);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        Err(JuleaError::Config(format!(
            "could not locate config file '{leaf}' via JULEA_CONFIG, XDG_CONFIG_HOME or XDG_CONFIG_DIRS"
        )))
    }
}

fn parse_host_port(s: &str) -> std::result::Result<SocketAddr, String> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }
    // Fall back to resolving a bare hostname (not just an IP literal).
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    let port: u16 = port.parse().map_err(|_| "invalid port".to_string())?;
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| "host did not resolve to any address".to_string())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|e| {
            warn!("could not determine CPU count, defaulting to 1: {e}");
            1
        })
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::resolve(RawConfig::default())
            .expect("the built-in default configuration must be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = Configuration::default();
        assert_eq!(cfg.max_operation_size, 8 * 1024 * 1024);
        assert_eq!(cfg.max_inject_size, cfg.max_operation_size / 1024);
        assert_eq!(cfg.stripe_size, 4 * 1024 * 1024);
        assert!(cfg.max_connections >= 1);
    }

    #[test]
    fn parses_server_lists() {
        let toml = r#"
            [servers]
            object = ["10.0.0.1:4711", "10.0.0.2:4711", "10.0.0.3:4711"]
            kv = ["10.0.0.1:4712"]

            [core]
            max-operation-size = 65536
            port = 5000

            [clients]
            max-connections = 4
            stripe-size = 4096
        "#;
        let cfg = Configuration::from_str_contents(toml).unwrap();
        assert_eq!(cfg.server_count(BackendType::Object), 3);
        assert_eq!(cfg.server_count(BackendType::Kv), 1);
        assert_eq!(cfg.server_count(BackendType::Db), 0);
        assert_eq!(cfg.max_operation_size, 65536);
        assert_eq!(cfg.max_inject_size, 65536 / 1024);
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.max_connections, 4);
        debug!("{:?}", cfg.server_addr(BackendType::Object, 0).unwrap());
    }

    #[test]
    fn rejects_zero_port() {
        let toml = "[core]\nport = 0\n";
        assert!(Configuration::from_str_contents(toml).is_err());
    }
}
