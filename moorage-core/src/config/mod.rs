use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::rudder::ListenerBuilder;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_MAX_SHIPS: usize = 1024;
pub const DEFAULT_MAX_TOURS: usize = 256;
pub const DEFAULT_TOUR_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_SELECT_TIMEOUT_SEC: u64 = 10;
pub const DEFAULT_SOCKET_TIMEOUT_SEC: u64 = 300;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SEC: u64 = 20;
pub const DEFAULT_BLOCKING_THREADS: usize = 4;
pub const DEFAULT_MAX_PROCESSES: usize = 32;
pub const DEFAULT_CGI_TIMEOUT_SEC: u64 = 60;
pub const DEFAULT_WARP_TIMEOUT_SEC: u64 = 60;
pub const FALLBACK_PARALLELISM: NonZeroUsize = NonZeroUsize::MIN;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    pub ports: HashMap<String, PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
            blocking_threads: default_blocking_threads(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_blocking_threads, DEFAULT_BLOCKING_THREADS, usize);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// Per-agent limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Open rudder count at which the agent stops accepting.
    #[serde(default = "default_max_ships")]
    pub max_ships: usize,
    #[serde(default = "default_max_tours")]
    pub max_tours: usize,
    /// Unconsumed byte count at which a tour stops accepting content.
    #[serde(default = "default_tour_buffer_size")]
    pub tour_buffer_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_select_timeout_sec")]
    pub select_timeout_sec: u64,
    #[serde(default = "default_socket_timeout_sec")]
    pub socket_timeout_sec: u64,
    #[serde(default = "default_keep_alive_timeout_sec")]
    pub keep_alive_timeout_sec: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            max_ships: default_max_ships(),
            max_tours: default_max_tours(),
            tour_buffer_size: default_tour_buffer_size(),
            read_buffer_size: default_read_buffer_size(),
            select_timeout_sec: default_select_timeout_sec(),
            socket_timeout_sec: default_socket_timeout_sec(),
            keep_alive_timeout_sec: default_keep_alive_timeout_sec(),
        }
    }
}

impl AgentConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_secs(self.select_timeout_sec.max(1))
    }
}

define_const!(default_max_ships, DEFAULT_MAX_SHIPS, usize);
define_const!(default_max_tours, DEFAULT_MAX_TOURS, usize);
define_const!(default_tour_buffer_size, DEFAULT_TOUR_BUFFER_SIZE, usize);
define_const!(default_read_buffer_size, DEFAULT_READ_BUFFER_SIZE, usize);
define_const!(default_select_timeout_sec, DEFAULT_SELECT_TIMEOUT_SEC, u64);
define_const!(default_socket_timeout_sec, DEFAULT_SOCKET_TIMEOUT_SEC, u64);
define_const!(
    default_keep_alive_timeout_sec,
    DEFAULT_KEEP_ALIVE_TIMEOUT_SEC,
    u64
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub listener: ListenerConfig,
    #[serde(default)]
    pub protocol: ProtocolKind,
    pub socket_timeout_sec: Option<u64>,
    pub keep_alive_timeout_sec: Option<u64>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub troubles: Vec<TroubleConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    H1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListenerConfig {
    SocketAddress(SocketAddress),
    Uds(Uds),
}

impl TryFrom<ListenerConfig> for ListenerBuilder {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::SocketAddress(addr) => {
                ListenerBuilder::bind_tcp(addr.socket_addr, Default::default())
            }
            #[cfg(unix)]
            ListenerConfig::Uds(addr) => ListenerBuilder::bind_unix(addr.uds_path),
            #[cfg(not(unix))]
            ListenerConfig::Uds(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketAddress {
    pub socket_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Uds {
    pub uds_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DockerConfig {
    File {
        root: PathBuf,
    },
    Warp {
        upstream: SocketAddr,
        #[serde(default = "default_warp_timeout_sec")]
        timeout_sec: u64,
    },
    Cgi {
        root: PathBuf,
        #[serde(default = "default_max_processes")]
        max_processes: usize,
        #[serde(default = "default_cgi_timeout_sec")]
        timeout_sec: u64,
    },
}

define_const!(default_warp_timeout_sec, DEFAULT_WARP_TIMEOUT_SEC, u64);
define_const!(default_max_processes, DEFAULT_MAX_PROCESSES, usize);
define_const!(default_cgi_timeout_sec, DEFAULT_CGI_TIMEOUT_SEC, u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TroubleConfig {
    pub status: u16,
    pub method: TroubleMethod,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TroubleMethod {
    Guide,
    Text,
    Reroute,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&Self::read_file(path)?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        let config: Self = match is_json {
            true => serde_json::from_slice::<Self>(content)?,
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.worker_threads == 0 {
            bail!("Config: worker_threads must be positive");
        }
        if self.agent.max_tours == 0 || self.agent.tour_buffer_size == 0 {
            bail!("Config: max_tours and tour_buffer_size must be positive");
        }
        for (name, port) in self.ports.iter() {
            for route in port.routes.iter() {
                if !route.path.starts_with('/') {
                    bail!("Config: port {name}: route path {} must start with '/'", route.path);
                }
            }
        }
        Ok(())
    }

    fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = path.as_ref();
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => bail!("Config: error open file {}: {:?}", path.display(), e),
        };
        if meta.len() as usize > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_with_warp_route() {
        const TEST_CONFIG: &str = r#"
            {
                "agent": { "max_ships": 16 },
                "ports": {
                    "public": {
                        "listener": { "socket_addr": "0.0.0.0:8080" },
                        "routes": [
                            { "path": "/", "docker": { "kind": "file", "root": "/var/www" } },
                            { "path": "/api", "docker": { "kind": "warp", "upstream": "127.0.0.1:9000" } }
                        ]
                    }
                }
            }
        "#;

        let config = Config::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.agent.max_ships, 16);
        assert_eq!(config.agent.select_timeout_sec, DEFAULT_SELECT_TIMEOUT_SEC);
        let port = &config.ports["public"];
        assert_eq!(port.protocol, ProtocolKind::H1);
        assert_eq!(
            port.routes[1].docker,
            DockerConfig::Warp {
                upstream: "127.0.0.1:9000".parse().unwrap(),
                timeout_sec: DEFAULT_WARP_TIMEOUT_SEC,
            }
        );
    }

    #[test]
    fn toml_config_with_cgi_and_troubles() {
        const TEST_CONFIG: &str = "
            [runtime]
            worker_threads = 2
            runtime_type = 'legacy'

            [ports.internal]
            listener = { uds_path = '/tmp/moorage.sock' }
            keep_alive_timeout_sec = 5

            [[ports.internal.routes]]
            path = '/cgi-bin'
            docker = { kind = 'cgi', root = '/srv/cgi', max_processes = 4 }

            [[ports.internal.troubles]]
            status = 404
            method = 'text'
            target = 'nothing here'
        ";

        let config = Config::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.runtime.worker_threads, 2);
        assert_eq!(config.runtime.runtime_type, RuntimeType::Legacy);
        let port = &config.ports["internal"];
        assert_eq!(port.keep_alive_timeout_sec, Some(5));
        assert!(matches!(
            port.routes[0].docker,
            DockerConfig::Cgi {
                max_processes: 4,
                timeout_sec: DEFAULT_CGI_TIMEOUT_SEC,
                ..
            }
        ));
        assert_eq!(port.troubles[0].method, TroubleMethod::Text);
    }

    #[test]
    fn relative_route_is_rejected() {
        const TEST_CONFIG: &str = "
            [ports.p]
            listener = { socket_addr = '127.0.0.1:0' }
            [[ports.p.routes]]
            path = 'static'
            docker = { kind = 'file', root = '/tmp' }
        ";
        assert!(Config::from_slice(TEST_CONFIG.as_bytes()).is_err());
    }
}
