//! Process configuration: per-scheme knobs plus the one process-wide
//! locale setting, loaded from an optional JSON file.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::scheme::{Family, KeepAlive};
use crate::socket::Transport;

static LOCALE: OnceLock<String> = OnceLock::new();

/// Reads `AWH_LOCALE` once and caches it; subsequent calls are free.
/// Defaults to `"C"` when unset.
pub fn locale() -> &'static str {
    LOCALE.get_or_init(|| std::env::var("AWH_LOCALE").unwrap_or_else(|_| "C".to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterTransfer {
    Pipes,
    SharedMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub mode: bool,
    pub size: usize,
    pub auto_restart: bool,
    pub transfer: ClusterTransfer,
    pub bandwidth: Option<usize>,
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: false,
            size: 1,
            auto_restart: true,
            transfer: ClusterTransfer::Pipes,
            bandwidth: None,
            name: "worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeConfig {
    pub family: Family,
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub sonet: Option<String>,
    pub ip_v6_only: bool,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub wait_message_secs: u64,
    pub total: usize,
    pub keep_alive: KeepAlive,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub schemes: Vec<SchemeConfig>,
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_defaults_to_c_when_env_unset() {
        std::env::remove_var("AWH_LOCALE");
        assert_eq!(locale(), "C");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            schemes: vec![SchemeConfig {
                family: Family::Ipv4,
                transport: Transport::Tcp,
                host: "0.0.0.0".to_string(),
                port: 8080,
                sonet: None,
                ip_v6_only: false,
                read_timeout_ms: 30_000,
                write_timeout_ms: 30_000,
                connect_timeout_ms: 5_000,
                wait_message_secs: 60,
                total: 10_000,
                keep_alive: KeepAlive {
                    cnt: 3,
                    idle: 60,
                    intvl: 10,
                },
                cluster: ClusterConfig::default(),
            }],
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.schemes[0].port, 8080);
        assert_eq!(parsed.schemes[0].cluster.size, 1);
    }

    #[test]
    fn from_json_file_reads_a_real_path() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"schemes":[{{"family":"ipv4","transport":"tcp","host":"127.0.0.1","port":9090,
            "sonet":null,"ipV6only":false,"readTimeoutMs":0,"writeTimeoutMs":0,
            "connectTimeoutMs":0,"waitMessageSecs":0,"total":100,
            "keepAlive":{{"cnt":0,"idle":0,"intvl":0}},
            "cluster":{{"mode":false,"size":1,"autoRestart":true,"transfer":"pipes","bandwidth":null,"name":"worker"}}
            }}]}}"#
        )
        .unwrap();

        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.schemes[0].port, 9090);
    }

    #[test]
    fn from_json_file_propagates_missing_path_as_io_error() {
        let err = Config::from_json_file("/nonexistent/path/corewire.json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
