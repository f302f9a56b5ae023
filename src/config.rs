//! Process configuration for the two binaries.
//!
//! Both sides load a JSON document into a typed struct; every tunable has
//! a serde default matching the engine constants, so a minimal file (or
//! none at all, for the coordinator) runs the stock configuration.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::detector::CameraRoi;
use crate::dv::DvParams;
use crate::green::GreenParams;
use crate::routing_table::TableParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Coordinator process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub dv: DvParams,
    pub table: TableParams,
    pub green: GreenParams,
    /// Region-of-interest calibration per camera id.
    pub cameras: HashMap<String, CameraRoi>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8000).into(),
            dv: DvParams::default(),
            table: TableParams::default(),
            green: GreenParams::default(),
            cameras: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

/// Node-agent process configuration. Only the node identity is mandatory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node_id: String,
    /// Address the vehicle responder listens on.
    #[serde(default = "default_node_listen")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,
    /// Frame source per reporting edge, captured at every recompute.
    #[serde(default)]
    pub edge_images: BTreeMap<String, PathBuf>,
    /// Width of the pre-empt window before the current phase ends.
    #[serde(default = "default_recompute_before")]
    pub recompute_before_secs: u64,
}

fn default_node_listen() -> SocketAddr {
    ([127, 0, 0, 1], 9002).into()
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_recompute_before() -> u64 {
    10
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_coordinator_defaults_match_engine_constants() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.dv.alpha, 0.2);
        assert_eq!(config.dv.max_inflation, 1.5);
        assert_eq!(config.table.beta, 0.08);
        assert_eq!(config.table.max_cost_ratio, 3.3);
        assert_eq!(config.green.min_green, 8);
        assert_eq!(config.green.max_green, 40);
        assert_eq!(config.green.cycle_time, 100.0);
    }

    #[test]
    fn test_coordinator_file_round_trip_with_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_addr": "0.0.0.0:8080",
                "dv": {{ "alpha": 0.5 }},
                "cameras": {{
                    "CC_01": {{ "road_length_m": 80.0, "road_width_m": 7.0, "roi_fraction": 0.6 }}
                }}
            }}"#
        )
        .unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.dv.alpha, 0.5);
        // Unset fields inside a section fall back too.
        assert_eq!(config.dv.max_inflation, 1.5);
        assert_eq!(config.cameras["CC_01"].roi_fraction, 0.6);
    }

    #[test]
    fn test_node_config_requires_node_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "listen_addr": "127.0.0.1:9002" }}"#).unwrap();
        let err = NodeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_node_config_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "node_id": "N2", "edge_images": {{ "E12": "assets/E12.jpg" }} }}"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node_id, "N2");
        assert_eq!(config.listen_addr.port(), 9002);
        assert_eq!(config.coordinator_url, "http://127.0.0.1:8000");
        assert_eq!(config.recompute_before_secs, 10);
        assert_eq!(config.edge_images["E12"], PathBuf::from("assets/E12.jpg"));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "node_id": "N2", "recompute_after": 5 }}"#).unwrap();
        assert!(NodeConfig::load(file.path()).is_err());

        let missing = Path::new("/definitely/not/here.json");
        assert!(matches!(
            CoordinatorConfig::load(missing).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }
}
