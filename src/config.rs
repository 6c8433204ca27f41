//! Worker configuration loaded from an optional TOML file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

/// Settings of one worker process. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Request/reply listener.
    pub control_address: SocketAddr,
    /// Broadcast listener. Derived from the control address when absent.
    pub publish_address: Option<SocketAddr>,
    /// Size of the simulation worker pool.
    pub max_workers: usize,
    pub relax_max_iterations: u32,
    /// Spring constant of locked-atom restraints, kJ/mol/nm².
    pub lock_stiffness: f64,
    /// Backend names in priority order.
    pub backends: Vec<String>,
    pub emitter_seed: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub forcefield_dir: PathBuf,
    pub forcefield_extension_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            control_address: SocketAddr::from(([127, 0, 0, 1], 5555)),
            publish_address: None,
            max_workers: 50,
            relax_max_iterations: 500,
            lock_stiffness: 500_000.0,
            backends: vec!["native".to_string(), "reference".to_string()],
            emitter_seed: None,
            log_file: None,
            forcefield_dir: PathBuf::from("offxml"),
            forcefield_extension_dir: PathBuf::from("offxml_extensions"),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(config_path).with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", config_path.display()))
    }

    /// Publish address, defaulting to the control host with the next port.
    pub fn publish_address(&self) -> SocketAddr {
        self.publish_address.unwrap_or_else(|| {
            let mut address = self.control_address;
            address.set_port(address.port().wrapping_add(1));
            address
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.publish_address(), SocketAddr::from(([127, 0, 0, 1], 5556)));
    }

    #[test]
    fn load_reads_kebab_case_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
control-address = "0.0.0.0:7000"
max-workers = 4
lock-stiffness = 1000.0
backends = ["reference"]
emitter-seed = 42
"#
        )
        .unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.lock_stiffness, 1000.0);
        assert_eq!(config.backends, vec!["reference"]);
        assert_eq!(config.emitter_seed, Some(42));
        assert_eq!(config.publish_address(), "0.0.0.0:7001".parse().unwrap());
        assert_eq!(config.relax_max_iterations, 500);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max-wrokers = 4").unwrap();
        let err = WorkerConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(WorkerConfig::load(Path::new("/nonexistent/worker.toml")).is_err());
    }
}
