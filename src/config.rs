//! Agent configuration.
//!
//! Configuration is read from an optional TOML file and then overridden by
//! command-line flags or `VMHOST_*` environment variables. Durations are
//! written in human-readable form (`"30s"`, `"10m"`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmhost/agent.toml";

/// Hypervisor backend selected at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// `macosvm` with a JSON VM description.
    #[default]
    Macosvm,
    /// `tart` with hypervisor-managed VM bundles.
    Tart,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Macosvm => write!(f, "macosvm"),
            DriverKind::Tart => write!(f, "tart"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "macosvm" => Ok(Self::Macosvm),
            "tart" => Ok(Self::Tart),
            other => Err(Error::Config(format!(
                "unknown driver '{}' (expected: macosvm, tart)",
                other
            ))),
        }
    }
}

/// Where base images are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Google Cloud Storage bucket.
    Gcs {
        /// Bucket name.
        bucket: String,
        /// Service account key file. Application default credentials when unset.
        #[serde(default)]
        credential_path: Option<PathBuf>,
    },
    /// A local directory laid out like the bucket.
    Fs {
        /// Root directory.
        root: PathBuf,
    },
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self::Gcs {
            bucket: "macvmorx-vm-images".to_string(),
            credential_path: None,
        }
    }
}

/// Client certificates for talking to the orchestrator over mutual TLS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTlsConfig {
    /// CA bundle that signs the orchestrator's certificate.
    pub ca_cert: PathBuf,
    /// PEM client certificate.
    pub client_cert: PathBuf,
    /// PEM private key of `client_cert`.
    pub client_key: PathBuf,
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identifier reported in status responses.
    pub node_id: String,

    /// HTTP listen address.
    pub listen: String,

    /// Directory holding one subdirectory per VM.
    pub vms_dir: PathBuf,

    /// Directory holding cached base images.
    pub image_cache_dir: PathBuf,

    /// Maximum number of ready images kept in the cache.
    pub max_cached_images: usize,

    /// Hard ceiling on concurrently active VMs.
    pub max_active_vms: usize,

    /// Hypervisor backend.
    pub driver: DriverKind,

    /// Hypervisor binary. Backend default when unset.
    pub hypervisor_binary: Option<PathBuf>,

    /// vCPUs per VM.
    pub vm_cpus: u32,

    /// Memory per VM in MiB.
    pub vm_memory_mib: u64,

    /// Bound on waiting for an image download.
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,

    /// Bound on a whole provisioning pipeline.
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,

    /// Bound on a whole deprovisioning pipeline.
    #[serde(with = "humantime_serde")]
    pub delete_timeout: Duration,

    /// SIGTERM grace period before SIGKILL.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Bound on waiting for a new VM to become reachable.
    #[serde(with = "humantime_serde")]
    pub boot_timeout: Duration,

    /// Interval between address lookups while a VM boots.
    #[serde(with = "humantime_serde")]
    pub address_poll_interval: Duration,

    /// Bound on the post-boot runner setup script.
    #[serde(with = "humantime_serde")]
    pub remote_exec_timeout: Duration,

    /// SSH user inside the VM.
    pub ssh_user: String,

    /// SSH private key used to reach VMs.
    pub ssh_key_path: PathBuf,

    /// SSH port inside the VM.
    pub ssh_port: u16,

    /// Runner setup script template. Post-boot setup is skipped when unset.
    pub runner_script_template: Option<PathBuf>,

    /// Interval between VM liveness checks.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Orchestrator base URL. Heartbeats are not sent when unset.
    pub orchestrator_url: Option<String>,

    /// Interval between heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Emit JSON log lines.
    pub log_json: bool,

    /// Mutual TLS for heartbeats. Plain server verification when unset.
    pub orchestrator_tls: Option<ClientTlsConfig>,

    /// Base image source.
    pub object_store: ObjectStoreConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let ssh_key_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/Users/runner"))
            .join(".ssh")
            .join("id_rsa");

        Self {
            node_id: "mac-mini-default".to_string(),
            listen: "0.0.0.0:8081".to_string(),
            vms_dir: PathBuf::from("/var/vmhost/vms"),
            image_cache_dir: PathBuf::from("/var/vmhost/images_cache"),
            max_cached_images: 5,
            max_active_vms: 2,
            driver: DriverKind::Macosvm,
            hypervisor_binary: None,
            vm_cpus: 4,
            vm_memory_mib: 8192,
            download_timeout: Duration::from_secs(30 * 60),
            provision_timeout: Duration::from_secs(10 * 60),
            delete_timeout: Duration::from_secs(2 * 60),
            stop_timeout: Duration::from_secs(10),
            boot_timeout: Duration::from_secs(5 * 60),
            address_poll_interval: Duration::from_secs(2),
            remote_exec_timeout: Duration::from_secs(15 * 60),
            ssh_user: "runner".to_string(),
            ssh_key_path,
            ssh_port: 22,
            runner_script_template: None,
            monitor_interval: Duration::from_secs(5),
            orchestrator_url: None,
            heartbeat_interval: Duration::from_secs(15),
            log_json: false,
            orchestrator_tls: None,
            object_store: ObjectStoreConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_active_vms == 0 {
            return Err(Error::Config("max_active_vms must be at least 1".into()));
        }
        if self.max_cached_images == 0 {
            return Err(Error::Config("max_cached_images must be at least 1".into()));
        }
        if self.vms_dir.as_os_str().is_empty() {
            return Err(Error::Config("vms_dir cannot be empty".into()));
        }
        if self.image_cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("image_cache_dir cannot be empty".into()));
        }
        if self.address_poll_interval.is_zero() {
            return Err(Error::Config("address_poll_interval cannot be zero".into()));
        }
        if let Some(url) = &self.orchestrator_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "orchestrator_url must be an http(s) URL, got '{}'",
                    url
                )));
            }
            if self.heartbeat_interval.is_zero() {
                return Err(Error::Config("heartbeat_interval cannot be zero".into()));
            }
        }
        Ok(())
    }

    /// Hypervisor binary, falling back to the backend default.
    pub fn hypervisor_binary(&self) -> PathBuf {
        self.hypervisor_binary
            .clone()
            .unwrap_or_else(|| match self.driver {
                DriverKind::Macosvm => PathBuf::from("/usr/local/bin/macosvm"),
                DriverKind::Tart => PathBuf::from("tart"),
            })
    }
}

/// Serde adapter for human-readable durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_active_vms, 2);
        assert_eq!(config.max_cached_images, 5);
        assert_eq!(config.driver, DriverKind::Macosvm);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            node_id = "mini-7"
            max_active_vms = 1
            download_timeout = "90s"
            driver = "tart"

            [object_store]
            kind = "fs"
            root = "/srv/images"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, "mini-7");
        assert_eq!(config.max_active_vms, 1);
        assert_eq!(config.download_timeout, Duration::from_secs(90));
        assert_eq!(config.driver, DriverKind::Tart);
        assert_eq!(
            config.object_store,
            ObjectStoreConfig::Fs {
                root: PathBuf::from("/srv/images")
            }
        );
        assert_eq!(config.provision_timeout, Duration::from_secs(600));
        assert_eq!(config.hypervisor_binary(), PathBuf::from("tart"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = AgentConfig::default();
        config.max_active_vms = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.max_cached_images = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_settings() {
        let config = AgentConfig::from_toml(
            r#"
            orchestrator_url = "https://orchestrator.internal:8443"
            heartbeat_interval = "30s"

            [orchestrator_tls]
            ca_cert = "/etc/vmhost/ca.pem"
            client_cert = "/etc/vmhost/agent.pem"
            client_key = "/etc/vmhost/agent-key.pem"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(
            config.orchestrator_tls.unwrap().client_key,
            PathBuf::from("/etc/vmhost/agent-key.pem")
        );

        let mut config = AgentConfig::default();
        config.orchestrator_url = Some("orchestrator:8080".into());
        assert!(config.validate().is_err());

        config.orchestrator_url = Some("http://orchestrator:8080".into());
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config = AgentConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed = AgentConfig::from_toml(&raw).unwrap();
        assert_eq!(parsed.stop_timeout, config.stop_timeout);
        assert_eq!(parsed.object_store, config.object_store);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.node_id, "mac-mini-default");
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("tart".parse::<DriverKind>().unwrap(), DriverKind::Tart);
        assert!("qemu".parse::<DriverKind>().is_err());
    }
}
