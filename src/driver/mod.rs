//! Hypervisor drivers.
//!
//! The provisioning pipeline only talks to [`VmDriver`]; each backend owns
//! its command-line syntax. Driver methods block and are called from
//! `spawn_blocking`.

mod macosvm;
mod tart;

pub use macosvm::{parse_dhcp_leases, DhcpLease, MacosvmDriver, DEFAULT_DHCP_LEASES};
pub use tart::{parse_tart_ip, TartDriver};

use crate::config::{AgentConfig, DriverKind};
use crate::error::{Error, Result};
pub use crate::registry::VmLayout;
use std::net::IpAddr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// Resources assigned to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmResources {
    /// vCPUs.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
}

impl VmResources {
    /// Memory in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mib * 1024 * 1024
    }
}

/// Hypervisor backend capability.
pub trait VmDriver: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Produce the VM's disk from `base_image`.
    fn materialize(&self, base_image: &Path, layout: &VmLayout) -> Result<()>;

    /// Write the VM's configuration.
    ///
    /// `machine_id` is applied by backends that take a hardware identifier
    /// from the host; others ignore it.
    fn create(&self, layout: &VmLayout, resources: &VmResources, machine_id: &str) -> Result<()>;

    /// Command that runs the VM in the foreground until it shuts down.
    fn start_command(&self, layout: &VmLayout) -> Result<Command>;

    /// Remove backend-side state. A VM that does not exist is not an error.
    fn delete(&self, layout: &VmLayout) -> Result<()>;

    /// The VM's address, `None` while not yet known.
    fn address(&self, layout: &VmLayout) -> Result<Option<IpAddr>>;
}

/// Build the configured driver.
pub fn create_driver(config: &AgentConfig) -> Arc<dyn VmDriver> {
    let binary = config.hypervisor_binary();
    match config.driver {
        DriverKind::Macosvm => Arc::new(MacosvmDriver::new(binary)),
        DriverKind::Tart => Arc::new(TartDriver::new(binary)),
    }
}

/// Run a command to completion, returning stdout.
pub(crate) fn run_command(cmd: &mut Command, context: &str) -> Result<String> {
    let output = cmd
        .output()
        .map_err(|e| Error::driver(context, format!("failed to spawn: {}", e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    Err(Error::driver(
        context,
        format!(
            "exit code {:?}\nstdout: {}\nstderr: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_driver_follows_config() {
        let mut config = AgentConfig::default();
        assert_eq!(create_driver(&config).name(), "macosvm");
        config.driver = DriverKind::Tart;
        assert_eq!(create_driver(&config).name(), "tart");
    }

    #[test]
    fn test_run_command_reports_failure() {
        let out = run_command(Command::new("sh").args(["-c", "echo ok"]), "echo").unwrap();
        assert_eq!(out.trim(), "ok");

        let err = run_command(Command::new("sh").args(["-c", "echo bad >&2; exit 4"]), "fail")
            .unwrap_err()
            .to_string();
        assert!(err.contains("driver fail failed"), "{err}");
        assert!(err.contains("bad"), "{err}");
    }

    #[test]
    fn test_memory_bytes() {
        let resources = VmResources {
            cpus: 2,
            memory_mib: 4096,
        };
        assert_eq!(resources.memory_bytes(), 4 * 1024 * 1024 * 1024);
    }
}
