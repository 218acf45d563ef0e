//! tart backend.
//!
//! tart keeps VM bundles in its own store, keyed by name; the VM id is used
//! as the tart VM name. `vm.json` under the VM root only records what was
//! created. tart assigns each imported VM its own machine identifier, so the
//! generated one is not used.

use super::{run_command, VmDriver, VmLayout, VmResources};
use crate::error::{Error, Result};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Driver for the `tart` command-line tool.
#[derive(Debug, Clone)]
pub struct TartDriver {
    binary: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TartVmSpec<'a> {
    name: &'a str,
    cpus: u32,
    memory_mib: u64,
}

impl TartDriver {
    /// Create a driver using `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn tart(&self) -> Command {
        Command::new(&self.binary)
    }
}

/// Parse `tart ip` output: exactly one IP address on one line.
pub fn parse_tart_ip(output: &str) -> Result<IpAddr> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(line), None) = (lines.next(), lines.next()) else {
        return Err(Error::driver(
            "address",
            format!("unexpected `tart ip` output: {:?}", output),
        ));
    };
    line.parse().map_err(|_| {
        Error::driver("address", format!("`tart ip` returned {:?}, not an IP address", line))
    })
}

impl VmDriver for TartDriver {
    fn name(&self) -> &'static str {
        "tart"
    }

    fn materialize(&self, base_image: &Path, layout: &VmLayout) -> Result<()> {
        run_command(
            self.tart().arg("import").arg(base_image).arg(&layout.vm_id),
            "tart import",
        )?;
        Ok(())
    }

    fn create(&self, layout: &VmLayout, resources: &VmResources, _machine_id: &str) -> Result<()> {
        run_command(
            self.tart()
                .arg("set")
                .arg(&layout.vm_id)
                .arg("--cpu")
                .arg(resources.cpus.to_string())
                .arg("--memory")
                .arg(resources.memory_mib.to_string()),
            "tart set",
        )?;

        let spec = TartVmSpec {
            name: &layout.vm_id,
            cpus: resources.cpus,
            memory_mib: resources.memory_mib,
        };
        crate::util::write_atomic(&layout.config_path(), &serde_json::to_vec_pretty(&spec)?)
    }

    fn start_command(&self, layout: &VmLayout) -> Result<Command> {
        let mut cmd = self.tart();
        cmd.arg("run").arg("--no-graphics").arg(&layout.vm_id);
        Ok(cmd)
    }

    fn delete(&self, layout: &VmLayout) -> Result<()> {
        let output = self
            .tart()
            .arg("delete")
            .arg(&layout.vm_id)
            .output()
            .map_err(|e| Error::driver("tart delete", format!("failed to spawn: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("not found") {
            tracing::debug!(vm_id = %layout.vm_id, "tart VM already gone");
            return Ok(());
        }
        Err(Error::driver(
            "tart delete",
            format!("exit code {:?}: {}", output.status.code(), stderr.trim()),
        ))
    }

    fn address(&self, layout: &VmLayout) -> Result<Option<IpAddr>> {
        let output = self
            .tart()
            .arg("ip")
            .arg(&layout.vm_id)
            .output()
            .map_err(|e| Error::driver("tart ip", format!("failed to spawn: {}", e)))?;
        // tart exits non-zero until the guest has a lease.
        if !output.status.success() {
            return Ok(None);
        }
        parse_tart_ip(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }
}
