//! Idempotent VM teardown.
//!
//! Deleting a VM that is already gone, half-provisioned, or unknown to the
//! registry is not an error. Every step past locating the VM is best effort;
//! the registry record, and with it the admission slot, is always removed.

use crate::config::AgentConfig;
use crate::driver::VmDriver;
use crate::process::{self, StopOutcome};
use crate::provision::{blocking, remove_dir};
use crate::registry::{VmLayout, VmRegistry, VmState};
use serde::Serialize;
use std::sync::Arc;

/// What a teardown found and did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionReport {
    /// VM id.
    pub vm_id: String,
    /// Whether the registry had a record.
    pub had_record: bool,
    /// Pid that was stopped, from the record or the pid file.
    pub pid: Option<libc::pid_t>,
    /// Whether the process was running when the stop was attempted.
    pub process_was_running: bool,
    /// Whether the VM directory is gone.
    pub directory_removed: bool,
    /// Failures of best-effort steps.
    pub warnings: Vec<String>,
}

/// Tears VMs down.
#[derive(Clone)]
pub struct Deprovisioner {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) registry: Arc<VmRegistry>,
    pub(crate) driver: Arc<dyn VmDriver>,
}

impl Deprovisioner {
    /// Stop and remove `vm_id`.
    pub async fn run(&self, vm_id: &str) -> DeprovisionReport {
        let mut report = DeprovisionReport {
            vm_id: vm_id.to_string(),
            ..Default::default()
        };

        let found = self.registry.update(vm_id, |r| {
            r.state = VmState::Deleting;
            (r.layout.clone(), r.pid)
        });
        let (layout, recorded_pid) = match found {
            Some((layout, pid)) => {
                report.had_record = true;
                (layout, pid)
            }
            None => (VmLayout::new(&self.config.vms_dir, vm_id), None),
        };

        tracing::info!(vm_id = %vm_id, had_record = report.had_record, "deprovisioning VM");

        let timeout = self.config.delete_timeout;
        if tokio::time::timeout(timeout, self.teardown(&layout, recorded_pid, &mut report))
            .await
            .is_err()
        {
            let warning = format!("teardown timed out after {}", humantime::format_duration(timeout));
            tracing::warn!(vm_id = %vm_id, "{}", warning);
            report.warnings.push(warning);
        }

        self.registry.update(vm_id, |r| r.state = VmState::Deleted);
        self.registry.remove(vm_id);
        tracing::info!(
            vm_id = %vm_id,
            directory_removed = report.directory_removed,
            warnings = report.warnings.len(),
            "VM deprovisioned"
        );
        report
    }

    async fn teardown(
        &self,
        layout: &VmLayout,
        recorded_pid: Option<libc::pid_t>,
        report: &mut DeprovisionReport,
    ) {
        let vm_id = layout.vm_id.as_str();

        let pid = match recorded_pid {
            Some(pid) => Some(pid),
            None => match process::read_pid_file(&layout.pid_file_path()) {
                Ok(Some(file)) => self.verify_pid_file(vm_id, file, report).await,
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "unreadable pid file");
                    report.warnings.push(e.to_string());
                    None
                }
            },
        };
        report.pid = pid;

        if let Some(pid) = pid {
            match process::stop_process(pid, self.config.stop_timeout).await {
                Ok(StopOutcome::NotRunning) => {
                    tracing::debug!(vm_id = %vm_id, pid, "process already gone");
                }
                Ok(outcome) => {
                    report.process_was_running = true;
                    tracing::info!(vm_id = %vm_id, pid, outcome = ?outcome, "hypervisor stopped");
                }
                Err(e) => {
                    report.process_was_running = true;
                    tracing::warn!(vm_id = %vm_id, pid, error = %e, "failed to stop hypervisor, continuing");
                    report.warnings.push(e.to_string());
                }
            }
        }

        let driver = self.driver.clone();
        let owned = layout.clone();
        if let Err(e) = blocking(move || driver.delete(&owned)).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "driver cleanup failed, continuing");
            report.warnings.push(e.to_string());
        }

        let root = layout.root.clone();
        match blocking(move || remove_dir(&root)).await {
            Ok(()) => report.directory_removed = true,
            Err(e) => {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to remove VM directory");
                report.warnings.push(e.to_string());
            }
        }
    }
}

impl Deprovisioner {
    /// Pid from a pid file, if it still names the hypervisor that wrote it.
    async fn verify_pid_file(
        &self,
        vm_id: &str,
        file: process::PidFile,
        report: &mut DeprovisionReport,
    ) -> Option<libc::pid_t> {
        let pid = file.pid;
        if !process::is_alive(pid) {
            return Some(pid);
        }
        let same = blocking(move || Ok(file.is_same_process()))
            .await
            .unwrap_or(false);
        if same {
            return Some(pid);
        }
        let warning = format!("pid {} from pid file now belongs to another process, not signalled", pid);
        tracing::warn!(vm_id = %vm_id, pid, "{}", warning);
        report.warnings.push(warning);
        None
    }
}
