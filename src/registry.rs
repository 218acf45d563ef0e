//! Registry of VMs owned by this agent.
//!
//! The registry is the live source of truth for which VMs exist. Each
//! record owns the VM's admission slot, so removing a record releases it.

use crate::admission::AdmissionSlot;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// File names inside a VM's root directory.
pub const DISK_FILENAME: &str = "disk.img";
/// VM description read by the hypervisor.
pub const CONFIG_FILENAME: &str = "vm.json";
/// Combined hypervisor output.
pub const LOG_FILENAME: &str = "vm.log";
/// Hypervisor process id.
pub const PID_FILENAME: &str = "vm.pid";

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Provisioning pipeline in progress.
    Creating,
    /// Hypervisor process is running.
    Running,
    /// Hypervisor process exited unexpectedly.
    Failed,
    /// Deprovisioning in progress.
    Deleting,
    /// Deprovisioning finished. Records are removed in this state.
    Deleted,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Running => write!(f, "running"),
            VmState::Failed => write!(f, "failed"),
            VmState::Deleting => write!(f, "deleting"),
            VmState::Deleted => write!(f, "deleted"),
        }
    }
}

/// On-disk locations for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    /// VM id.
    pub vm_id: String,
    /// VM root directory.
    pub root: PathBuf,
}

impl VmLayout {
    /// Layout for `vm_id` under `vms_dir`.
    pub fn new(vms_dir: &Path, vm_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            root: vms_dir.join(vm_id),
        }
    }

    /// Disk image copy.
    pub fn disk_path(&self) -> PathBuf {
        self.root.join(DISK_FILENAME)
    }

    /// Generated configuration artifact.
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILENAME)
    }

    /// Hypervisor output log.
    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILENAME)
    }

    /// Hypervisor pid file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.root.join(PID_FILENAME)
    }
}

/// Record of a VM in the registry.
#[derive(Debug)]
pub struct VmRecord {
    /// Image the VM was created from.
    pub image_name: String,
    /// On-disk locations.
    pub layout: VmLayout,
    /// Hypervisor pid once started.
    pub pid: Option<libc::pid_t>,
    /// Lifecycle state.
    pub state: VmState,
    /// Seconds since Unix epoch when the VM reached `Running`.
    pub started_at: Option<u64>,
    /// Guest address once known.
    pub address: Option<IpAddr>,
    /// Admission slot held for this VM.
    slot: Option<AdmissionSlot>,
}

impl VmRecord {
    /// Create a record in the `Creating` state.
    pub fn new(image_name: impl Into<String>, layout: VmLayout, slot: Option<AdmissionSlot>) -> Self {
        Self {
            image_name: image_name.into(),
            layout,
            pid: None,
            state: VmState::Creating,
            started_at: None,
            address: None,
            slot,
        }
    }

    /// Whether this record still holds an admission slot.
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Release the admission slot now.
    pub fn release_slot(&mut self) {
        self.slot.take();
    }

    /// Serializable snapshot of this record.
    pub fn info(&self) -> VmInfo {
        VmInfo {
            vm_id: self.layout.vm_id.clone(),
            image_name: self.image_name.clone(),
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            runtime_seconds: self
                .started_at
                .map(|t| crate::util::current_timestamp().saturating_sub(t)),
            address: self.address.map(|a| a.to_string()),
            root_path: self.layout.root.clone(),
        }
    }
}

/// Snapshot of a VM record for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    /// VM id.
    pub vm_id: String,
    /// Base image name.
    pub image_name: String,
    /// Lifecycle state.
    pub state: VmState,
    /// Hypervisor pid.
    pub pid: Option<libc::pid_t>,
    /// Start time, seconds since Unix epoch.
    pub started_at: Option<u64>,
    /// Seconds since start.
    pub runtime_seconds: Option<u64>,
    /// Guest address.
    pub address: Option<String>,
    /// VM root directory.
    pub root_path: PathBuf,
}

/// Registry of active VMs.
#[derive(Debug, Default)]
pub struct VmRegistry {
    vms: Mutex<HashMap<String, VmRecord>>,
}

impl VmRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Fails if the id is already present.
    pub fn insert(&self, record: VmRecord) -> Result<()> {
        let mut vms = self.vms.lock();
        let vm_id = record.layout.vm_id.clone();
        if vms.contains_key(&vm_id) {
            return Err(Error::Conflict(format!("VM '{}' already exists", vm_id)));
        }
        vms.insert(vm_id, record);
        Ok(())
    }

    /// Apply `f` to a record in place. Returns `None` if absent.
    pub fn update<F, T>(&self, vm_id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut VmRecord) -> T,
    {
        self.vms.lock().get_mut(vm_id).map(f)
    }

    /// Remove a record, handing its admission slot back to the caller.
    pub fn remove(&self, vm_id: &str) -> Option<VmRecord> {
        self.vms.lock().remove(vm_id)
    }

    /// Whether a record exists for `vm_id`.
    pub fn contains(&self, vm_id: &str) -> bool {
        self.vms.lock().contains_key(vm_id)
    }

    /// Snapshot of one record.
    pub fn get(&self, vm_id: &str) -> Option<VmInfo> {
        self.vms.lock().get(vm_id).map(VmRecord::info)
    }

    /// Snapshot of all records, oldest first.
    pub fn list(&self) -> Vec<VmInfo> {
        let mut infos: Vec<VmInfo> = self.vms.lock().values().map(VmRecord::info).collect();
        infos.sort_by(|a, b| {
            a.started_at
                .unwrap_or(u64::MAX)
                .cmp(&b.started_at.unwrap_or(u64::MAX))
                .then_with(|| a.vm_id.cmp(&b.vm_id))
        });
        infos
    }

    /// Ids and pids of records in `state`.
    pub fn pids_in_state(&self, state: VmState) -> Vec<(String, libc::pid_t)> {
        self.vms
            .lock()
            .iter()
            .filter(|(_, r)| r.state == state)
            .filter_map(|(id, r)| r.pid.map(|pid| (id.clone(), pid)))
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.vms.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
