//! The host agent service object.
//!
//! [`Agent`] owns every piece of per-host state: the image cache, the
//! admission controller, the VM registry and the collaborators the pipelines
//! drive. Provisioning and deprovisioning run as tracked background tasks so
//! shutdown can wait for them.

use crate::admission::AdmissionController;
use crate::api::validation::{validate_provision_request, validate_vm_id};
use crate::cache::{CachedImageInfo, ImageCache};
use crate::config::AgentConfig;
use crate::deprovision::{DeprovisionReport, Deprovisioner};
use crate::driver::{self, VmDriver};
use crate::error::{Error, Result};
use crate::machine_id::{EcidGenerator, MachineIdGenerator};
use crate::process;
use crate::provision::{ProvisionRequest, Provisioner};
use crate::registry::{VmInfo, VmLayout, VmRecord, VmRegistry, VmState};
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::store::{self, ObjectStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// ssh connect timeout for post-boot setup.
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the agent drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Hypervisor backend.
    pub driver: Arc<dyn VmDriver>,
    /// Base image source.
    pub store: Arc<dyn ObjectStore>,
    /// Per-VM hardware identifier source.
    pub machine_ids: Arc<dyn MachineIdGenerator>,
    /// Remote script runner.
    pub remote: Arc<dyn RemoteExecutor>,
    /// Runner setup script template. Setup is skipped when `None`.
    pub runner_template: Option<String>,
}

impl Collaborators {
    /// Build the production collaborators described by `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let runner_template = match &config.runner_script_template {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("read runner script template {}: {}", path.display(), e))
            })?),
            None => None,
        };

        Ok(Self {
            driver: driver::create_driver(config),
            store: store::create_store(&config.object_store)?,
            machine_ids: Arc::new(EcidGenerator::default()),
            remote: Arc::new(SshExecutor::new(
                SSH_CONNECT_TIMEOUT,
                config.remote_exec_timeout,
            )),
            runner_template,
        })
    }
}

/// Provision command accepted for background execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    /// VM id.
    pub vm_id: String,
    /// Node that accepted the command.
    pub node_id: String,
}

/// Delete command accepted for background execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAccepted {
    /// VM id.
    pub vm_id: String,
}

/// Node status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node id.
    pub node_id: String,
    /// Agent version.
    pub version: String,
    /// Configured ceiling on active VMs.
    pub max_active_vms: usize,
    /// Registered VMs.
    pub vm_count: usize,
    /// Free admission slots.
    pub available_slots: usize,
    /// Registered VMs, oldest first.
    pub vms: Vec<VmInfo>,
    /// Cached images, most recently used first.
    pub cached_images: Vec<CachedImageInfo>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Images adopted into the cache.
    pub cached_images: usize,
    /// VMs whose hypervisor was still running.
    pub adopted: Vec<String>,
    /// VM directories left behind by dead VMs and removed.
    pub cleaned: Vec<String>,
}

/// A provisioning pipeline that has been admitted and not yet finished.
struct InFlight {
    id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// In-flight pipelines by VM id. Several pipelines may race for one id;
/// only one of them can claim it in the registry.
type InFlightMap = Arc<Mutex<HashMap<String, Vec<InFlight>>>>;

/// Removes a pipeline from the in-flight map when it finishes, however it
/// finishes.
struct InFlightGuard {
    inflight: InFlightMap,
    vm_id: String,
    id: u64,
    done: watch::Sender<bool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if let Some(pipelines) = inflight.get_mut(&self.vm_id) {
            pipelines.retain(|p| p.id != self.id);
            if pipelines.is_empty() {
                inflight.remove(&self.vm_id);
            }
        }
        drop(inflight);
        let _ = self.done.send(true);
    }
}

/// Per-host VM agent.
pub struct Agent {
    config: Arc<AgentConfig>,
    cache: ImageCache,
    admission: AdmissionController,
    registry: Arc<VmRegistry>,
    provisioner: Provisioner,
    deprovisioner: Deprovisioner,
    inflight: InFlightMap,
    next_pipeline: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Agent {
    /// Create an agent from configuration with the production collaborators.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::new(config, collaborators))
    }

    /// Create an agent with explicit collaborators.
    pub fn new(config: AgentConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let cache = ImageCache::new(
            &config.image_cache_dir,
            config.max_cached_images,
            config.download_timeout,
            shutdown.clone(),
        );
        let registry = Arc::new(VmRegistry::new());

        let provisioner = Provisioner {
            config: config.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            driver: collaborators.driver.clone(),
            store: collaborators.store,
            machine_ids: collaborators.machine_ids,
            remote: collaborators.remote,
            runner_template: collaborators.runner_template.map(Arc::from),
        };
        let deprovisioner = Deprovisioner {
            config: config.clone(),
            registry: registry.clone(),
            driver: collaborators.driver,
        };

        tracing::info!(
            node_id = %config.node_id,
            driver = provisioner.driver.name(),
            max_active_vms = config.max_active_vms,
            max_cached_images = config.max_cached_images,
            "agent initialized"
        );

        Self {
            admission: AdmissionController::new(config.max_active_vms),
            config,
            cache,
            registry,
            provisioner,
            deprovisioner,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_pipeline: AtomicU64::new(0),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Image cache.
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Admission controller.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// VM registry.
    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    /// Whether a provisioning pipeline for `vm_id` is running.
    pub fn is_provisioning(&self, vm_id: &str) -> bool {
        self.inflight.lock().contains_key(vm_id)
    }

    /// Accept a provision command and run the pipeline in the background.
    ///
    /// Fails fast with `Validation`, `Conflict` for a VM that is already
    /// registered, or `CapacityExceeded`. Every later failure is handled by
    /// the pipeline's rollback.
    pub fn provision(&self, request: ProvisionRequest) -> Result<ProvisionAccepted> {
        let admitted = self.admit(&request)?;
        let accepted = ProvisionAccepted {
            vm_id: request.vm_id.clone(),
            node_id: self.config.node_id.clone(),
        };

        let provisioner = self.provisioner.clone();
        self.tasks.spawn(async move {
            let Admitted { slot, cancel, guard } = admitted;
            let _guard = guard;
            let _ = provisioner.run(&request, slot, cancel).await;
        });
        Ok(accepted)
    }

    /// Provision a VM and wait for the pipeline to finish.
    pub async fn provision_now(&self, request: ProvisionRequest) -> Result<VmInfo> {
        let Admitted { slot, cancel, guard } = self.admit(&request)?;
        let _guard = guard;
        self.provisioner.run(&request, slot, cancel).await
    }

    fn admit(&self, request: &ProvisionRequest) -> Result<Admitted> {
        validate_provision_request(request)?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("agent is shutting down".into()));
        }

        let vm_id = &request.vm_id;
        if self.registry.contains(vm_id) {
            return Err(Error::Conflict(format!("VM '{}' already exists", vm_id)));
        }
        let slot = self.admission.try_reserve().ok_or_else(|| {
            tracing::info!(vm_id = %vm_id, max = self.admission.max(), "provision rejected, host at capacity");
            Error::CapacityExceeded {
                max: self.admission.max(),
            }
        })?;

        let id = self.next_pipeline.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        self.inflight
            .lock()
            .entry(vm_id.clone())
            .or_default()
            .push(InFlight {
                id,
                cancel: cancel.clone(),
                done: done_rx,
            });

        tracing::debug!(vm_id = %vm_id, reserved = self.admission.reserved(), "provision admitted");
        Ok(Admitted {
            slot,
            cancel,
            guard: InFlightGuard {
                inflight: self.inflight.clone(),
                vm_id: vm_id.clone(),
                id,
                done: done_tx,
            },
        })
    }

    /// Accept a delete command and tear the VM down in the background.
    ///
    /// Deleting an unknown VM is accepted: deletion is idempotent.
    pub fn delete(self: &Arc<Self>, vm_id: &str) -> Result<DeleteAccepted> {
        validate_vm_id(vm_id)?;
        let agent = self.clone();
        let owned = vm_id.to_string();
        self.tasks.spawn(async move {
            agent.delete_now(&owned).await;
        });
        Ok(DeleteAccepted {
            vm_id: vm_id.to_string(),
        })
    }

    /// Tear a VM down and wait for it.
    ///
    /// A pipeline still provisioning the VM is cancelled first and allowed
    /// to roll back, then whatever is left is removed.
    pub async fn delete_now(&self, vm_id: &str) -> DeprovisionReport {
        let pending: Vec<watch::Receiver<bool>> = self
            .inflight
            .lock()
            .get(vm_id)
            .map(|pipelines| {
                pipelines
                    .iter()
                    .map(|p| {
                        p.cancel.cancel();
                        p.done.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !pending.is_empty() {
            tracing::info!(vm_id = %vm_id, pipelines = pending.len(), "cancelling in-flight provisioning");
            let wait_all = async {
                for mut done in pending {
                    let _ = done.wait_for(|finished| *finished).await;
                }
            };
            if tokio::time::timeout(self.config.delete_timeout, wait_all)
                .await
                .is_err()
            {
                tracing::warn!(vm_id = %vm_id, "provisioning did not stop in time, deleting anyway");
            }
        }

        self.deprovisioner.run(vm_id).await
    }

    /// Status snapshot.
    pub fn status(&self) -> NodeStatus {
        let vms = self.registry.list();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            version: crate::VERSION.to_string(),
            max_active_vms: self.admission.max(),
            vm_count: vms.len(),
            available_slots: self.admission.available(),
            vms,
            cached_images: self.cache.entries(),
        }
    }

    /// Mark running VMs whose hypervisor exited as failed.
    ///
    /// The slot stays held until the VM is deleted. Returns the VM ids that
    /// changed state.
    pub fn check_vms(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for (vm_id, pid) in self.registry.pids_in_state(VmState::Running) {
            if process::is_alive(pid) {
                continue;
            }
            let changed = self
                .registry
                .update(&vm_id, |r| {
                    let was_running = r.state == VmState::Running;
                    if was_running {
                        r.state = VmState::Failed;
                    }
                    was_running
                })
                .unwrap_or(false);
            if changed {
                tracing::warn!(vm_id = %vm_id, pid, "hypervisor exited, VM marked failed");
                failed.push(vm_id);
            }
        }
        failed
    }

    /// Rebuild state left on disk by a previous run.
    ///
    /// Cached images are adopted. VM directories whose hypervisor is still
    /// alive become running records holding a slot, even past the ceiling;
    /// the rest are deprovisioned.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            cached_images: self.cache.load_existing()?,
            ..Default::default()
        };

        let vms_dir = &self.config.vms_dir;
        std::fs::create_dir_all(vms_dir).map_err(|e| {
            Error::storage("create vms dir", format!("{}: {}", vms_dir.display(), e))
        })?;
        let entries = std::fs::read_dir(vms_dir)
            .map_err(|e| Error::storage("scan vms dir", format!("{}: {}", vms_dir.display(), e)))?;

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(vm_id) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 VM directory");
                continue;
            };
            if validate_vm_id(&vm_id).is_err() {
                tracing::warn!(path = %entry.path().display(), "skipping unrecognized directory");
                continue;
            }

            let layout = VmLayout::new(vms_dir, &vm_id);
            let pid = match process::read_pid_file(&layout.pid_file_path()) {
                Ok(Some(file)) if process::is_alive(file.pid) => {
                    let pid = file.pid;
                    let same = crate::provision::blocking(move || Ok(file.is_same_process()))
                        .await
                        .unwrap_or(false);
                    if !same {
                        tracing::warn!(vm_id = %vm_id, pid, "pid file names another process");
                    }
                    same.then_some(pid)
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "unreadable pid file");
                    None
                }
            };

            match pid {
                Some(pid) => {
                    let started_at = std::fs::metadata(layout.pid_file_path())
                        .and_then(|m| m.modified())
                        .map(crate::util::unix_seconds)
                        .unwrap_or_else(|_| crate::util::current_timestamp());
                    let mut record =
                        VmRecord::new("unknown", layout, Some(self.admission.force_reserve()));
                    record.pid = Some(pid);
                    record.state = VmState::Running;
                    record.started_at = Some(started_at);
                    self.registry.insert(record)?;
                    tracing::info!(vm_id = %vm_id, pid, "adopted running VM");
                    report.adopted.push(vm_id);
                }
                _ => stale.push(vm_id),
            }
        }

        for vm_id in stale {
            tracing::info!(vm_id = %vm_id, "removing stale VM directory");
            self.deprovisioner.run(&vm_id).await;
            report.cleaned.push(vm_id);
        }

        report.adopted.sort();
        report.cleaned.sort();
        tracing::info!(
            cached_images = report.cached_images,
            adopted = report.adopted.len(),
            cleaned = report.cleaned.len(),
            "recovery complete"
        );
        Ok(report)
    }

    /// Token cancelled when the agent shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting work, cancel in-flight pipelines and wait for them to
    /// roll back. Running VMs are left running for the next start to adopt.
    pub async fn shutdown(&self) {
        tracing::info!(pending = self.tasks.len(), "agent shutting down");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("agent stopped");
    }
}

struct Admitted {
    slot: crate::admission::AdmissionSlot,
    cancel: CancellationToken,
    guard: InFlightGuard,
}
