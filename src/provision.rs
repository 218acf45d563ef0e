//! VM provisioning pipeline.
//!
//! Stages run in order. When one fails, times out, or is cancelled, the
//! effects of the earlier stages are undone in reverse order and the error
//! names the stage that failed and whether the undo was complete.

use crate::admission::AdmissionSlot;
use crate::cache::ImageCache;
use crate::config::AgentConfig;
use crate::driver::{VmDriver, VmResources};
use crate::error::{Error, Result};
use crate::machine_id::MachineIdGenerator;
use crate::process;
use crate::registry::{VmInfo, VmLayout, VmRecord, VmRegistry, VmState};
use crate::remote::{self, RemoteExecutor, RunnerSetup, SshCredentials};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    /// Admission slot held.
    SlotReserved,
    /// Base image available in the cache.
    ImageReady,
    /// VM id claimed in the registry.
    Registered,
    /// Fresh VM root directory created.
    DirectoryCreated,
    /// VM disk produced from the base image.
    ImageMaterialized,
    /// Machine identifier generated and VM configuration written.
    ConfigWritten,
    /// Hypervisor process running and pid persisted.
    ProcessStarted,
    /// Guest address known.
    AddressResolved,
    /// Runner setup script completed inside the guest.
    RunnerConfigured,
    /// VM marked running.
    Running,
}

impl ProvisionStage {
    /// Stable name for logs and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStage::SlotReserved => "slot_reserved",
            ProvisionStage::ImageReady => "image_ready",
            ProvisionStage::Registered => "registered",
            ProvisionStage::DirectoryCreated => "directory_created",
            ProvisionStage::ImageMaterialized => "image_materialized",
            ProvisionStage::ConfigWritten => "config_written",
            ProvisionStage::ProcessStarted => "process_started",
            ProvisionStage::AddressResolved => "address_resolved",
            ProvisionStage::RunnerConfigured => "runner_configured",
            ProvisionStage::Running => "running",
        }
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provision command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// VM id, unique on this host.
    #[serde(default)]
    pub vm_id: String,
    /// Base image name in the object store.
    #[serde(default)]
    pub image_name: String,
    /// Token used to register the runner.
    #[serde(default)]
    pub runner_registration_token: String,
    /// Runner name.
    #[serde(default)]
    pub runner_name: String,
    /// Runner labels.
    #[serde(default)]
    pub runner_labels: Vec<String>,
}

/// What the pipeline has done so far, for rollback.
#[derive(Debug)]
struct Progress {
    attempting: ProvisionStage,
    layout: VmLayout,
    registered: bool,
    dir_created: bool,
    materialize_attempted: bool,
    pid: Option<libc::pid_t>,
    /// Blocking driver work that was running when the pipeline stopped.
    /// Rollback waits for it before touching the VM directory.
    pending: Option<JoinHandle<Result<()>>>,
}

/// Runs provisioning pipelines.
#[derive(Clone)]
pub struct Provisioner {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) cache: ImageCache,
    pub(crate) registry: Arc<VmRegistry>,
    pub(crate) driver: Arc<dyn VmDriver>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) machine_ids: Arc<dyn MachineIdGenerator>,
    pub(crate) remote: Arc<dyn RemoteExecutor>,
    pub(crate) runner_template: Option<Arc<str>>,
}

impl Provisioner {
    /// Provision one VM holding `slot`.
    ///
    /// Bounded by the configured provisioning timeout and by `cancel`. On
    /// any failure every completed stage is rolled back and the slot is
    /// released before this returns.
    pub async fn run(
        &self,
        request: &ProvisionRequest,
        slot: AdmissionSlot,
        cancel: CancellationToken,
    ) -> Result<VmInfo> {
        let vm_id = request.vm_id.clone();
        let mut slot = Some(slot);
        let mut progress = Progress {
            attempting: ProvisionStage::ImageReady,
            layout: VmLayout::new(&self.config.vms_dir, &vm_id),
            registered: false,
            dir_created: false,
            materialize_attempted: false,
            pid: None,
            pending: None,
        };

        tracing::info!(vm_id = %vm_id, image = %request.image_name, "provisioning VM");
        let timeout = self.config.provision_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled("provisioning".into())),
            result = tokio::time::timeout(timeout, self.advance(request, &mut slot, &mut progress)) => {
                result.unwrap_or_else(|_| Err(Error::timeout("provisioning", timeout)))
            }
        };

        match outcome {
            Ok(info) => {
                tracing::info!(vm_id = %vm_id, pid = ?info.pid, "VM running");
                Ok(info)
            }
            Err(source) => {
                let stage = progress.attempting;
                tracing::error!(vm_id = %vm_id, stage = %stage, error = %source, "provisioning failed, rolling back");
                let rolled_back = self.rollback(&mut progress).await;
                drop(slot);
                Err(Error::Provision {
                    vm_id,
                    stage,
                    source: Box::new(source),
                    rolled_back,
                })
            }
        }
    }

    async fn advance(
        &self,
        request: &ProvisionRequest,
        slot: &mut Option<AdmissionSlot>,
        progress: &mut Progress,
    ) -> Result<VmInfo> {
        let vm_id = request.vm_id.as_str();
        let layout = progress.layout.clone();

        progress.attempting = ProvisionStage::ImageReady;
        let base_image = self.ensure_image(&request.image_name).await?;
        tracing::debug!(vm_id = %vm_id, image = %base_image.display(), "image ready");

        progress.attempting = ProvisionStage::Registered;
        self.registry
            .insert(VmRecord::new(&request.image_name, layout.clone(), slot.take()))?;
        progress.registered = true;

        progress.attempting = ProvisionStage::DirectoryCreated;
        create_fresh_dir(&self.config.vms_dir, &layout)?;
        progress.dir_created = true;

        progress.attempting = ProvisionStage::ImageMaterialized;
        progress.materialize_attempted = true;
        {
            let driver = self.driver.clone();
            let layout = layout.clone();
            run_to_completion(&mut progress.pending, move || {
                driver.materialize(&base_image, &layout)
            })
            .await?;
        }

        progress.attempting = ProvisionStage::ConfigWritten;
        {
            let driver = self.driver.clone();
            let machine_ids = self.machine_ids.clone();
            let layout = layout.clone();
            let resources = VmResources {
                cpus: self.config.vm_cpus,
                memory_mib: self.config.vm_memory_mib,
            };
            run_to_completion(&mut progress.pending, move || {
                let machine_id = machine_ids.generate()?;
                driver.create(&layout, &resources, &machine_id)
            })
            .await?;
        }

        progress.attempting = ProvisionStage::ProcessStarted;
        let command = self.driver.start_command(&layout)?;
        let pid = process::spawn_detached(command, &layout.log_path())?;
        progress.pid = Some(pid);
        {
            let pid_file = layout.pid_file_path();
            run_to_completion(&mut progress.pending, move || {
                process::write_pid_file(&pid_file, pid)
            })
            .await?;
        }
        self.registry.update(vm_id, |r| r.pid = Some(pid));
        tracing::info!(vm_id = %vm_id, pid, driver = self.driver.name(), "hypervisor started");

        if let Some(template) = &self.runner_template {
            progress.attempting = ProvisionStage::AddressResolved;
            let address = self.resolve_address(&layout, pid).await?;
            self.registry.update(vm_id, |r| r.address = Some(address));
            tracing::info!(vm_id = %vm_id, address = %address, "VM address resolved");

            progress.attempting = ProvisionStage::RunnerConfigured;
            self.configure_runner(request, template, address).await?;
            tracing::info!(vm_id = %vm_id, "runner configured");
        }

        progress.attempting = ProvisionStage::Running;
        self.registry
            .update(vm_id, |r| {
                r.state = VmState::Running;
                r.started_at = Some(crate::util::current_timestamp());
                r.info()
            })
            .ok_or_else(|| Error::Conflict(format!("VM '{}' was removed while provisioning", vm_id)))
    }

    async fn ensure_image(&self, name: &str) -> Result<std::path::PathBuf> {
        crate::store::validate_object_name(name)?;
        let store = self.store.clone();
        let dir = self.cache.dir().to_path_buf();
        let owned = name.to_string();
        self.cache
            .ensure_available(name, move || {
                let store = store.clone();
                let dir = dir.clone();
                let name = owned.clone();
                async move { store.download(&name, &dir).await }
            })
            .await
    }

    /// Poll the driver for the guest address until it appears.
    async fn resolve_address(&self, layout: &VmLayout, pid: libc::pid_t) -> Result<IpAddr> {
        let boot_timeout = self.config.boot_timeout;
        let interval = self.config.address_poll_interval;
        let deadline = tokio::time::Instant::now() + boot_timeout;

        loop {
            if !process::is_alive(pid) {
                return Err(Error::driver(
                    "boot",
                    format!(
                        "hypervisor exited during boot, see {}",
                        layout.log_path().display()
                    ),
                ));
            }

            let driver = self.driver.clone();
            let probe_layout = layout.clone();
            if let Some(address) = blocking(move || driver.address(&probe_layout)).await? {
                return Ok(address);
            }

            if tokio::time::Instant::now() + interval > deadline {
                return Err(Error::timeout("waiting for VM address", boot_timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn configure_runner(
        &self,
        request: &ProvisionRequest,
        template: &str,
        address: IpAddr,
    ) -> Result<()> {
        let credentials = SshCredentials {
            user: self.config.ssh_user.clone(),
            key_path: self.config.ssh_key_path.clone(),
            port: self.config.ssh_port,
        };

        remote::wait_reachable(
            self.remote.as_ref(),
            address,
            &credentials,
            self.config.boot_timeout,
            self.config.address_poll_interval,
        )
        .await?;

        let script = remote::render_runner_script(
            template,
            &RunnerSetup {
                vm_id: request.vm_id.clone(),
                runner_name: request.runner_name.clone(),
                registration_token: request.runner_registration_token.clone(),
                runner_labels: request.runner_labels.clone(),
            },
        )?;

        let output = self.remote.run(address, &credentials, &script).await?;
        tracing::debug!(vm_id = %request.vm_id, stdout = %output.stdout.trim(), "runner setup output");
        Ok(())
    }

    /// Undo completed stages in reverse order. Returns whether every step
    /// succeeded.
    async fn rollback(&self, progress: &mut Progress) -> bool {
        if let Some(pending) = progress.pending.take() {
            tracing::debug!(vm_id = %progress.layout.vm_id, "rollback: waiting for driver work to settle");
            let _ = pending.await;
        }

        let layout = &progress.layout;
        let mut complete = true;

        if let Some(pid) = progress.pid {
            if let Err(e) = process::stop_process(pid, self.config.stop_timeout).await {
                tracing::warn!(vm_id = %layout.vm_id, pid, error = %e, "rollback: failed to stop hypervisor");
                complete = false;
            }
        }

        if progress.materialize_attempted {
            let driver = self.driver.clone();
            let owned = layout.clone();
            if let Err(e) = blocking(move || driver.delete(&owned)).await {
                tracing::warn!(vm_id = %layout.vm_id, error = %e, "rollback: driver cleanup failed");
                complete = false;
            }
        }

        if progress.dir_created {
            let root = layout.root.clone();
            if let Err(e) = blocking(move || remove_dir(&root)).await {
                tracing::warn!(vm_id = %layout.vm_id, error = %e, "rollback: failed to remove VM directory");
                complete = false;
            }
        }

        if progress.registered {
            self.registry.remove(&layout.vm_id);
        }

        tracing::info!(vm_id = %layout.vm_id, complete, "rollback finished");
        complete
    }
}

/// Create the VM root. An existing directory is never reused.
fn create_fresh_dir(vms_dir: &std::path::Path, layout: &VmLayout) -> Result<()> {
    std::fs::create_dir_all(vms_dir)
        .map_err(|e| Error::storage("create vms dir", format!("{}: {}", vms_dir.display(), e)))?;
    match std::fs::create_dir(&layout.root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::Conflict(format!(
            "VM directory {} already exists",
            layout.root.display()
        ))),
        Err(e) => Err(Error::storage(
            "create VM dir",
            format!("{}: {}", layout.root.display(), e),
        )),
    }
}

/// Remove a directory tree. A missing directory is not an error.
pub(crate) fn remove_dir(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::storage(
            "remove VM dir",
            format!("{}: {}", path.display(), e),
        )),
    }
}

/// Run blocking driver work that cannot be interrupted once started.
///
/// The task is parked in `pending` while it runs. If the caller is dropped
/// mid-stage the task keeps running and the handle is left for rollback.
async fn run_to_completion<F>(pending: &mut Option<JoinHandle<Result<()>>>, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let handle = pending.insert(tokio::task::spawn_blocking(f));
    let joined = handle.await;
    *pending = None;
    joined.map_err(|e| Error::driver("blocking task", e.to_string()))?
}

/// Run blocking driver work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::driver("blocking task", e.to_string()))?
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake collaborators shared by pipeline tests.

    use super::*;
    use crate::cache::FetchedImage;
    use crate::remote::RemoteOutput;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Object store that writes a small file after an optional delay.
    #[derive(Default)]
    pub struct FakeStore {
        pub downloads: AtomicUsize,
        pub delay: Duration,
        pub fail: bool,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn download(&self, name: &str, dest_dir: &Path) -> Result<FetchedImage> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::ObjectStore(format!("image '{}' not found", name)));
            }
            std::fs::create_dir_all(dest_dir)?;
            let path = dest_dir.join(name);
            std::fs::write(&path, b"base-image")?;
            Ok(FetchedImage {
                path,
                size_bytes: 10,
                checksum: None,
            })
        }
    }

    /// Stage at which [`FakeDriver`] fails.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailAt {
        Nothing,
        Materialize,
        Create,
        Start,
        Address,
    }

    /// Driver whose VM is a long `sleep`.
    pub struct FakeDriver {
        pub fail_at: FailAt,
        pub address: Option<IpAddr>,
        pub deletes: AtomicUsize,
        pub materialize_delay: Duration,
    }

    impl FakeDriver {
        pub fn new(fail_at: FailAt) -> Self {
            Self {
                fail_at,
                address: Some("127.0.0.1".parse().unwrap()),
                deletes: AtomicUsize::new(0),
                materialize_delay: Duration::ZERO,
            }
        }

        fn check(&self, stage: FailAt) -> Result<()> {
            if self.fail_at == stage {
                return Err(Error::driver(format!("{:?}", stage), "injected failure"));
            }
            Ok(())
        }
    }

    impl VmDriver for FakeDriver {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn materialize(&self, base_image: &Path, layout: &VmLayout) -> Result<()> {
            std::thread::sleep(self.materialize_delay);
            std::fs::copy(base_image, layout.disk_path())?;
            self.check(FailAt::Materialize)
        }

        fn create(&self, layout: &VmLayout, _: &VmResources, machine_id: &str) -> Result<()> {
            self.check(FailAt::Create)?;
            std::fs::write(layout.config_path(), machine_id)?;
            Ok(())
        }

        fn start_command(&self, _: &VmLayout) -> Result<std::process::Command> {
            self.check(FailAt::Start)?;
            let mut cmd = std::process::Command::new("sleep");
            cmd.arg("300");
            Ok(cmd)
        }

        fn delete(&self, _: &VmLayout) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn address(&self, _: &VmLayout) -> Result<Option<IpAddr>> {
            self.check(FailAt::Address)?;
            Ok(self.address)
        }
    }

    /// Machine identifier generator returning a fixed value.
    pub struct FixedMachineId;

    impl MachineIdGenerator for FixedMachineId {
        fn generate(&self) -> Result<String> {
            Ok("ZmFrZS1tYWNoaW5lLWlk".to_string())
        }
    }

    /// Remote executor that records scripts.
    #[derive(Default)]
    pub struct RecordingRemote {
        pub scripts: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RemoteExecutor for RecordingRemote {
        async fn run(&self, _: IpAddr, _: &SshCredentials, script: &str) -> Result<RemoteOutput> {
            self.scripts.lock().push(script.to_string());
            if self.fail {
                return Err(Error::Remote("script exited with 1".into()));
            }
            Ok(RemoteOutput::default())
        }

        async fn probe(&self, _: IpAddr, _: &SshCredentials) -> bool {
            true
        }
    }

    /// Config rooted in `dir` with short bounds.
    pub fn test_config(dir: &Path, max_active_vms: usize) -> AgentConfig {
        AgentConfig {
            vms_dir: dir.join("vms"),
            image_cache_dir: dir.join("cache"),
            max_active_vms,
            max_cached_images: 2,
            download_timeout: Duration::from_secs(5),
            provision_timeout: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(1),
            address_poll_interval: Duration::from_millis(50),
            ..AgentConfig::default()
        }
    }

    pub fn request(vm_id: &str, image: &str) -> ProvisionRequest {
        ProvisionRequest {
            vm_id: vm_id.to_string(),
            image_name: image.to_string(),
            runner_registration_token: "token".to_string(),
            runner_name: format!("runner-{}", vm_id),
            runner_labels: vec!["macos".to_string()],
        }
    }
}
