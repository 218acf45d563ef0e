//! End-to-end tests through the HTTP router with fake collaborators.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use vmhost::agent::NodeStatus;
use vmhost::cache::FetchedImage;
use vmhost::config::AgentConfig;
use vmhost::driver::{VmDriver, VmLayout, VmResources};
use vmhost::machine_id::MachineIdGenerator;
use vmhost::registry::VmState;
use vmhost::remote::{RemoteExecutor, RemoteOutput, SshCredentials};
use vmhost::store::ObjectStore;
use vmhost::{Agent, Collaborators, Error, Result};

/// Object store that counts downloads per image name.
#[derive(Default)]
struct CountingStore {
    delay: Duration,
    downloads: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    fn count(&self, name: &str) -> usize {
        self.downloads.lock().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn download(&self, name: &str, dest_dir: &Path) -> Result<FetchedImage> {
        *self.downloads.lock().entry(name.to_string()).or_default() += 1;
        tokio::time::sleep(self.delay).await;
        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(name);
        std::fs::write(&path, name.as_bytes())?;
        Ok(FetchedImage {
            path,
            size_bytes: name.len() as u64,
            checksum: None,
        })
    }
}

/// Driver whose VM is a long `sleep`.
struct SleepDriver;

impl VmDriver for SleepDriver {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn materialize(&self, base_image: &Path, layout: &VmLayout) -> Result<()> {
        std::fs::copy(base_image, layout.disk_path())?;
        Ok(())
    }

    fn create(&self, layout: &VmLayout, _: &VmResources, machine_id: &str) -> Result<()> {
        std::fs::write(layout.config_path(), machine_id)?;
        Ok(())
    }

    fn start_command(&self, _: &VmLayout) -> Result<std::process::Command> {
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("300");
        Ok(cmd)
    }

    fn delete(&self, _: &VmLayout) -> Result<()> {
        Ok(())
    }

    fn address(&self, _: &VmLayout) -> Result<Option<IpAddr>> {
        Ok(None)
    }
}

struct FixedMachineId;

impl MachineIdGenerator for FixedMachineId {
    fn generate(&self) -> Result<String> {
        Ok("bWFjaGluZS1pZA==".to_string())
    }
}

struct NoRemote;

#[async_trait]
impl RemoteExecutor for NoRemote {
    async fn run(&self, _: IpAddr, _: &SshCredentials, _: &str) -> Result<RemoteOutput> {
        Err(Error::Remote("remote execution not expected".into()))
    }

    async fn probe(&self, _: IpAddr, _: &SshCredentials) -> bool {
        false
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    agent: Arc<Agent>,
    store: Arc<CountingStore>,
    router: axum::Router,
}

fn harness(max_active_vms: usize, max_cached_images: usize, download_delay: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        node_id: "mini-test".to_string(),
        vms_dir: dir.path().join("vms"),
        image_cache_dir: dir.path().join("cache"),
        max_active_vms,
        max_cached_images,
        download_timeout: Duration::from_secs(10),
        provision_timeout: Duration::from_secs(10),
        delete_timeout: Duration::from_secs(10),
        stop_timeout: Duration::from_secs(2),
        ..AgentConfig::default()
    };
    let store = Arc::new(CountingStore {
        delay: download_delay,
        ..Default::default()
    });
    let agent = Arc::new(Agent::new(
        config,
        Collaborators {
            driver: Arc::new(SleepDriver),
            store: store.clone(),
            machine_ids: Arc::new(FixedMachineId),
            remote: Arc::new(NoRemote),
            runner_template: None,
        },
    ));
    let router = vmhost::api::create_router(agent.clone());
    Harness {
        _dir: dir,
        agent,
        store,
        router,
    }
}

impl Harness {
    async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    async fn provision(&self, vm_id: &str, image: &str) -> (StatusCode, serde_json::Value) {
        self.post(
            "/provision-vm",
            serde_json::json!({
                "vmId": vm_id,
                "imageName": image,
                "runnerRegistrationToken": "token",
                "runnerName": format!("runner-{}", vm_id),
                "runnerLabels": ["macos"],
            }),
        )
        .await
    }

    async fn status(&self) -> NodeStatus {
        let (status, body) = self.get("/status").await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body).unwrap()
    }

    /// Poll until `check` holds on the node status.
    async fn wait_for(&self, what: &str, check: impl Fn(&NodeStatus) -> bool) -> NodeStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.status().await;
            if check(&status) {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_running(&self, vm_id: &str) -> NodeStatus {
        self.wait_for(vm_id, |s| {
            s.vms
                .iter()
                .any(|vm| vm.vm_id == vm_id && vm.state == VmState::Running)
        })
        .await
    }

    async fn finish(self) {
        for vm in self.agent.status().vms {
            self.agent.delete_now(&vm.vm_id).await;
        }
        self.agent.shutdown().await;
    }
}

#[tokio::test]
async fn test_health() {
    let h = harness(1, 2, Duration::ZERO);
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], vmhost::VERSION);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = harness(1, 2, Duration::ZERO);

    let (status, body) = h.provision("../escape", "sonoma").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);

    let (status, _) = h.provision("vm-1", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.post("/provision-vm", serde_json::json!([1, 2])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.post("/delete-vm", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(h.status().await.available_slots, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_is_enforced_until_delete() {
    let h = harness(1, 2, Duration::ZERO);

    let (status, body) = h.provision("vm-A", "sonoma").await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["vmId"], "vm-A");
    assert_eq!(body["nodeId"], "mini-test");
    h.wait_running("vm-A").await;

    let (status, body) = h.provision("vm-B", "sonoma").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["retryable"], true);

    let (status, _) = h.provision("vm-A", "sonoma").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = h.post("/delete-vm", serde_json::json!({"vmId": "vm-A"})).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    h.wait_for("slot release", |s| s.available_slots == 1 && s.vms.is_empty())
        .await;

    let (status, _) = h.provision("vm-B", "sonoma").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let status = h.wait_running("vm-B").await;
    assert_eq!(status.available_slots, 0);
    assert_eq!(h.store.count("sonoma"), 1);

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_least_recently_used_image_is_evicted() {
    let h = harness(1, 2, Duration::ZERO);

    for (vm_id, image) in [("vm-1", "A"), ("vm-2", "B"), ("vm-3", "C")] {
        h.agent
            .provision_now(vmhost::provision::ProvisionRequest {
                vm_id: vm_id.to_string(),
                image_name: image.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        h.agent.delete_now(vm_id).await;
    }

    let status = h.status().await;
    let cached: Vec<&str> = status.cached_images.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(cached, vec!["C", "B"]);
    assert!(!h.agent.cache().dir().join("A").exists());

    let (code, _) = h.provision("vm-4", "A").await;
    assert_eq!(code, StatusCode::ACCEPTED);
    h.wait_running("vm-4").await;
    assert_eq!(h.store.count("A"), 2);
    assert_eq!(h.store.count("B"), 1);
    assert_eq!(h.store.count("C"), 1);

    let cached: Vec<String> = h
        .status()
        .await
        .cached_images
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(cached, vec!["A".to_string(), "C".to_string()]);

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_requests_share_one_download() {
    let h = harness(2, 2, Duration::from_millis(300));

    let (a, b) = tokio::join!(h.provision("X", "sonoma"), h.provision("X", "sonoma"));
    assert_eq!(a.0, StatusCode::ACCEPTED);
    assert_eq!(b.0, StatusCode::ACCEPTED);

    let status = h.wait_running("X").await;
    h.wait_for("losing pipeline to finish", |s| s.available_slots == 1)
        .await;

    assert_eq!(h.store.count("sonoma"), 1);
    assert_eq!(status.vms.len(), 1);
    assert_eq!(
        h.agent.cache().get("sonoma"),
        Some(h.agent.cache().dir().join("sonoma"))
    );

    h.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_is_idempotent() {
    let h = harness(1, 2, Duration::ZERO);

    h.provision("vm-1", "sonoma").await;
    h.wait_running("vm-1").await;

    for _ in 0..2 {
        let (status, body) = h.post("/delete-vm", serde_json::json!({"vmId": "vm-1"})).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    }
    h.wait_for("deletion", |s| s.vms.is_empty() && s.available_slots == 1)
        .await;
    let (status, _) = h.post("/delete-vm", serde_json::json!({"vmId": "vm-1"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    h.finish().await;
}
