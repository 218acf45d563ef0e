//! Periodic heartbeat to the orchestrator.
//!
//! Every `heartbeat_interval` the agent POSTs its node status and a sample of
//! host load and disk space to `<orchestrator_url>/api/heartbeat`. A failed
//! heartbeat is logged and the next tick tries again.

use crate::agent::{Agent, NodeStatus};
use crate::config::ClientTlsConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Bound on one heartbeat request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Host resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    /// One-minute load average.
    pub load_average: Option<f64>,
    /// Size of the filesystem holding the VM directories.
    pub disk_total_bytes: Option<u64>,
    /// Space on that filesystem available to the agent.
    pub disk_free_bytes: Option<u64>,
}

impl HostMetrics {
    /// Sample the load average and the filesystem holding `path`.
    pub fn sample(path: &Path) -> Self {
        let (disk_total_bytes, disk_free_bytes) = match disk_space(path) {
            Some((total, free)) => (Some(total), Some(free)),
            None => (None, None),
        };
        Self {
            load_average: load_average(),
            disk_total_bytes,
            disk_free_bytes,
        }
    }
}

fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n >= 1).then_some(loads[0])
}

#[allow(clippy::unnecessary_cast)]
fn disk_space(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let fragment = stat.f_frsize as u64;
    Some((
        stat.f_blocks as u64 * fragment,
        stat.f_bavail as u64 * fragment,
    ))
}

/// Body of a heartbeat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Node health.
    pub status: String,
    /// Node status snapshot.
    #[serde(flatten)]
    pub node: NodeStatus,
    /// Host resource usage.
    #[serde(flatten)]
    pub host: HostMetrics,
}

/// Sends heartbeats until shutdown.
pub struct HeartbeatSender {
    agent: Arc<Agent>,
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl HeartbeatSender {
    /// Create a sender from the agent's configuration.
    ///
    /// Returns `None` when no orchestrator URL is configured.
    pub fn new(agent: Arc<Agent>, shutdown_rx: watch::Receiver<bool>) -> Result<Option<Self>> {
        let config = agent.config();
        let Some(url) = config.orchestrator_url.as_deref() else {
            return Ok(None);
        };
        let client = build_client(config.orchestrator_tls.as_ref())?;
        let endpoint = format!("{}/api/heartbeat", url.trim_end_matches('/'));
        let interval = config.heartbeat_interval;

        Ok(Some(Self {
            agent,
            client,
            endpoint,
            interval,
            shutdown_rx,
        }))
    }

    /// Heartbeat URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current heartbeat body.
    pub fn payload(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            status: "healthy".to_string(),
            node: self.agent.status(),
            host: HostMetrics::sample(&self.agent.config().vms_dir),
        }
    }

    /// Send one heartbeat. A non-2xx response is an error.
    pub async fn send(&self) -> Result<()> {
        let payload = self.payload();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Heartbeat(format!("POST {}: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Heartbeat(format!(
                "orchestrator returned {}: {}",
                status,
                body.trim()
            )));
        }
        tracing::debug!(vm_count = payload.node.vm_count, "heartbeat sent");
        Ok(())
    }

    /// Run the heartbeat loop.
    ///
    /// This method returns once shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(endpoint = %self.endpoint, interval = ?self.interval, "heartbeat sender started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send().await {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("heartbeat sender shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn build_client(tls: Option<&ClientTlsConfig>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("vmhost/", env!("CARGO_PKG_VERSION")));

    if let Some(tls) = tls {
        let ca = read_pem(&tls.ca_cert)?;
        let ca = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| Error::Config(format!("CA certificate {}: {}", tls.ca_cert.display(), e)))?;

        let mut identity = read_pem(&tls.client_cert)?;
        identity.push(b'\n');
        identity.extend(read_pem(&tls.client_key)?);
        let identity = reqwest::Identity::from_pem(&identity).map_err(|e| {
            Error::Config(format!(
                "client certificate {}: {}",
                tls.client_cert.display(),
                e
            ))
        })?;

        builder = builder
            .add_root_certificate(ca)
            .identity(identity)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("heartbeat client: {}", e)))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))
}
