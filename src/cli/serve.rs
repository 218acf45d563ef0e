//! Agent server command.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use vmhost::api::supervisor::Supervisor;
use vmhost::config::{AgentConfig, DriverKind};
use vmhost::error::Error;
use vmhost::heartbeat::HeartbeatSender;
use vmhost::{Agent, Result};

/// Run the agent: recover on-disk state, then serve the HTTP API.
#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Listen address.
    #[arg(short, long, env = "VMHOST_LISTEN")]
    listen: Option<String>,

    /// Node identifier reported to the orchestrator.
    #[arg(long, env = "VMHOST_NODE_ID")]
    node_id: Option<String>,

    /// Directory holding one subdirectory per VM.
    #[arg(long, env = "VMHOST_VMS_DIR")]
    vms_dir: Option<PathBuf>,

    /// Directory holding cached base images.
    #[arg(long, env = "VMHOST_IMAGE_CACHE_DIR")]
    image_cache_dir: Option<PathBuf>,

    /// Maximum number of cached images.
    #[arg(long, env = "VMHOST_MAX_CACHED_IMAGES")]
    max_cached_images: Option<usize>,

    /// Maximum number of concurrently active VMs.
    #[arg(long, env = "VMHOST_MAX_ACTIVE_VMS")]
    max_active_vms: Option<usize>,

    /// Hypervisor backend (macosvm, tart).
    #[arg(long, env = "VMHOST_DRIVER")]
    driver: Option<DriverKind>,

    /// Hypervisor binary.
    #[arg(long, env = "VMHOST_HYPERVISOR_BINARY")]
    hypervisor_binary: Option<PathBuf>,

    /// Runner setup script template.
    #[arg(long, env = "VMHOST_RUNNER_SCRIPT")]
    runner_script_template: Option<PathBuf>,

    /// Orchestrator base URL for heartbeats.
    #[arg(long, env = "VMHOST_ORCHESTRATOR_URL")]
    orchestrator_url: Option<String>,
}

impl ServeCmd {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(dir) = &self.vms_dir {
            config.vms_dir = dir.clone();
        }
        if let Some(dir) = &self.image_cache_dir {
            config.image_cache_dir = dir.clone();
        }
        if let Some(n) = self.max_cached_images {
            config.max_cached_images = n;
        }
        if let Some(n) = self.max_active_vms {
            config.max_active_vms = n;
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
        if let Some(binary) = &self.hypervisor_binary {
            config.hypervisor_binary = Some(binary.clone());
        }
        if let Some(template) = &self.runner_script_template {
            config.runner_script_template = Some(template.clone());
        }
        if let Some(url) = &self.orchestrator_url {
            config.orchestrator_url = Some(url.clone());
        }
    }

    /// Run the serve command.
    pub fn run(self, mut config: AgentConfig) -> Result<()> {
        self.apply(&mut config);
        config.validate()?;

        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            Error::Config(format!("invalid listen address '{}': {}", config.listen, e))
        })?;

        let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
        runtime.block_on(run_server(config, addr))
    }
}

async fn run_server(config: AgentConfig, addr: SocketAddr) -> Result<()> {
    let agent = Arc::new(Agent::from_config(config)?);
    agent.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = HeartbeatSender::new(agent.clone(), shutdown_rx.clone())?
        .map(|sender| tokio::spawn(sender.run()));
    let supervisor = tokio::spawn(Supervisor::new(agent.clone(), shutdown_rx).run());

    let app = vmhost::api::create_router(agent.clone());
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;

    tracing::info!(address = %addr, node_id = %agent.node_id(), "starting HTTP API server");
    println!("vmhost agent listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor.await {
        tracing::warn!(error = %e, "supervisor task failed");
    }
    if let Some(heartbeat) = heartbeat {
        if let Err(e) = heartbeat.await {
            tracing::warn!(error = %e, "heartbeat task failed");
        }
    }
    agent.shutdown().await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cmd = ServeCmd::try_parse_from([
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--max-active-vms",
            "1",
            "--driver",
            "tart",
            "--orchestrator-url",
            "http://orchestrator:8080",
        ])
        .unwrap();

        let mut config = AgentConfig::default();
        cmd.apply(&mut config);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.max_active_vms, 1);
        assert_eq!(config.driver, DriverKind::Tart);
        assert_eq!(config.orchestrator_url.as_deref(), Some("http://orchestrator:8080"));
        assert_eq!(config.max_cached_images, 5);
    }
}
