//! VM liveness supervisor.
//!
//! The supervisor runs as a background task that periodically checks that
//! every running VM's hypervisor is still alive. A VM whose hypervisor has
//! exited is marked failed; it keeps its admission slot until the
//! orchestrator deletes it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::agent::Agent;

/// VM liveness supervisor.
pub struct Supervisor {
    agent: Arc<Agent>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor ticking at the agent's monitor interval.
    pub fn new(agent: Arc<Agent>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let interval = agent.config().monitor_interval;
        Self {
            agent,
            interval,
            shutdown_rx,
        }
    }

    /// Run the supervisor loop.
    ///
    /// This method returns once shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all_vms();
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn check_all_vms(&self) {
        let failed = self.agent.check_vms();
        if !failed.is_empty() {
            tracing::warn!(vms = ?failed, "VMs exited without being deleted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Collaborators;
    use crate::provision::testing::*;
    use crate::registry::VmState;

    #[tokio::test]
    async fn test_supervisor_marks_exited_vm_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 1);
        config.monitor_interval = Duration::from_millis(20);
        let agent = Arc::new(crate::Agent::new(
            config,
            Collaborators {
                driver: Arc::new(FakeDriver::new(FailAt::Nothing)),
                store: Arc::new(FakeStore::default()),
                machine_ids: Arc::new(FixedMachineId),
                remote: Arc::new(RecordingRemote::default()),
                runner_template: None,
            },
        ));

        let info = agent.provision_now(request("vm-1", "sonoma")).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Supervisor::new(agent.clone(), rx).run());

        crate::process::stop_process(info.pid.unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while agent.registry().get("vm-1").unwrap().state != VmState::Failed {
            assert!(tokio::time::Instant::now() < deadline, "VM never marked failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        agent.delete_now("vm-1").await;
    }
}
