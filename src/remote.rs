//! Remote script execution inside VMs.
//!
//! After boot the agent finishes VM setup by piping a rendered runner setup
//! script to `bash -s` over ssh.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// How to log into a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentials {
    /// Login user.
    pub user: String,
    /// Private key file.
    pub key_path: PathBuf,
    /// SSH port.
    pub port: u16,
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code, `-1` if killed by a signal.
    pub exit_code: i32,
}

/// Runs scripts inside a VM.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` on `address`. A non-zero exit is an error.
    async fn run(
        &self,
        address: IpAddr,
        credentials: &SshCredentials,
        script: &str,
    ) -> Result<RemoteOutput>;

    /// Whether `address` currently accepts logins.
    async fn probe(&self, address: IpAddr, credentials: &SshCredentials) -> bool;
}

/// Poll `probe` until the VM accepts logins or `timeout` elapses.
pub async fn wait_reachable(
    executor: &dyn RemoteExecutor,
    address: IpAddr,
    credentials: &SshCredentials,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if executor.probe(address, credentials).await {
            return Ok(());
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(Error::timeout(format!("ssh to {}", address), timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Executor that shells out to the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    leading_args: Vec<String>,
    connect_timeout: Duration,
    exec_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor bounding each script run by `exec_timeout`.
    pub fn new(connect_timeout: Duration, exec_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            leading_args: Vec::new(),
            connect_timeout,
            exec_timeout,
        }
    }

    /// Use a different ssh client invocation.
    pub fn with_program<I, S>(mut self, program: impl Into<String>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments for running `remote_command` on `address`.
    pub fn ssh_args(
        &self,
        address: IpAddr,
        credentials: &SshCredentials,
        remote_command: &str,
    ) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            credentials.key_path.to_string_lossy().to_string(),
            "-p".to_string(),
            credentials.port.to_string(),
            format!("{}@{}", credentials.user, address),
            remote_command.to_string(),
        ]);
        args
    }

    fn command(
        &self,
        address: IpAddr,
        credentials: &SshCredentials,
        remote_command: &str,
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.ssh_args(address, credentials, remote_command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        address: IpAddr,
        credentials: &SshCredentials,
        script: &str,
    ) -> Result<RemoteOutput> {
        let mut cmd = self.command(address, credentials, "bash -s");
        cmd.stdin(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Remote(format!("failed to run {}: {}", self.program, e)))?;

        // Feeding the script counts against the timeout too; the child is
        // killed on drop if either half stalls.
        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(script.as_bytes())
                    .await
                    .map_err(|e| Error::Remote(format!("write script: {}", e)))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| Error::Remote(format!("wait for {}: {}", self.program, e)))
        };
        let output = tokio::time::timeout(self.exec_timeout, exchange)
            .await
            .map_err(|_| Error::timeout(format!("remote script on {}", address), self.exec_timeout))??;

        let result = RemoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if !output.status.success() {
            return Err(Error::Remote(format!(
                "script on {} exited with {}\nstdout: {}\nstderr: {}",
                address,
                result.exit_code,
                result.stdout.trim(),
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    async fn probe(&self, address: IpAddr, credentials: &SshCredentials) -> bool {
        let mut cmd = self.command(address, credentials, "true");
        cmd.stdin(Stdio::null());
        let bound = self.connect_timeout + Duration::from_secs(5);
        match tokio::time::timeout(bound, cmd.output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                tracing::debug!(address = %address, error = %e, "ssh probe failed to run");
                false
            }
            Err(_) => false,
        }
    }
}

/// Values substituted into the runner setup script.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSetup {
    /// VM being set up.
    pub vm_id: String,
    /// Runner name to register.
    pub runner_name: String,
    /// Runner registration token.
    pub registration_token: String,
    /// Runner labels.
    pub runner_labels: Vec<String>,
}

/// Render the runner setup script template.
///
/// Variables: `vm_id`, `runner_name`, `registration_token` and
/// `runner_labels` (comma-joined).
pub fn render_runner_script(template: &str, setup: &RunnerSetup) -> Result<String> {
    let mut tera = tera::Tera::default();
    tera.add_raw_template("runner-setup", template)
        .map_err(|e| Error::Remote(format!("invalid runner script template: {}", tera_message(&e))))?;

    let mut context = tera::Context::new();
    context.insert("vm_id", &setup.vm_id);
    context.insert("runner_name", &setup.runner_name);
    context.insert("registration_token", &setup.registration_token);
    context.insert("runner_labels", &setup.runner_labels.join(","));

    tera.render("runner-setup", &context)
        .map_err(|e| Error::Remote(format!("render runner script: {}", tera_message(&e))))
}

fn tera_message(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
