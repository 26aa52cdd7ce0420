//! Production connector backed by the [openssh] crate.
//!
//! One SSH multiplexing master is opened per machine and plays the transport
//! role; the deployment hands out independent exec channels over that master,
//! so every dialed session can spawn commands without contending with the
//! others. Uploads shell out to the local `scp`, which reuses the same
//! authentication.
//!
//! The master is shared between the transport, the deployment, and every
//! session as an [Arc]. Closing a handle releases its share; the underlying
//! connection performs its close handshake once the last share is released.

use super::{CommandResult, Connector, Deployment, MachineId, RemoteProcess, RemoteSession, Transport};
use crate::pool::Connection;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use openssh::{KnownHosts, Session};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Opens one SSH multiplexing master per machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpensshConnector;

impl OpensshConnector {
    pub fn new() -> Self {
        OpensshConnector
    }
}

#[async_trait]
impl Connector for OpensshConnector {
    async fn connect(&self, machine: &MachineId) -> Result<Connection> {
        let destination = machine.destination();
        let master = Session::connect_mux(&destination, KnownHosts::Add)
            .await
            .with_context(|| format!("could not open an SSH connection to {destination}"))?;
        let master = Arc::new(master);

        let transport = Arc::new(OpensshTransport {
            destination,
            master: Mutex::new(Some(Arc::clone(&master))),
        });
        let deployment = Arc::new(OpensshDeployment {
            master: Mutex::new(Some(master)),
        });
        let session = deployment.dial().await?;
        Ok(Connection {
            transport,
            deployment,
            session,
        })
    }
}

struct OpensshTransport {
    destination: String,
    master: Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl Transport for OpensshTransport {
    async fn upload(&self, local: &str, remote: &str) -> Result<()> {
        let target = format!("{}:{}", self.destination, remote);
        let output = Command::new("scp")
            .arg("-r")
            .arg(local)
            .arg(&target)
            .output()
            .await
            .context("could not invoke scp")?;
        if !output.status.success() {
            return Err(anyhow!(
                "scp {local} {target} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let master = self.master.lock().await.take();
        if let Some(master) = master {
            // Only the last share performs the close handshake.
            if let Ok(session) = Arc::try_unwrap(master) {
                session.close().await.with_context(|| {
                    format!("could not close the connection to {}", self.destination)
                })?;
            }
        }
        Ok(())
    }
}

struct OpensshDeployment {
    master: Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl Deployment for OpensshDeployment {
    async fn dial(&self) -> Result<Arc<dyn RemoteSession>> {
        let master = self
            .master
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("deployment is closed"))?;
        // Verify the master still answers before handing out a session.
        master
            .check()
            .await
            .context("SSH master no longer answers")?;
        Ok(Arc::new(OpensshSession {
            master: Mutex::new(Some(master)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.master.lock().await.take();
        Ok(())
    }
}

struct OpensshSession {
    master: Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl RemoteSession for OpensshSession {
    async fn spawn(&self, cmd: &str) -> Result<Box<dyn RemoteProcess>> {
        let master = self
            .master
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("session is closed"))?;
        // A dead connection must fail here, at spawn time, so the executor
        // can refresh and retry; check the master before launching.
        master
            .check()
            .await
            .with_context(|| format!("session is stale; could not spawn `{cmd}`"))?;

        let cmd = cmd.to_string();
        // The exec channel borrows the master, so the collection task owns a
        // share of it for as long as the command runs.
        let task = tokio::spawn(async move { master.shell(&cmd).output().await });
        Ok(Box::new(OpensshProcess { task }))
    }

    async fn close(&self) -> Result<()> {
        self.master.lock().await.take();
        Ok(())
    }
}

struct OpensshProcess {
    task: JoinHandle<Result<std::process::Output, openssh::Error>>,
}

#[async_trait]
impl RemoteProcess for OpensshProcess {
    async fn wait_with_output(self: Box<Self>) -> Result<CommandResult> {
        let output = self
            .task
            .await
            .context("lost contact with the remote process")?
            .context("remote command failed")?;
        Ok(CommandResult {
            // A process killed by a signal reports no exit code.
            code: output.status.code().unwrap_or(CommandResult::FAILURE_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
