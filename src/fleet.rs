//! Fleet-wide dispatch, and the facade the test harness calls.
//!
//! [Fleet] ties the topology, pool, and executor together under one remote
//! user identity. Test cases address machines by host name; the fleet fills
//! in the default user, or the `*_as` variants take an explicit one.

use crate::executor::{AsyncHandle, Executor};
use crate::pool::ConnectionPool;
use crate::remote::{CommandResult, Connector, MachineId, RemoteSession};
use crate::topology::FleetTopology;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The whole test environment: every machine in the fleet, reachable through
/// one connection pool.
pub struct Fleet {
    topology: FleetTopology,
    user: String,
    executor: Executor,
}

impl Fleet {
    pub fn new(
        topology: FleetTopology,
        user: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::with_pool(topology, user, Arc::new(ConnectionPool::new(connector)))
    }

    /// Build a fleet around an existing pool, e.g. one with a custom
    /// [RetryPolicy].
    ///
    /// [RetryPolicy]: crate::pool::RetryPolicy
    pub fn with_pool(
        topology: FleetTopology,
        user: impl Into<String>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Fleet {
            topology,
            user: user.into(),
            executor: Executor::new(pool),
        }
    }

    /// Stop logging captured stdout/stderr fleet-wide.
    pub fn quiet(mut self) -> Self {
        self.executor = self.executor.quiet();
        self
    }

    pub fn topology(&self) -> &FleetTopology {
        &self.topology
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.executor.pool()
    }

    /// The pool key for `host` under the fleet's default user.
    pub fn machine(&self, host: &str) -> MachineId {
        MachineId::new(host, &self.user)
    }

    /// Concurrently connect to every machine in the fleet.
    pub async fn initialize(&self) -> Result<()> {
        let machines = self.topology.all_machines();
        info!(machines = machines.len(), "initializing fleet connections");
        self.pool().initialize(&machines, &self.user).await
    }

    /// Run `cmd` on `host` and block until it exits. See [Executor::run].
    pub async fn run(&self, host: &str, cmd: &str) -> CommandResult {
        self.executor.run(&self.machine(host), cmd).await
    }

    /// [Self::run] under an explicit user instead of the fleet default.
    pub async fn run_as(&self, host: &str, cmd: &str, user: &str) -> CommandResult {
        self.executor.run(&MachineId::new(host, user), cmd).await
    }

    /// Spawn `cmd` on `host` without waiting. See [Executor::run_async].
    pub async fn run_async(&self, host: &str, cmd: &str) -> Option<AsyncHandle> {
        self.executor.run_async(&self.machine(host), cmd).await
    }

    /// [Self::run_async] under an explicit user.
    pub async fn run_async_as(&self, host: &str, cmd: &str, user: &str) -> Option<AsyncHandle> {
        self.executor
            .run_async(&MachineId::new(host, user), cmd)
            .await
    }

    /// Run `cmd` on every server in the fleet concurrently and collect each
    /// machine's return code.
    ///
    /// Every dispatch is issued before any result is awaited; results are
    /// then checked sequentially in topology order, not completion order.
    /// The aggregate flag is true iff every server exited zero. A machine
    /// that could not be dispatched at all records
    /// [CommandResult::FAILURE_CODE] and does not stop the others.
    pub async fn run_servers(&self, cmd: &str) -> (bool, HashMap<String, i32>) {
        self.run_servers_as(cmd, &self.user).await
    }

    /// [Self::run_servers] under an explicit user.
    pub async fn run_servers_as(&self, cmd: &str, user: &str) -> (bool, HashMap<String, i32>) {
        let servers = self.topology.servers();
        info!(servers = servers.len(), cmd, "dispatching to all servers");

        let mut dispatches = Vec::with_capacity(servers.len());
        for host in servers {
            let executor = self.executor.clone();
            let machine = MachineId::new(host.clone(), user);
            let cmd = cmd.to_string();
            let task = tokio::spawn(async move {
                match executor.run_async(&machine, &cmd).await {
                    Some(handle) => handle.wait().await.code,
                    None => CommandResult::FAILURE_CODE,
                }
            });
            dispatches.push((host, task));
        }

        let mut codes = HashMap::with_capacity(dispatches.len());
        let mut all_ok = true;
        for (host, task) in dispatches {
            let code = task.await.unwrap_or(CommandResult::FAILURE_CODE);
            if code != 0 {
                all_ok = false;
            }
            codes.insert(host, code);
        }
        (all_ok, codes)
    }

    /// Mint an extra session to `host`, reconnecting if needed. See
    /// [ConnectionPool::session].
    pub async fn session(&self, host: &str) -> Option<Arc<dyn RemoteSession>> {
        self.pool().session(&self.machine(host)).await
    }

    /// [Self::session] under an explicit user.
    pub async fn session_as(&self, host: &str, user: &str) -> Option<Arc<dyn RemoteSession>> {
        self.pool().session(&MachineId::new(host, user)).await
    }

    /// Copy a local file or directory to `host`. Transfer errors propagate
    /// unmodified.
    pub async fn upload(&self, host: &str, local: &str, remote: &str) -> Result<()> {
        self.pool().upload(&self.machine(host), local, remote).await
    }

    /// Close every pooled connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("shutting down fleet connections");
        self.pool().shutdown().await;
    }
}
