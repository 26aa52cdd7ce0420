//! Runs a single shell command on one pooled machine, blocking or not.
//!
//! Both entry points share the same recovery contract: a failed spawn or dial
//! triggers at most one refresh-and-retry cycle, never a loop. A second
//! consecutive failure surfaces as [CommandResult::failed] (for [Executor::run])
//! or [None] (for [Executor::run_async]) instead of an error, so one dead
//! machine cannot abort a caller that is driving many machines at once.

use crate::pool::ConnectionPool;
use crate::remote::{CommandResult, MachineId, RemoteProcess, RemoteSession};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Runs commands over pooled connections.
///
/// Cheap to clone; clones share the same pool, so one can be moved into each
/// dispatch task.
#[derive(Clone)]
pub struct Executor {
    pool: Arc<ConnectionPool>,
    verbose: bool,
}

impl Executor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Executor {
            pool,
            verbose: true,
        }
    }

    /// Stop logging captured stdout/stderr. The return code is still logged;
    /// verbosity never changes what is returned.
    pub fn quiet(mut self) -> Self {
        self.verbose = false;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run `cmd` on `machine` under a shell and block until it exits.
    ///
    /// Spawns on the pooled primary session. If the spawn fails, refreshes
    /// the connection once and retries the spawn exactly once; if the refresh
    /// or the retried spawn also fails, returns [CommandResult::failed].
    pub async fn run(&self, machine: &MachineId, cmd: &str) -> CommandResult {
        info!(machine = %machine, cmd, "executing");
        let process = match self.spawn_pooled(machine, cmd).await {
            Some(process) => process,
            None => return CommandResult::failed(),
        };
        let result = match process.wait_with_output().await {
            Ok(result) => result,
            Err(err) => {
                error!(machine = %machine, cmd, error = %err, "could not collect command output");
                return CommandResult::failed();
            }
        };
        info!(machine = %machine, cmd, code = result.code, "command finished");
        if self.verbose {
            if !result.stdout.is_empty() {
                info!(machine = %machine, cmd, "stdout:\n{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                error!(machine = %machine, cmd, "stderr:\n{}", result.stderr);
            }
        }
        result
    }

    /// Spawn `cmd` on a session dialed just for this call, leaving the pooled
    /// primary session free for other callers, and return a handle to wait on
    /// or abandon the command.
    ///
    /// Dialing the private session already retries once via the pool; returns
    /// [None] if no session could be obtained or the spawn on the fresh
    /// session fails.
    pub async fn run_async(&self, machine: &MachineId, cmd: &str) -> Option<AsyncHandle> {
        let session = self.pool.session(machine).await?;
        info!(machine = %machine, cmd, "executing asynchronously");
        let process = match session.spawn(cmd).await {
            Ok(process) => process,
            Err(err) => {
                error!(machine = %machine, cmd, error = %err, "spawn failed on a private session");
                if let Err(err) = session.close().await {
                    debug!(machine = %machine, error = %err, "session close failed");
                }
                return None;
            }
        };
        Some(AsyncHandle {
            machine: machine.clone(),
            cmd: cmd.to_string(),
            session,
            process,
            verbose: self.verbose,
        })
    }

    /// The spawn-refresh-retry state machine shared with [Self::run]:
    /// one spawn, at most one refresh, at most one more spawn.
    async fn spawn_pooled(&self, machine: &MachineId, cmd: &str) -> Option<Box<dyn RemoteProcess>> {
        if let Some(connection) = self.pool.get(machine) {
            match connection.session.spawn(cmd).await {
                Ok(process) => return Some(process),
                Err(err) => {
                    debug!(machine = %machine, cmd, error = %err, "spawn failed; refreshing connection")
                }
            }
        }
        if !self.pool.refresh(machine).await {
            error!(machine = %machine, "connection could not be established");
            return None;
        }
        let connection = self.pool.get(machine)?;
        match connection.session.spawn(cmd).await {
            Ok(process) => Some(process),
            Err(err) => {
                error!(machine = %machine, cmd, error = %err, "spawn failed on a fresh session");
                None
            }
        }
    }
}

/// One asynchronously spawned remote process plus the private session it runs
/// on.
///
/// The session belongs to this handle alone: waiting on or abandoning the
/// command tears the session down without touching the pool's entry for the
/// machine.
pub struct AsyncHandle {
    machine: MachineId,
    cmd: String,
    session: Arc<dyn RemoteSession>,
    process: Box<dyn RemoteProcess>,
    verbose: bool,
}

impl AsyncHandle {
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// Block until the process exits, close the private session, and return
    /// the collected result.
    pub async fn wait(self) -> CommandResult {
        let result = match self.process.wait_with_output().await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    machine = %self.machine,
                    cmd = %self.cmd,
                    error = %err,
                    "could not collect command output",
                );
                CommandResult::failed()
            }
        };
        if let Err(err) = self.session.close().await {
            debug!(machine = %self.machine, error = %err, "session close failed");
        }
        info!(machine = %self.machine, cmd = %self.cmd, code = result.code, "command finished");
        if self.verbose {
            if !result.stdout.is_empty() {
                debug!(machine = %self.machine, cmd = %self.cmd, "stdout:\n{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                error!(machine = %self.machine, cmd = %self.cmd, "stderr:\n{}", result.stderr);
            }
        }
        result
    }

    /// Abandon the command without waiting for it and close the private
    /// session.
    pub async fn close(self) {
        if let Err(err) = self.session.close().await {
            debug!(machine = %self.machine, error = %err, "session close failed");
        }
    }
}
