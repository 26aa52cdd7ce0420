//! One authoritative connection per machine, with bounded-backoff recovery.
//!
//! The pool owns a [Connection] triple for every `(host, user)` key it has
//! successfully established. Entries are never partially written: a key is
//! either absent or maps to a complete triple. All mutation funnels through
//! [ConnectionPool::establish], [ConnectionPool::refresh], and
//! [ConnectionPool::shutdown]; readers capture the triple once per call
//! instead of re-reading the map, so a concurrent refresh can replace a key
//! mid-operation without corrupting anyone.

use crate::remote::{Connector, Deployment, MachineId, RemoteSession, Transport};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, warn};

/// The live triple for one machine: transport, deployment, and the primary
/// session.
///
/// Cloning is cheap (the fields are shared handles) and captures the triple
/// as of one instant; a superseding connection fully replaces the entry in
/// the pool, never merges with it.
#[derive(Clone)]
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub deployment: Arc<dyn Deployment>,
    pub session: Arc<dyn RemoteSession>,
}

/// Backoff parameters for [ConnectionPool::refresh].
///
/// A refresh keeps calling establish until one call succeeds or the budget is
/// spent: it makes `floor(budget / backoff) + 1` attempts, pausing `backoff`
/// between attempts but never after the last one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between establish attempts.
    pub backoff: Duration,
    /// Total time spent backing off before giving up.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: Duration::from_secs(42),
            budget: Duration::from_secs(210),
        }
    }
}

/// Maps machine identities to live [Connection]s.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<MachineId, Connection>>,
    retry: RetryPolicy,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_retry(connector, RetryPolicy::default())
    }

    pub fn with_retry(connector: Arc<dyn Connector>, retry: RetryPolicy) -> Self {
        ConnectionPool {
            connector,
            connections: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Concurrently establish a connection to every machine under the key
    /// `(machine, user)`.
    ///
    /// One task per machine, no concurrency cap; every task completes before
    /// this returns, so the pool is never left half-initialized behind the
    /// caller's back. On failure, the first error is returned with the
    /// offending machine named; the remaining machines' connections still
    /// land in the pool.
    pub async fn initialize(self: &Arc<Self>, machines: &[String], user: &str) -> Result<()> {
        let mut tasks = Vec::with_capacity(machines.len());
        for host in machines {
            let machine = MachineId::new(host.clone(), user);
            let pool = Arc::clone(self);
            let task = {
                let machine = machine.clone();
                tokio::spawn(async move { pool.establish(&machine).await })
            };
            tasks.push((machine, task));
        }

        let mut first_failure = None;
        for (machine, task) in tasks {
            let outcome = task.await.unwrap_or_else(|err| Err(anyhow!(err)));
            if let Err(err) = outcome {
                warn!(machine = %machine, error = %err, "initial connection failed");
                if first_failure.is_none() {
                    first_failure =
                        Some(err.context(format!("could not establish a connection to {machine}")));
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Open the transport, start the deployment, dial the initial session,
    /// and store the triple under `machine`'s key.
    ///
    /// If the key was already occupied, the superseded triple is replaced
    /// atomically and then closed best-effort, so establishing over a live
    /// entry does not leak its handles.
    pub async fn establish(&self, machine: &MachineId) -> Result<()> {
        debug!(machine = %machine, "establishing connection");
        let connection = self.connector.connect(machine).await?;
        let superseded = self
            .connections
            .lock()
            .unwrap()
            .insert(machine.clone(), connection);
        if let Some(old) = superseded {
            debug!(machine = %machine, "closing superseded connection");
            close_connection(&old, machine).await;
        }
        Ok(())
    }

    /// Tear down whatever remains of `machine`'s entry, then retry
    /// [Self::establish] with a fixed pause between attempts until the pool's
    /// time budget runs out.
    ///
    /// Returns whether a connection was re-established. Exhausting the budget
    /// is reported, not fatal: it logs at error level and returns `false`,
    /// leaving the reaction to the caller.
    pub async fn refresh(&self, machine: &MachineId) -> bool {
        self.refresh_within(machine, self.retry.budget).await
    }

    /// [Self::refresh] with an explicit time budget.
    pub async fn refresh_within(&self, machine: &MachineId, budget: Duration) -> bool {
        let stale = self.connections.lock().unwrap().remove(machine);
        if let Some(old) = stale {
            // The entry may already be half-dead; close errors are expected
            // here and are only logged.
            close_connection(&old, machine).await;
        }

        let backoff = self.retry.backoff;
        let step = backoff.as_millis() as i64;
        let mut remaining = budget.as_millis() as i64;
        loop {
            match self.establish(machine).await {
                Ok(()) => {
                    debug!(machine = %machine, "connection re-established");
                    return true;
                }
                Err(err) => {
                    remaining -= step;
                    if remaining < 0 {
                        break;
                    }
                    debug!(
                        machine = %machine,
                        error = %err,
                        "could not connect; retrying in {}s",
                        backoff.as_secs(),
                    );
                    time::sleep(backoff).await;
                }
            }
        }
        error!(machine = %machine, "unable to connect; retry budget exhausted");
        false
    }

    /// Capture the current triple for `machine`, if any.
    pub fn get(&self, machine: &MachineId) -> Option<Connection> {
        self.connections.lock().unwrap().get(machine).cloned()
    }

    /// Mint a fresh session from `machine`'s stored deployment, leaving the
    /// pooled primary session untouched.
    ///
    /// If the deployment no longer answers (or the machine was never pooled),
    /// runs one [Self::refresh] and dials again; returns [None] once that
    /// also fails.
    pub async fn session(&self, machine: &MachineId) -> Option<Arc<dyn RemoteSession>> {
        if let Some(connection) = self.get(machine) {
            match connection.deployment.dial().await {
                Ok(session) => return Some(session),
                Err(err) => {
                    debug!(machine = %machine, error = %err, "dial failed; refreshing connection")
                }
            }
        }
        if !self.refresh(machine).await {
            error!(machine = %machine, "could not connect");
            return None;
        }
        let connection = self.get(machine)?;
        match connection.deployment.dial().await {
            Ok(session) => Some(session),
            Err(err) => {
                error!(machine = %machine, error = %err, "dial failed on a fresh connection");
                None
            }
        }
    }

    /// Copy a local file or directory to `machine` over the stored transport.
    ///
    /// Transfer errors propagate unmodified; there is no retry and no pool
    /// interaction here.
    pub async fn upload(&self, machine: &MachineId, local: &str, remote: &str) -> Result<()> {
        let connection = self
            .get(machine)
            .with_context(|| format!("no connection to {machine}"))?;
        connection.transport.upload(local, remote).await
    }

    /// Close every pooled session, deployment, and transport, in that order.
    ///
    /// A close failure is logged and the loop continues, so teardown reaches
    /// every entry. The pool is drained first, which makes a second call a
    /// no-op rather than an error.
    pub async fn shutdown(&self) {
        let connections: Vec<(MachineId, Connection)> =
            self.connections.lock().unwrap().drain().collect();
        for (machine, connection) in connections {
            debug!(machine = %machine, "closing connection");
            close_connection(&connection, &machine).await;
        }
    }
}

/// Close session, deployment, and transport in order, logging failures.
async fn close_connection(connection: &Connection, machine: &MachineId) {
    if let Err(err) = connection.session.close().await {
        debug!(machine = %machine, error = %err, "session close failed");
    }
    if let Err(err) = connection.deployment.close().await {
        debug!(machine = %machine, error = %err, "deployment close failed");
    }
    if let Err(err) = connection.transport.close().await {
        debug!(machine = %machine, error = %err, "transport close failed");
    }
}
