//! The capabilities this crate consumes to reach a machine.
//!
//! Everything here is a seam: the pool and executor talk to remote machines
//! only through these traits, so the transport can be swapped out (or faked in
//! tests) without touching the connection or dispatch logic. The production
//! implementation lives in [openssh].
//!
//! A connected machine is represented by a triple of capabilities:
//!
//! * [Transport] — the authenticated channel to the host. Owns host-level
//!   operations: closing the channel and uploading files.
//! * [Deployment] — the execution service stood up over that transport. Mints
//!   independent [RemoteSession]s on demand.
//! * [RemoteSession] — a channel through which commands are spawned.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::pool::Connection;

#[cfg(feature = "openssh")]
pub mod openssh;

/// One remote account on one machine: the key into the connection pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MachineId {
    host: String,
    user: String,
}

impl MachineId {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        MachineId {
            host: host.into(),
            user: user.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The `user@host` form, or just `host` when no user is set.
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination())
    }
}

/// What a finished remote command left behind.
///
/// A nonzero [code] is not an error of this layer; it is data for the caller
/// to interpret. The sentinel value [CommandResult::failed] means the command
/// could not be executed at all, e.g. because the machine's connection could
/// not be re-established.
///
/// [code]: CommandResult::code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// The return code recorded when a command could not be executed.
    pub const FAILURE_CODE: i32 = -1;

    /// The sentinel for "could not execute": [Self::FAILURE_CODE] and empty
    /// output streams.
    pub fn failed() -> Self {
        CommandResult {
            code: Self::FAILURE_CODE,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// An open, authenticated channel to a host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Copy a local file or directory to a path on the remote host.
    async fn upload(&self, local: &str, remote: &str) -> Result<()>;

    /// Close the channel. Must be idempotent: closing an already-closed
    /// transport returns [Ok].
    async fn close(&self) -> Result<()>;
}

/// The remote execution service stood up over a [Transport].
#[async_trait]
pub trait Deployment: Send + Sync {
    /// Open a new, independent session to the remote service.
    async fn dial(&self) -> Result<Arc<dyn RemoteSession>>;

    /// Shut the service down. Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// An active channel through which remote commands are spawned.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Start `cmd` under a shell on the remote machine, with stdout and stderr
    /// piped back. An [Err] here means the session is stale or broken, not
    /// that the command failed; callers recover by refreshing the connection.
    async fn spawn(&self, cmd: &str) -> Result<Box<dyn RemoteProcess>>;

    /// Close the session. Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// A command spawned on a [RemoteSession], not yet waited on.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Block until the process exits and collect its return code and captured
    /// output.
    async fn wait_with_output(self: Box<Self>) -> Result<CommandResult>;
}

/// Opens complete connections: transport, then deployment, then the initial
/// session.
///
/// A failure at any of the three steps surfaces as a single connection error;
/// the pool's retry loop does not care which step broke.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, machine: &MachineId) -> Result<Connection>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A scripted stand-in for the remote stack, shared by the pool, executor,
    //! and fleet tests.

    use super::*;
    use anyhow::bail;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Everything the fakes record and every failure a test can script.
    ///
    /// Counters named `*_failures` are consumed one per call: scripting
    /// `spawn_failures = 2` makes the next two spawns fail and later ones
    /// succeed. Hosts in [dead_hosts] fail every establish, dial, and spawn
    /// until revived.
    ///
    /// [dead_hosts]: FakeState::dead_hosts
    #[derive(Default)]
    pub struct FakeState {
        pub dead_hosts: Mutex<HashSet<String>>,
        pub connect_failures: AtomicUsize,
        pub dial_failures: AtomicUsize,
        pub spawn_failures: AtomicUsize,
        pub uploads_fail: AtomicBool,

        /// Per-host scripted results; unlisted hosts exit 0 with empty output.
        pub results: Mutex<HashMap<String, CommandResult>>,

        /// When nonzero, every process holds its result until this many
        /// commands have been spawned across all hosts.
        pub hold_until_spawned: AtomicUsize,

        pub connects: AtomicUsize,
        pub dials: AtomicUsize,
        pub waits: AtomicUsize,
        /// (host, cmd) per successful spawn, in call order.
        pub spawned: Mutex<Vec<(String, String)>>,
        /// (host, local, remote) per upload attempt.
        pub uploads: Mutex<Vec<(String, String, String)>>,
        /// Close log: entries like `"session:a"`, in call order.
        pub closes: Mutex<Vec<String>>,
    }

    impl FakeState {
        /// Consume one failure token, if any remain.
        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn is_dead(&self, host: &str) -> bool {
            self.dead_hosts.lock().unwrap().contains(host)
        }
    }

    /// Hand one of these to the pool as its [Connector]; keep a clone to
    /// script failures and inspect what happened.
    #[derive(Clone, Default)]
    pub struct FakeRemote {
        pub state: Arc<FakeState>,
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script_result(&self, host: &str, code: i32, stdout: &str, stderr: &str) {
            self.state.results.lock().unwrap().insert(
                host.to_string(),
                CommandResult {
                    code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            );
        }

        pub fn mark_dead(&self, host: &str) {
            self.state
                .dead_hosts
                .lock()
                .unwrap()
                .insert(host.to_string());
        }

        pub fn connects(&self) -> usize {
            self.state.connects.load(Ordering::SeqCst)
        }

        pub fn spawned(&self) -> Vec<(String, String)> {
            self.state.spawned.lock().unwrap().clone()
        }

        pub fn closes(&self) -> Vec<String> {
            self.state.closes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for FakeRemote {
        async fn connect(&self, machine: &MachineId) -> Result<Connection> {
            let state = &self.state;
            state.connects.fetch_add(1, Ordering::SeqCst);
            if state.is_dead(machine.host()) || FakeState::take(&state.connect_failures) {
                bail!("no route to {machine}");
            }
            let host = machine.host().to_string();
            let transport = Arc::new(FakeTransport {
                host: host.clone(),
                state: Arc::clone(state),
            });
            let deployment = Arc::new(FakeDeployment {
                host: host.clone(),
                state: Arc::clone(state),
            });
            let session = Arc::new(FakeSession {
                host,
                state: Arc::clone(state),
            });
            Ok(Connection {
                transport,
                deployment,
                session,
            })
        }
    }

    pub struct FakeTransport {
        host: String,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn upload(&self, local: &str, remote: &str) -> Result<()> {
            self.state.uploads.lock().unwrap().push((
                self.host.clone(),
                local.to_string(),
                remote.to_string(),
            ));
            if self.state.uploads_fail.load(Ordering::SeqCst) {
                bail!("transfer to {} failed", self.host);
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state
                .closes
                .lock()
                .unwrap()
                .push(format!("transport:{}", self.host));
            Ok(())
        }
    }

    pub struct FakeDeployment {
        host: String,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Deployment for FakeDeployment {
        async fn dial(&self) -> Result<Arc<dyn RemoteSession>> {
            self.state.dials.fetch_add(1, Ordering::SeqCst);
            if self.state.is_dead(&self.host) || FakeState::take(&self.state.dial_failures) {
                bail!("deployment on {} is gone", self.host);
            }
            Ok(Arc::new(FakeSession {
                host: self.host.clone(),
                state: Arc::clone(&self.state),
            }))
        }

        async fn close(&self) -> Result<()> {
            self.state
                .closes
                .lock()
                .unwrap()
                .push(format!("deployment:{}", self.host));
            Ok(())
        }
    }

    pub struct FakeSession {
        host: String,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn spawn(&self, cmd: &str) -> Result<Box<dyn RemoteProcess>> {
            if self.state.is_dead(&self.host) || FakeState::take(&self.state.spawn_failures) {
                bail!("session to {} is stale", self.host);
            }
            self.state
                .spawned
                .lock()
                .unwrap()
                .push((self.host.clone(), cmd.to_string()));
            Ok(Box::new(FakeProcess {
                host: self.host.clone(),
                state: Arc::clone(&self.state),
            }))
        }

        async fn close(&self) -> Result<()> {
            self.state
                .closes
                .lock()
                .unwrap()
                .push(format!("session:{}", self.host));
            Ok(())
        }
    }

    pub struct FakeProcess {
        host: String,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl RemoteProcess for FakeProcess {
        async fn wait_with_output(self: Box<Self>) -> Result<CommandResult> {
            self.state.waits.fetch_add(1, Ordering::SeqCst);
            // Lets a test prove that every dispatch was issued before any
            // result was awaited: results stall until all spawns happened.
            let threshold = self.state.hold_until_spawned.load(Ordering::SeqCst);
            while threshold > 0 && self.state.spawned.lock().unwrap().len() < threshold {
                tokio::task::yield_now().await;
            }
            let result = self
                .state
                .results
                .lock()
                .unwrap()
                .get(&self.host)
                .cloned()
                .unwrap_or_else(|| CommandResult {
                    code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            Ok(result)
        }
    }
}
