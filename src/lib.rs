//! Remote-execution substrate for a distributed test fleet.
//!
//! `fleetrun` keeps one authenticated connection to every machine in a fleet
//! of test machines, grouped by role, and gives the test harness a uniform way
//! to run shell commands on one machine or across the whole fleet,
//! synchronously or asynchronously, with automatic reconnection when a
//! connection goes stale.
//!
//! # Program flow
//!
//! 1. The harness loads a [FleetTopology] from its fleet configuration file.
//!
//! 2. It builds a [Fleet] around the topology and calls [Fleet::initialize],
//!    which connects to every machine concurrently and populates the
//!    [ConnectionPool].
//!
//! 3. Test cases call [Fleet::run], [Fleet::run_async], and
//!    [Fleet::run_servers] to execute commands. A broken connection is
//!    refreshed behind the scenes with bounded retries; an unrecoverable one
//!    surfaces as a sentinel result rather than an error, so a single dead
//!    machine never aborts the rest of the fleet.
//!
//! 4. At the end of the run, [Fleet::shutdown] tears every connection down.

pub mod executor;
pub mod fleet;
pub mod logging;
pub mod pool;
pub mod remote;
pub mod topology;

#[doc(inline)]
pub use executor::{AsyncHandle, Executor};
#[doc(inline)]
pub use fleet::Fleet;
#[doc(inline)]
pub use pool::{Connection, ConnectionPool, RetryPolicy};
#[doc(inline)]
pub use remote::{CommandResult, MachineId};
#[doc(inline)]
pub use topology::FleetTopology;
