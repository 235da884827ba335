//! Job execution on remote nodes.
//!
//! - **Pool**: [`WorkerPool`] and [`drain_queue`] run any number of
//!   consumers over one shared [`JobQueue`](crate::scheduler::JobQueue)
//! - **Worker**: [`Worker`] holds one SSH session to its node and turns each
//!   claimed job into exactly one remote command
//!
//! # Execution Flow
//!
//! 1. The worker connects once; a failed connection is reported on the fatal
//!    sink and the worker exits without claiming anything
//! 2. Each claimed token is rendered into the command template
//! 3. With a provisioned image the command is wrapped in `podman run`
//! 4. stdout goes to the success sink on exit status 0, stderr to the
//!    failure sink otherwise

pub mod executor;
pub mod pool;

pub use executor::{spawn_workers, Worker, WorkerContext, WorkerReport};
pub use pool::{drain_queue, WorkerPool};
