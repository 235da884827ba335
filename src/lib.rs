pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod node;
pub mod provision;
pub mod remote;
pub mod router;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use cluster::{Cluster, RunReport};
pub use error::{FleetError, Result};
