use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Error connecting to {node}: {reason}")]
    Connect { node: String, reason: String },

    #[error("Command failed on {node}: {command}\nstderr: {stderr}")]
    RemoteCommand {
        node: String,
        command: String,
        stderr: String,
    },

    #[error("Failed to transfer {path} to {node}: {reason}")]
    Transfer {
        node: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to resolve home directory on {node}: {reason}")]
    HomeDir { node: String, reason: String },

    #[error("Error setting up image on {node}: {source}")]
    Provision {
        node: String,
        #[source]
        source: Box<FleetError>,
    },

    #[error("Failed to set up {node}: {source}")]
    Bootstrap {
        node: String,
        #[source]
        source: Box<FleetError>,
    },

    #[error("{0}")]
    Aborted(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
