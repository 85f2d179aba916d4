//! Process lifecycle for a tunproxy node
//!
//! A configuration is split into tasks (control endpoint, outbounds,
//! routing table, inbounds). [`Instance`] starts them in that order over a
//! shared [`RuntimeContext`] and closes them together.

pub mod context;
pub mod instance;
pub mod task;

pub use context::RuntimeContext;
pub use instance::Instance;
pub use task::{Task, TaskConfig};

use thiserror::Error;
use tunproxy_cert::CertError;
use tunproxy_config::ConfigError;
use tunproxy_control::ControlError;
use tunproxy_forward::ForwardError;
use tunproxy_router::GeoIpError;
use tunproxy_transport::TransportError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Forwarding error: {0}")]
    Forward(#[from] ForwardError),

    #[error("GeoIP error: {0}")]
    GeoIp(#[from] GeoIpError),

    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to prepare runtime: {0}")]
    Context(#[source] TaskError),

    #[error("Instance already started")]
    AlreadyStarted,

    #[error("Instance is closed")]
    Closed,

    #[error("Task {task} failed to start: {source}")]
    Start {
        task: &'static str,
        #[source]
        source: TaskError,
    },

    #[error("Failed to close tasks: {}", describe(.0))]
    Close(Vec<(&'static str, TaskError)>),
}

fn describe(failures: &[(&'static str, TaskError)]) -> String {
    failures
        .iter()
        .map(|(task, err)| format!("{}: {}", task, err))
        .collect::<Vec<_>>()
        .join("; ")
}
