use std::path::PathBuf;

use localfs_process::{AgentId, InstanceId, ProcessKey};

use crate::control::ControlError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0} is not tracked by this driver")]
    NotTracked(ProcessKey),
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("{0} has no assigned port")]
    NoPort(ProcessKey),
    #[error("cannot find {rel} in any of {} module paths", searched.len())]
    LauncherNotFound { rel: String, searched: Vec<PathBuf> },
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DriverError {
    /// The driver cannot do its job at all; the host process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::LauncherNotFound { .. })
    }

    /// Downstream HTTP status, when the failure came from a control endpoint.
    pub fn status(&self) -> Option<u16> {
        match self {
            DriverError::Control(e) => e.status(),
            _ => None,
        }
    }
}
