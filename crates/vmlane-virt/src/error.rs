//! Error types for virtualization plumbing.

use std::io;

/// Errors from hypervisor, control channel and container operations.
#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command '{command}' failed with exit code {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("control channel to {host} failed: {reason}")]
    Channel { host: String, reason: String },

    #[error("no free local port to forward {target} after {attempts} attempts")]
    NoFreePort { target: String, attempts: u32 },

    #[error("VM {vm} reported no network address after {attempts} attempts")]
    NoAddress { vm: String, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,
}

pub type VirtResult<T> = Result<T, VirtError>;
