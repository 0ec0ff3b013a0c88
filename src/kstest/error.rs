use thiserror::Error;
use vmlane_virt::VirtError;

/// Kickstart batch failures
#[derive(Debug, Error)]
pub enum KickstartError {
    #[error("failed to clone {repo}: {source}")]
    Clone {
        repo: String,
        #[source]
        source: VirtError,
    },

    #[error("failed to fetch boot image {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("unsupported boot image URL {0}")]
    UnsupportedUrl(String),

    #[error("batch runner command is empty")]
    EmptyCommand,

    #[error("failed to run batch runner: {0}")]
    Runner(#[from] VirtError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
