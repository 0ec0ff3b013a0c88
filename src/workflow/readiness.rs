//! Web UI readiness polling.

use std::io::ErrorKind;
use std::time::Duration;

use vmlane_virt::{poll_until, PollError, PollPolicy};

use crate::signal::CancelToken;

use super::error::{SetupError, WorkflowError};

/// Why a probe did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// The service is not up yet (connection refused or reset)
    #[error("not ready: {0}")]
    NotReady(String),

    /// Any other failure
    #[error("{0}")]
    Fatal(String),
}

/// One readiness check of a service URL
pub trait ServiceProbe: Send + Sync {
    fn probe(&self, url: &str) -> Result<(), ProbeError>;
}

/// HTTP GET probe
pub struct HttpProbe {
    agent: ureq::Agent,
}

impl HttpProbe {
    /// Probe with per-request `timeout`; TLS certificates are checked only if
    /// `verify_tls` is set.
    pub fn new(verify_tls: bool, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(!verify_tls)
                    .build(),
            )
            .build()
            .new_agent();
        Self { agent }
    }
}

impl ServiceProbe for HttpProbe {
    fn probe(&self, url: &str) -> Result<(), ProbeError> {
        match self.agent.get(url).call() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    Ok(())
                } else {
                    Err(ProbeError::Fatal(format!("HTTP status {}", status)))
                }
            }
            Err(e) => Err(classify(e)),
        }
    }
}

/// Refused and reset connections mean the service is still starting.
fn classify(e: ureq::Error) -> ProbeError {
    match e {
        ureq::Error::Io(ref io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) =>
        {
            ProbeError::NotReady(io.to_string())
        }
        ureq::Error::ConnectionFailed => ProbeError::NotReady(e.to_string()),
        other => ProbeError::Fatal(other.to_string()),
    }
}

/// Poll `url` until it answers.
///
/// `on_failure` runs before a timeout or fatal error is returned.
pub fn wait_for_service(
    probe: &dyn ServiceProbe,
    url: &str,
    policy: &PollPolicy,
    cancel: &CancelToken,
    on_failure: impl FnOnce(),
) -> Result<(), WorkflowError> {
    let result = poll_until(
        policy,
        || cancel.is_cancelled(),
        || {
            probe.probe(url).map(Some).map_err(|e| {
                if let ProbeError::NotReady(ref reason) = e {
                    tracing::debug!(url, %reason, "web UI not accessible yet");
                }
                e
            })
        },
        |e| matches!(e, ProbeError::NotReady(_)),
    );

    match result {
        Ok(()) => {
            tracing::info!(url, "web UI accessible");
            Ok(())
        }
        Err(PollError::Cancelled) => Err(WorkflowError::Cancelled),
        Err(PollError::Exhausted { elapsed, .. }) => {
            on_failure();
            Err(SetupError::ServiceTimeout {
                url: url.to_string(),
                waited: elapsed,
            }
            .into())
        }
        Err(PollError::Fatal(e)) => {
            on_failure();
            Err(SetupError::Service {
                url: url.to_string(),
                reason: e.to_string(),
            }
            .into())
        }
    }
}
