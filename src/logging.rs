//! Diagnostic output setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding a tracing filter directive
pub const LOG_ENV: &str = "VMLANE_LOG";

/// Default directive for the given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "vmlane=debug,vmlane_virt=debug,vmlane_results=debug,info"
    } else {
        "info"
    }
}

/// Filter from `VMLANE_LOG`, falling back to the verbosity default.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber writing to stderr. Later calls are no-ops.
pub fn init(verbose: bool) {
    let result = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("vmlane=debug"));
    }

    #[test]
    fn test_init_twice() {
        init(false);
        init(true);
    }
}
