//! Subscriber installation

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Output shape of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable lines
    Development,
    /// One JSON object per event
    Production,
    /// Human-readable lines routed through the test harness writer
    Test,
}

impl Profile {
    /// Filter used when `RUST_LOG` is unset
    pub fn default_directive(self) -> &'static str {
        match self {
            Profile::Development => "snapgraph_core=debug,snapgraph_store=debug",
            Profile::Production => "snapgraph_core=info,snapgraph_store=info",
            Profile::Test => "snapgraph_core=trace,snapgraph_store=trace",
        }
    }

    fn filter(self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

static INIT_ONCE: Once = Once::new();

/// Install the global subscriber for `profile`
///
/// Only the first call in a process does anything. If another subscriber is
/// already installed (for instance by `init_test_capture`) it stays in place.
///
/// ```
/// use snapgraph_core::logging_facility::{init, Profile};
///
/// init(Profile::Development);
/// ```
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| {
        let filter = profile.filter();
        let installed = match profile {
            Profile::Development => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
            Profile::Production => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .try_init(),
            Profile::Test => tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(filter)
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!(
                component = module_path!(),
                ?profile,
                "subscriber already installed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cover_both_crates() {
        for profile in [Profile::Development, Profile::Production, Profile::Test] {
            let directive = profile.default_directive();
            assert!(directive.contains("snapgraph_core="));
            assert!(directive.contains("snapgraph_store="));
        }
        assert!(Profile::Production.default_directive().ends_with("=info"));
    }

    #[test]
    fn test_second_init_is_a_no_op() {
        init(Profile::Test);
        init(Profile::Production);
    }
}
