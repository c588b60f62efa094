use k8s_envtest::logging::LoggingConfig;
use std::sync::Once;

/// Initializes the logs once for the whole test binary. `RUST_LOG` takes precedence.
pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // a subscriber installed by another harness is fine
        let _ = LoggingConfig::default().with_level("debug").try_init();
    });
}
