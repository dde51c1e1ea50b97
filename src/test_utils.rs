use std::sync::Once;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary. Safe to call from
/// every test.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // Another harness may already own the global default.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
