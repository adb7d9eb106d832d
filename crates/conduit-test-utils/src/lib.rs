//! Testing utilities for Conduit.
//!
//! A scriptable in-memory fetcher and a tracing setup for tests.

pub mod fetcher;

pub use fetcher::MockFetcher;

/// Initializes test tracing, writing through the test harness
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("conduit_orchestrator=debug,conduit_resilience=debug,info")
    });
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
