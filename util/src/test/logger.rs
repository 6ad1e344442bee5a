use std::borrow::Cow;

use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber for tests.
///
/// `RUST_LOG` overrides the provided `filter`. Safe to call from every test,
/// only the first call installs the subscriber.
pub fn init_logger(test_name: &str, filter: &str) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) => Cow::Owned(env),
        Err(_) => Cow::Borrowed(filter),
    };

    let env_filter = EnvFilter::try_new(filter.as_ref())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init()
        .ok();

    tracing::info!(test_name, "started");
}
