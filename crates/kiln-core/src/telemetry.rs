//! Tracing subscriber setup shared by binaries and integration tests.

use tracing_subscriber::EnvFilter;

use crate::options::ServerOptions;

/// Install the global tracing subscriber from the server options.
///
/// Falls back to `info` when the filter string does not parse. Calling this
/// more than once is a no-op; the first subscriber wins.
pub fn init(options: &ServerOptions) {
    init_with(&options.log_level, options.log_json)
}

/// Install the global tracing subscriber from an explicit filter string.
pub fn init_with(filter: &str, json: bool) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // Err means a subscriber is already installed; keep it.
    drop(result);
}
