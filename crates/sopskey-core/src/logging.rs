//! Logger bootstrap shared by the sopskey binaries.
//!
//! Output goes to stderr so stdout stays reserved for the public key.

use env_logger::{Builder, Env, Target};
use std::sync::Once;

pub const LOG_ENV: &str = "SOPSKEY_LOG";

static INIT: Once = Once::new();

/// Install the global logger. `default_filter` applies when `SOPSKEY_LOG` is unset.
/// Calling this more than once is a no-op.
pub fn init(default_filter: &str) {
    install(Builder::from_env(Env::new().filter_or(LOG_ENV, default_filter)));
}

/// Install the global logger with an explicit filter that takes precedence over `SOPSKEY_LOG`.
pub fn init_with_filter(filter: &str) {
    let mut builder = Builder::new();
    builder.parse_filters(filter);
    install(builder);
}

fn install(mut builder: Builder) {
    INIT.call_once(move || {
        let _ = builder
            .format_timestamp(None)
            .format_target(false)
            .target(Target::Stderr)
            .try_init();
    });
}
