use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

/// Default filter directive when `RUST_LOG` is unset.
fn default_directive(quiet: bool) -> &'static str {
    if quiet { "warn" } else { "info" }
}

/// Install the stderr subscriber once per process. `RUST_LOG` overrides the
/// default level.
pub(crate) fn init_logging(quiet: bool) {
    static INITIALISED: OnceLock<()> = OnceLock::new();

    let _ = INITIALISED.get_or_init(|| {
        let use_ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(quiet)));
        let subscriber = fmt::fmt()
            .with_env_filter(filter)
            .with_ansi(use_ansi)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
