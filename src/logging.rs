use tracing_subscriber::EnvFilter;

/// Filter used when `RESV_LOG` is unset or unparsable. Stdout carries command
/// output, so diagnostics stay quiet by default.
const DEFAULT_FILTER: &str = "warn";

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber, filtered by `RESV_LOG` (e.g. `resv=debug`).
/// Calling it twice is harmless.
pub fn init() {
    let directives = std::env::var("RESV_LOG").ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_from(directives.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
