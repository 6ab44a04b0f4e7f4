use anyhow::{Result, Context};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Client libraries that are chatty at info level
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "mongodb=warn", "hyper=warn", "reqwest=warn"];

/// `RUST_LOG` first, then the role's own level and the quieted clients
fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };

    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(format!("crawl_dispatch={}", level).parse()?);

    if verbose {
        // Request spans from both HTTP surfaces
        filter = filter.add_directive("tower_http=debug".parse()?);
    }
    for target in QUIET_TARGETS {
        filter = filter.add_directive(target.parse()?);
    }

    Ok(filter)
}

/// Initialize the logging system.
///
/// A scheduler or fetcher restarted with the same `log_file` appends to it.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let filter = build_filter(verbose)?;
    let stdout_layer = fmt::layer().with_target(true);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("Failed to open log file: {}", path.display()))?;

            Some(fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(file)))
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        let verbose = build_filter(true).unwrap().to_string();
        assert!(verbose.contains("crawl_dispatch=debug"));
        assert!(verbose.contains("tower_http=debug"));

        let quiet = build_filter(false).unwrap().to_string();
        assert!(quiet.contains("crawl_dispatch=info"));
        assert!(quiet.contains("sqlx=warn"));
    }
}
