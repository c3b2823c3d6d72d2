//! Tracing subscriber setup for the `collab` binary.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter directive: `RUST_LOG`, then `--verbose`, then the configured
/// level, then `info`.
pub fn filter_directive(rust_log: Option<&str>, verbose: bool, configured: Option<&str>) -> String {
    if let Some(directive) = rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        return directive.to_string();
    }
    if verbose {
        return "debug".to_string();
    }
    configured
        .map(str::trim)
        .filter(|l| !l.is_empty() && EnvFilter::try_new(l).is_ok())
        .unwrap_or("info")
        .to_string()
}

/// Install the global subscriber. Logs go to stderr.
pub fn init(format: LogFormat, verbose: bool, configured: Option<&str>) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(rust_log.as_deref(), verbose, configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins() {
        assert_eq!(filter_directive(Some("collab=trace"), true, Some("warn")), "collab=trace");
    }

    #[test]
    fn test_verbose_over_config() {
        assert_eq!(filter_directive(None, true, Some("warn")), "debug");
        assert_eq!(filter_directive(Some("  "), true, None), "debug");
    }

    #[test]
    fn test_config_then_default() {
        assert_eq!(filter_directive(None, false, Some("warn")), "warn");
        assert_eq!(filter_directive(None, false, None), "info");
        assert_eq!(filter_directive(None, false, Some("[[bad")), "info");
    }
}
