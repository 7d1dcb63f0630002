use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// How much location detail each log line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// One short line per event; suited to per-item progress output.
    #[default]
    Compact,
    /// Target, file and line on every event.
    Verbose,
}

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set, so every harvest binary shares the same formatting rules.
pub fn init_tracing(default_filter: &str, style: LogStyle) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = SubscriberBuilder::default().with_env_filter(filter);
    let installed = match style {
        LogStyle::Compact => builder.with_target(false).compact().try_init(),
        LogStyle::Verbose => builder
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
