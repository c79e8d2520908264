// crates/logging/src/lib.rs

use std::io;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable holding extra filter directives.
pub const LOG_ENV: &str = "SANDFORK_LOG";

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberConfig {
    /// Explicit level cap; when unset, [`LOG_ENV`] and the default apply.
    pub level: Option<LevelFilter>,
    /// Only errors, regardless of other settings.
    pub quiet: bool,
}

impl SubscriberConfig {
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = Some(level);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Initialise the global [`tracing`] subscriber: an [`EnvFilter`] over a
/// stderr fmt layer. Safe to call more than once; later calls are no-ops.
pub fn init(cfg: SubscriberConfig) {
    let default = if cfg.quiet {
        LevelFilter::ERROR
    } else {
        cfg.level.unwrap_or(LevelFilter::WARN)
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let fmt_layer = tracing_fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
