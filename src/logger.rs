use crate::sanitize::sanitize_for_display;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the stderr subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Logging context handed to every migration component.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    verbose: bool,
    step: Option<String>,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            step: None,
        }
    }

    pub fn for_step(&self, step: &str) -> Self {
        Self {
            verbose: self.verbose,
            step: Some(step.to_string()),
        }
    }

    fn step(&self) -> &str {
        self.step.as_deref().unwrap_or("-")
    }

    pub fn log(&self, message: &str) {
        info!(step = self.step(), "{}", sanitize_for_display(message));
    }

    /// Progress detail, shown only with `--verbose`.
    pub fn vlog(&self, message: &str) {
        if self.verbose {
            info!(step = self.step(), "{}", sanitize_for_display(message));
        } else {
            debug!(step = self.step(), "{}", sanitize_for_display(message));
        }
    }

    pub fn warn(&self, message: &str) {
        warn!(step = self.step(), "{}", sanitize_for_display(message));
    }

    pub fn error(&self, message: &str) {
        error!(step = self.step(), "{}", sanitize_for_display(message));
    }
}
