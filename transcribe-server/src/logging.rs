//! Tracing subscriber setup
//!
//! The subscriber is installed before the config file is read, so config
//! loading is logged. Its filter starts from `RUST_LOG` or `--log-level` and
//! is swapped for the configured level once the config is known, unless
//! `RUST_LOG` is set.

use anyhow::{Context, Result};
use tracing::debug;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, EnvFilter, Registry};

/// Filter used when neither `RUST_LOG` nor a level is given
pub const DEFAULT_DIRECTIVES: &str = "info";

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Filter directives in effect: `RUST_LOG` over the requested level over the default
pub fn effective_directives(rust_log: Option<&str>, requested: Option<&str>) -> String {
    [rust_log, requested]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVES)
        .to_string()
}

/// Registry with a reloadable filter and a fmt layer writing to `writer`
pub fn build_subscriber<W>(
    directives: &str,
    writer: W,
) -> (impl tracing::Subscriber + Send + Sync + 'static, FilterHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(directives)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer));
    (subscriber, handle)
}

/// Handle for adjusting the global filter after startup
pub struct LogControl {
    handle: FilterHandle,
    /// `RUST_LOG` was set and always wins
    pinned: bool,
}

impl LogControl {
    pub fn new(handle: FilterHandle, pinned: bool) -> Self {
        Self { handle, pinned }
    }

    /// Switch to the configured level unless `RUST_LOG` fixed the filter
    pub fn apply_configured(&self, level: &str) -> Result<()> {
        if self.pinned {
            debug!(level, "RUST_LOG set, ignoring logging.level");
            return Ok(());
        }
        let filter = EnvFilter::try_new(level)
            .with_context(|| format!("invalid logging.level '{}'", level))?;
        self.handle
            .reload(filter)
            .context("failed to replace log filter")?;
        Ok(())
    }
}

/// Install the global subscriber writing to stdout
pub fn init(requested: Option<&str>) -> LogControl {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty());
    let directives = effective_directives(rust_log.as_deref(), requested);
    let (subscriber, handle) = build_subscriber(&directives, std::io::stdout);
    subscriber.init();
    LogControl::new(handle, rust_log.is_some())
}
