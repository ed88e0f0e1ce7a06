use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Target used for per-flow access lines
pub const ACCESS_TARGET: &str = "tunsocks::access";

/// Initialize logging system
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn directive(spec: String) -> Result<tracing_subscriber::filter::Directive> {
    spec.parse()
        .map_err(|e| Error::config(format!("Invalid log directive {}: {}", spec, e)))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let mut filter = EnvFilter::from_default_env();
    for krate in ["tunsocks_core", "tunsocks_dns", "tunsocks_sock2proc", "tunsocks"] {
        filter = filter.add_directive(directive(format!("{}={}", krate, tracing_level))?);
    }
    filter = filter.add_directive(directive("tokio=warn".to_string())?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // Someone else may own the global subscriber already; keep theirs.
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

/// Emit the access line for a newly relayed flow
pub fn log_access(process: &str, outbound: &str, network: &str, client: &str, target: &str) {
    tracing::info!(
        target: ACCESS_TARGET,
        "[{}] [{}] [{}] {} --> {}",
        process,
        outbound,
        network,
        client,
        target
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging(LogLevel::Debug).is_ok());
        assert!(init_logging(LogLevel::Info).is_ok());
        log_access("curl", "proxy", "tcp", "10.0.0.2:40000", "example.com:443");
    }

    #[test]
    fn test_silent_installs_nothing() {
        assert!(init_logging_inner(LogLevel::Silent).is_ok());
    }
}
