//! Tracing setup for the proxy.
//!
//! The configured level applies to the cache crates and the HTTP trace layer.
//! Everything else (hyper, reqwest, redis) stays at `warn` unless `RUST_LOG`
//! says otherwise. The filter sits behind a reload layer so the level from the
//! config file can replace the startup default.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> = OnceLock::new();

/// Targets that follow the configured level.
const CACHE_TARGETS: [&str; 3] = ["tiercache_core", "tiercache_server", "tower_http"];

/// Filter directives for `level`: dependencies at `warn`, cache targets at `level`.
///
/// An unrecognised level falls back to `info`.
pub fn default_filter(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => l.to_string(),
        _ => "info".to_string(),
    };
    let mut directives = vec!["warn".to_string()];
    directives.extend(CACHE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    // RUST_LOG wins over the cache defaults
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter(level)));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Apply the configured level once configuration is loaded. Skipped when `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let directives = default_filter(level);
        if handle.modify(|f| *f = EnvFilter::new(&directives)).is_ok() {
            tracing::debug!(filter = %directives, "log filter updated from configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_cache_targets() {
        assert_eq!(
            default_filter("debug"),
            "warn,tiercache_core=debug,tiercache_server=debug,tower_http=debug"
        );
    }

    #[test]
    fn test_default_filter_normalizes_level() {
        assert_eq!(default_filter(" INFO "), default_filter("info"));
        assert_eq!(default_filter("verbose"), default_filter("info"));
    }

    #[test]
    fn test_default_filter_parses() {
        for level in ["trace", "error", "off"] {
            assert!(EnvFilter::try_new(default_filter(level)).is_ok());
        }
    }
}
