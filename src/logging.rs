use std::sync::Once;

use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_ONCE: Once = Once::new();
static ACTIVE_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

const LOG_ENV: &str = "DAS_LOG";
const FALLBACK_ENV: &str = "RUST_LOG";

fn env_filters() -> Option<String> {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    read(LOG_ENV).or_else(|| read(FALLBACK_ENV))
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a level name, returning `None` for anything `log` does not recognise.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Filter directives to install: `env` (the first of `DAS_LOG`, `RUST_LOG`
/// that is set) wins over the configured level, which wins over `info`.
fn filter_directives(env: Option<String>, configured: Option<&str>) -> String {
    env.unwrap_or_else(|| {
        level_to_str(parse_level(configured).unwrap_or(LevelFilter::Info)).to_string()
    })
}

/// Resolve the level to use: `DAS_LOG`, then `RUST_LOG`, then the configured
/// fallback, then `info`. Per-module directives resolve to `info`.
pub fn resolve_level(configured: Option<&str>) -> LevelFilter {
    let directives = filter_directives(env_filters(), configured);
    parse_level(Some(&directives)).unwrap_or(LevelFilter::Info)
}

/// Initialize the stderr logger. Safe to call more than once; only the first
/// call installs a logger.
///
/// The builder only sees the directives resolved here; it does not read the
/// environment on its own.
pub fn init_logging(configured: Option<&str>) {
    LOG_ONCE.call_once(|| {
        let directives = filter_directives(env_filters(), configured);
        let installed = env_logger::Builder::new()
            .parse_filters(&directives)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
        if installed.is_ok() {
            let _ = ACTIVE_LEVEL.set(log::max_level());
        }
    });
}

/// Most verbose level enabled by the first successful `init_logging` call.
pub fn active_level() -> Option<LevelFilter> {
    ACTIVE_LEVEL.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_known_names() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("WARN")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("chatty")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn environment_directives_win_over_configured_level() {
        assert_eq!(
            filter_directives(Some("debug".into()), Some("warn")),
            "debug"
        );
        assert_eq!(
            filter_directives(Some("das_poller=trace".into()), None),
            "das_poller=trace"
        );
        assert_eq!(filter_directives(None, Some("warn")), "warn");
        assert_eq!(filter_directives(None, Some("chatty")), "info");
        assert_eq!(filter_directives(None, None), "info");
    }

    #[test]
    fn level_names_round_trip() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
    }
}
