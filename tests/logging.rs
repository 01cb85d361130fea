//! Logger installation; kept in its own binary since a logger installs once
//! per process.

use log::LevelFilter;

use das_poller::logging;

#[test]
fn test_das_log_overrides_rust_log() {
    std::env::set_var("DAS_LOG", "debug");
    std::env::set_var("RUST_LOG", "warn");

    logging::init_logging(Some("error"));

    assert_eq!(log::max_level(), LevelFilter::Debug);
    assert_eq!(logging::active_level(), Some(LevelFilter::Debug));
    assert!(log::log_enabled!(target: "das_poller", log::Level::Debug));

    // A second call keeps the first logger.
    std::env::set_var("DAS_LOG", "trace");
    logging::init_logging(None);
    assert_eq!(log::max_level(), LevelFilter::Debug);
}
