/// log4rs setup for the log facade used throughout the crate
///
use anyhow::Result;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

pub const LOG_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l}):5} {t} - {m}{n}";

/// Configure a console logger at the given level (e.g. "info", "debug").
///
/// Only the first successful call installs a logger; later calls are no-ops.
pub fn init_logging(level: &str) -> Result<()> {
    let level: LevelFilter = level.parse()?;

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;

    if let Err(e) = log4rs::init_config(config) {
        log::debug!("logger already initialized: {}", e);
    }

    Ok(())
}

/// Configure logging from a log4rs yaml file.
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("log config not found: {}", path.display());
    }

    let config = log4rs::config::load_config_file(path, Default::default())?;
    if let Err(e) = log4rs::init_config(config) {
        log::debug!("logger already initialized: {}", e);
    }

    Ok(())
}
