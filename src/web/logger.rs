use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Install the global logger: stderr always, plus `log_file` when given.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    log4rs::init_config(build_config(level, log_file)?)?;
    Ok(())
}

fn build_config(level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<Config> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut config = Config::builder().appender(Appender::builder().build("stderr", Box::new(console)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)?;
        config = config.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    Ok(config.build(root.build(level))?)
}
