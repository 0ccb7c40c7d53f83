use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;

/// Initializes logging to a database-scoped folder: `{base}/{stem}_logs`.
/// Creates the folder if missing and writes to a single rolling log file.
pub fn init_for_db_in(base: &Path, stem: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = base.join(format!("{stem}_logs"));
    fs::create_dir_all(&log_dir)?;
    let logfile = log_dir.join("lauradb.log");
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let file_appender = FileAppender::builder().encoder(encoder).build(logfile)?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
