use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// init log4rs
/// level value: ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"], ignore ascii case
pub fn init_log(console: bool, level: &str) -> anyhow::Result<()> {
    let default_level =
        LevelFilter::from_str(level).map_err(|_e| anyhow!("can not parse log level {}", level))?;

    let encoder =
        PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} {level} [{thread}] {target} - {m}{n}");

    let (name, appender) = if console {
        ("console", create_console_appender(encoder))
    } else {
        ("rolling_file", create_rolling_file_appender(encoder)?)
    };

    let config = Config::builder()
        .appender(Appender::builder().build(name, appender))
        .build(Root::builder().appender(name).build(default_level))
        .map_err(|e| anyhow!("build log config error {}", e))?;

    log4rs::init_config(config).map_err(|e| anyhow!("init log config error {}", e))?;
    Ok(())
}

fn create_console_appender(encoder: PatternEncoder) -> Box<dyn Append> {
    let stdout = ConsoleAppender::builder()
        .target(Target::Stdout)
        .encoder(Box::new(encoder))
        .build();
    Box::new(stdout)
}

fn create_rolling_file_appender(encoder: PatternEncoder) -> anyhow::Result<Box<dyn Append>> {
    let cur_dir = std::env::current_dir().map_err(|e| anyhow!("get current dir error {}", e))?;
    let path: PathBuf = cur_dir.join("scheduler.log");
    let roll_path = path.to_str().unwrap_or("scheduler.log").to_string() + ".{}";

    let trigger = SizeTrigger::new(50 * 1024 * 1024);

    let roll = FixedWindowRoller::builder()
        .base(1)
        .build(roll_path.as_str(), 20)
        .map_err(|e| anyhow!("log roll error {}", e))?;

    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roll));

    let rolling_file = RollingFileAppender::builder()
        .encoder(Box::new(encoder))
        .append(true)
        .build(path, Box::new(policy))
        .map_err(|e| anyhow!("build rolling appender error {}", e))?;
    Ok(Box::new(rolling_file))
}
