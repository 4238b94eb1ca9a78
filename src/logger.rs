use std::io::Write;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

// 一行一条："12:34:56.789 Info: ..." 写到 stderr
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(&Local::now().format("%H:%M:%S%.3f").to_string(), record.level(), record.args());
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn label(level: Level) -> &'static str {
    match level {
        Level::Error => "Fail",
        Level::Warn => "Warn",
        Level::Info => "Info",
        Level::Debug => "Debug",
        Level::Trace => "Trace",
    }
}

fn format_line(time: &str, level: Level, args: &std::fmt::Arguments) -> String {
    format!("{} {}: {}\n", time, label(level), args)
}

pub fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Warn;
    }
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// 装上全局 logger；重复调用只调整级别
pub fn init(verbosity: u8, quiet: bool) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level_for(verbosity, quiet));
}
