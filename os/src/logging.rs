use core::fmt;
use core::option_env;
use log::{self, Level, LevelFilter, Log, Metadata, Record};
use crate::console::print;

// print with color!
// e.g.: \x1b[31mhello world\x1b[0m
// ERROR: red, 31
// WARN: yellow, 93
// INFO: blue, 34
// DEBUG: green, 32
// TRACE: grey, 90
// level: ERROR > WARN > INFO > DEBUG > TRACE
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    // 已经装过 logger 的话什么都不做, 测试里会被反复调用
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    log::set_max_level(level_filter(option_env!("LOG")));
}

fn level_filter(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        Some("OFF") => LevelFilter::Off,
        _ => LevelFilter::Info, // default is INFO
    }
}

/// Add escape sequence to print with color in Linux console
macro_rules! with_color {
    ($args: ident, $color_code: ident) => {{
        format_args!("\u{1B}[{}m{}\u{1B}[0m", $color_code as u8, $args)
    }};
}

fn print_in_color(args: fmt::Arguments, color_code: u8) {
    print(with_color!(args, color_code));
}

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        print_in_color(
            format_args!(
                "[{}][{}] {}\n",
                record.level(),
                0, // hart id
                record.args()
            ),
            level_to_color_code(record.level()),
        );
    }
    fn flush(&self) {}
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // Yellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // Grey
    }
}
