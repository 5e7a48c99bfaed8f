pub use backtrace::Backtrace;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    default_level: LogLevel,
    /// Per-module overrides, keyed by the module name (the file stem).
    level_map: HashMap<String, LogLevel>,
    /// stderr unless REPLOG_LOG_FILE points somewhere else.
    log_file: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut default_level = LogInfo;
        let mut level_map = HashMap::new();
        if let Ok(filter) = env::var("REPLOG_LOG") {
            for item in filter.split(',').filter(|s| !s.is_empty()) {
                match item.find('=') {
                    Some(pos) => {
                        if let Some(level) = parse_level(&item[pos + 1..]) {
                            level_map.insert(item[..pos].to_owned(), level);
                        }
                    }
                    None => {
                        if let Some(level) = parse_level(item) {
                            default_level = level;
                        }
                    }
                }
            }
        }

        let log_file: Box<dyn Write + Send> = match env::var("REPLOG_LOG_FILE") {
            Ok(filename) => Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(filename)
                    .unwrap(),
            ),
            Err(_) => Box::new(io::stderr()),
        };

        Mutex::new(LogGlobals {
            default_level,
            level_map,
            log_file,
        })
    };
}

fn parse_level(s: &str) -> Option<LogLevel> {
    match s.trim() {
        "fatal" => Some(LogFatal),
        "error" => Some(LogError),
        "warn" => Some(LogWarn),
        "info" => Some(LogInfo),
        "debug" => Some(LogDebug),
        _ => None,
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Given a filename what is the corresponding module name?
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    // Note: DONT lowercase this. Filenames are case sensitive on Linux.
    path.file_stem().unwrap().to_string_lossy().to_string()
}

pub fn log(level: LogLevel, filename: &str, line: u32, args: fmt::Arguments) {
    let module_name = filename_to_module_name(filename);
    let mut l = LOG_GLOBALS.lock().unwrap();
    let module_level = l
        .level_map
        .get(&module_name)
        .copied()
        .unwrap_or(l.default_level);
    if level != LogFatal && level > module_level {
        return;
    }

    let mut message = Vec::new();
    write!(message, "[{}] [{}] ", log_name(level), module_name).unwrap();
    if level <= LogError {
        write!(message, "{}:{} ", filename, line).unwrap();
    }
    message.write_fmt(args).unwrap();
    message.push(b'\n');
    // A dead sink silently drops the line.
    let _ = l.log_file.write_all(&message);
    let _ = l.log_file.flush();
}

pub fn notifying_abort(bt: Backtrace) -> ! {
    let mut stderr = io::stderr();
    let _ = write!(stderr, "=== Start replog backtrace:\n");
    let _ = write!(stderr, "{:?}", bt);
    let _ = write!(stderr, "=== End replog backtrace\n");
    std::process::abort();
}

#[macro_export]
macro_rules! log {
    ($log_level:expr, $($args:tt)*) => {{
        $crate::log::log($log_level, file!(), line!(), format_args!($($args)*))
    }};
}

#[macro_export]
macro_rules! fatal {
    ($($args:tt)+) => {{
        $crate::log::log(
            $crate::log::LogLevel::LogFatal,
            file!(),
            line!(),
            format_args!($($args)+),
        );
        $crate::log::notifying_abort($crate::log::Backtrace::new())
    }};
}
