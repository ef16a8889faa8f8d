use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{ProxyError, Result};

/// 未通过命令行或配置文件指定级别时读取的环境变量
pub const LEVEL_ENV: &str = "LOGGER_LEVEL";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }

    /// 依次取配置文件、命令行、环境变量 `LOGGER_LEVEL`，都没有时为 info
    ///
    /// 与其他配置项一致，配置文件中的值覆盖命令行。无法识别的值跳过，继续看下一个来源。
    pub fn resolve(file: Option<&str>, cli: Option<&str>) -> Self {
        let env = std::env::var(LEVEL_ENV).ok();
        let level = [file, cli, env.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|v| v.parse().ok())
            .unwrap_or(LogLevel::Info);
        level
    }
}

impl FromStr for LogLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ProxyError::Config(format!("无效的日志级别: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    Both(PathBuf),
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对标准输出生效，文件中不写颜色
    pub use_color: bool,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }

    pub fn with_both<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.as_ref().to_path_buf());
        self
    }
}

struct ProxyLogger {
    config: LogConfig,
    file: Option<Mutex<File>>,
}

impl ProxyLogger {
    fn new(config: LogConfig) -> Result<Self> {
        let file = match &config.output {
            LogOutput::File(path) | LogOutput::Both(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            LogOutput::Stdout => None,
        };
        Ok(Self { config, file })
    }

    fn format(&self, record: &Record, color: bool) -> String {
        let timestamp = if self.config.show_timestamp {
            format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        let level = match (color, record.level()) {
            (true, log::Level::Error) => "\x1b[31mERROR\x1b[0m",
            (true, log::Level::Warn) => "\x1b[33mWARN \x1b[0m",
            (true, log::Level::Info) => "\x1b[32mINFO \x1b[0m",
            (true, log::Level::Debug) => "\x1b[36mDEBUG\x1b[0m",
            (true, log::Level::Trace) => "\x1b[35mTRACE\x1b[0m",
            (false, log::Level::Error) => "ERROR",
            (false, log::Level::Warn) => "WARN ",
            (false, log::Level::Info) => "INFO ",
            (false, log::Level::Debug) => "DEBUG",
            (false, log::Level::Trace) => "TRACE",
        };

        let module = match record.module_path() {
            Some(path) if self.config.show_module => format!("[{}] ", path),
            _ => String::new(),
        };

        format!("{}{} {}{}", timestamp, level, module, record.args())
    }
}

impl Log for ProxyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level.to_level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if matches!(self.config.output, LogOutput::Stdout | LogOutput::Both(_)) {
            println!("{}", self.format(record, self.config.use_color));
        }

        if let Some(file) = &self.file {
            let line = self.format(record, false);
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writeln!(file, "{}", line);
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(|e| e.into_inner()).flush();
        }
    }
}

/// 安装全局日志器，进程内只能调用一次
pub fn init_logger(config: LogConfig) -> Result<()> {
    let level = config.level.to_level_filter();
    let logger = ProxyLogger::new(config)?;
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| ProxyError::Config(format!("设置日志器失败: {}", e)))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_resolve_prefers_file_then_cli() {
        assert_eq!(LogLevel::resolve(Some("error"), Some("debug")), LogLevel::Error);
        assert_eq!(LogLevel::resolve(None, Some("debug")), LogLevel::Debug);
        assert_eq!(LogLevel::resolve(Some("bogus"), Some("trace")), LogLevel::Trace);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new(LogLevel::Debug)
            .with_timestamp(false)
            .with_module(false)
            .with_color(false)
            .with_both("logs/hpts.log");

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.show_timestamp);
        assert!(!config.show_module);
        assert!(!config.use_color);
        assert_eq!(config.output, LogOutput::Both(PathBuf::from("logs/hpts.log")));
    }

    #[test]
    fn test_file_output_without_color() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hpts.log");
        let logger = ProxyLogger::new(
            LogConfig::new(LogLevel::Info)
                .with_timestamp(false)
                .with_file(&path),
        )
        .unwrap();

        logger.log(
            &Record::builder()
                .level(log::Level::Info)
                .module_path(Some("hpts::server"))
                .args(format_args!("proxy-connect: example.com:443"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(log::Level::Debug)
                .args(format_args!("hidden"))
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "INFO  [hpts::server] proxy-connect: example.com:443\n");
    }
}
