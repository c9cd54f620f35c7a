//! Нормализованное логирование.
//!
//! ## Уровни логов
//! - `ERROR`: доставка окончательно не удалась, watcher упал
//! - `WARN`:  неудачная попытка доставки, повтор инициализации
//! - `INFO`:  события жизненного цикла (startup, shutdown, успешная доставка)
//! - `DEBUG`: каждое событие ФС и каждая попытка
//! - `TRACE`: максимально детальный вывод
//!
//! ## Использование
//! ```ignore
//! use fswebhook::logging::init_logging;
//!
//! init_logging(&settings.logging); // вызывается один раз при старте
//! log::info!(target: "fswebhook::watcher", "Starting watcher");
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Once;

use env_logger::Target;
use log::{Level, LevelFilter};

use crate::config::LoggingSettings;

static INIT: Once = Once::new();

/// Уровень из конфигурации. Неизвестное имя → `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "information" | "info" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" | "critical" => LevelFilter::Error,
        "none" | "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Инициализировать логирование (idempotent).
///
/// Переменная окружения `RUST_LOG`, если задана, дополняет уровень из
/// конфигурации. Примеры:
/// - `RUST_LOG=fswebhook=debug`: DEBUG для нашего crate
/// - `RUST_LOG=trace`: максимально детальный вывод
pub fn init_logging(settings: &LoggingSettings) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(parse_level(&settings.level))
            .filter_module("notify", LevelFilter::Warn)
            .filter_module("ureq", LevelFilter::Warn)
            .filter_module("rustls", LevelFilter::Warn);
        if let Ok(spec) = std::env::var("RUST_LOG") {
            builder.parse_filters(&spec);
        }

        builder.format(|buf, record| {
            let level = match record.level() {
                Level::Error => "E",
                Level::Warn => "W",
                Level::Info => "I",
                Level::Debug => "D",
                Level::Trace => "T",
            };

            // Формат: [timestamp] [LEVEL] [target] message
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                level,
                record.target(),
                record.args()
            )
        });

        if settings.log_to_file {
            match open_log_file(&settings.log_file_path) {
                Ok(file) => {
                    builder.target(Target::Pipe(Box::new(TeeWriter { file })));
                }
                // Логгер ещё не поднят, поэтому пишем напрямую в stderr.
                Err(e) => eprintln!(
                    "cannot open log file {}: {e}; logging to stderr only",
                    settings.log_file_path.display()
                ),
            }
        }

        let _ = builder.try_init();
    });
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Пишет каждую строку и в stderr, и в файл.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}
