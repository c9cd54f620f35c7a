//! Событие файловой системы и его wire-формат.
//!
//! [`EventRecord`] создаётся один раз в момент прихода уведомления и
//! дальше не меняется. JSON-поля зафиксированы для совместимости с
//! получателями webhook'а (`eventType`, `fullPath`, `oldFullPath`, ...).

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::config::WatchConfig;
use crate::watcher::RawNotification;

/// Вид изменения.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Changed,
        EventKind::Deleted,
        EventKind::Renamed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Changed => "Changed",
            EventKind::Deleted => "Deleted",
            EventKind::Renamed => "Renamed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Снимок настроек наблюдения на момент постановки в очередь.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSnapshot {
    pub path: String,
    pub include_subdirectories: bool,
    pub filter: String,
}

impl From<&WatchConfig> for WatcherSnapshot {
    fn from(config: &WatchConfig) -> Self {
        Self {
            path: config.path.to_string_lossy().into_owned(),
            include_subdirectories: config.include_subdirectories,
            filter: config.filter.clone(),
        }
    }
}

/// Одно изменение файловой системы, готовое к отправке.
///
/// `old_full_path`/`old_name` заполнены тогда и только тогда, когда
/// `event_type == Renamed`; в JSON для остальных видов эти поля отсутствуют.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_type: EventKind,
    pub full_path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_full_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    pub change_time_utc: DateTime<Utc>,
    pub machine_name: String,
    pub watcher_config: WatcherSnapshot,
}

impl EventRecord {
    /// Тело запроса для webhook'а.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Имя машины, вычисляется один раз на процесс.
static MACHINE_NAME: Lazy<String> = Lazy::new(resolve_machine_name);

/// Последний выданный timestamp: время записей не убывает даже при
/// коррекции системных часов назад.
static LAST_TIMESTAMP: Lazy<Mutex<DateTime<Utc>>> =
    Lazy::new(|| Mutex::new(DateTime::<Utc>::MIN_UTC));

fn resolve_machine_name() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn machine_name() -> &'static str {
    &MACHINE_NAME
}

fn next_timestamp() -> DateTime<Utc> {
    let mut last = LAST_TIMESTAMP
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let now = Utc::now().max(*last);
    *last = now;
    now
}

/// Последний компонент пути; для путей без него (`/`) весь путь.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Построить запись из сырого уведомления. Чистая операция без ввода-вывода,
/// кроме чтения часов.
pub fn build_record(raw: &RawNotification, config: &WatchConfig) -> EventRecord {
    build_record_at(raw, config, next_timestamp(), machine_name())
}

/// Вариант [`build_record`] с явными временем и именем хоста.
pub fn build_record_at(
    raw: &RawNotification,
    config: &WatchConfig,
    at: DateTime<Utc>,
    host: &str,
) -> EventRecord {
    let (old_full_path, old_name) = match raw {
        RawNotification::Renamed {
            old_path, old_name, ..
        } => (
            Some(path_string(old_path)),
            Some(old_name.clone().unwrap_or_else(|| file_name_of(old_path))),
        ),
        _ => (None, None),
    };

    EventRecord {
        event_type: raw.kind(),
        full_path: path_string(raw.path()),
        name: raw
            .name()
            .map_or_else(|| file_name_of(raw.path()), str::to_string),
        old_full_path,
        old_name,
        change_time_utc: at,
        machine_name: host.to_string(),
        watcher_config: WatcherSnapshot::from(config),
    }
}
