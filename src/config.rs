//! Конфигурация процесса.
//!
//! Формат файла совпадает с `appsettings.json`: секции `Watcher`, `Webhook`,
//! `Logging`, ключи в PascalCase. Порядок применения: файл → переменные
//! окружения `FILEWATCHER_Section__Key` → флаги командной строки.
//!
//! Ядро пайплайна принимает только [`WatchConfig`] и [`DeliveryConfig`] и не
//! знает, откуда они были загружены.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::HookError;
use crate::payload::EventKind;
use crate::watcher::NameFilter;

/// Префикс переменных окружения.
pub const ENV_PREFIX: &str = "FILEWATCHER_";

/// Файл конфигурации по умолчанию.
pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";

/// Что и как наблюдать.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct WatchConfig {
    /// Корневая директория наблюдения.
    pub path: PathBuf,
    pub include_subdirectories: bool,
    /// Glob по имени файла. `*.*` и пустая строка пропускают всё.
    pub filter: String,
    pub notify_on_created: bool,
    pub notify_on_changed: bool,
    pub notify_on_deleted: bool,
    pub notify_on_renamed: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            include_subdirectories: true,
            filter: "*.*".to_string(),
            notify_on_created: true,
            notify_on_changed: true,
            notify_on_deleted: true,
            notify_on_renamed: true,
        }
    }
}

impl WatchConfig {
    /// Пересылается ли событие данного вида.
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Created => self.notify_on_created,
            EventKind::Changed => self.notify_on_changed,
            EventKind::Deleted => self.notify_on_deleted,
            EventKind::Renamed => self.notify_on_renamed,
        }
    }

    pub fn enabled_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

/// Параметры доставки, которыми пользуется [`crate::delivery::WebhookClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub url: String,
    /// HTTP-метод в верхнем регистре.
    pub method: String,
    /// Дополнительные заголовки, применяются в порядке ключей.
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl DeliveryConfig {
    /// Общее число попыток: первая плюс `max_retries` повторов.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Секция `Webhook` в том виде, в каком она лежит в файле (секунды, строки).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct WebhookSettings {
    pub url: String,
    pub method: String,
    pub additional_headers: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_delay_seconds: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".to_string(),
            additional_headers: BTreeMap::new(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_base_delay_seconds: 5,
        }
    }
}

impl WebhookSettings {
    /// Проверить секцию и перевести её в [`DeliveryConfig`].
    pub fn delivery_config(&self) -> Result<DeliveryConfig, HookError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(HookError::ConfigurationInvalid(
                "Webhook:Url is empty".to_string(),
            ));
        }
        let parsed = url::Url::parse(url).map_err(|e| {
            HookError::ConfigurationInvalid(format!("Webhook:Url is not a valid URL: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HookError::ConfigurationInvalid(format!(
                "Webhook:Url must use http or https, got {}",
                parsed.scheme()
            )));
        }

        let method = self.method.trim().to_ascii_uppercase();
        if !is_http_token(&method) {
            return Err(HookError::ConfigurationInvalid(format!(
                "Webhook:Method is not a valid HTTP method: {:?}",
                self.method
            )));
        }

        if self.timeout_seconds == 0 {
            return Err(HookError::ConfigurationInvalid(
                "Webhook:TimeoutSeconds must be positive".to_string(),
            ));
        }

        for name in self.additional_headers.keys() {
            if !is_http_token(name) {
                return Err(HookError::ConfigurationInvalid(format!(
                    "Webhook:AdditionalHeaders contains invalid header name {name:?}"
                )));
            }
        }

        Ok(DeliveryConfig {
            url: url.to_string(),
            method,
            headers: self.additional_headers.clone(),
            timeout: Duration::from_secs(self.timeout_seconds),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_secs(self.retry_base_delay_seconds),
        })
    }
}

/// Секция `Logging`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct LoggingSettings {
    /// `trace`, `debug`, `information`, `warning`, `error`, `critical`.
    pub level: String,
    pub log_to_file: bool,
    pub log_file_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "Information".to_string(),
            log_to_file: true,
            log_file_path: PathBuf::from("logs").join("watcher.log"),
        }
    }
}

/// Полная конфигурация процесса.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    pub watcher: WatchConfig,
    pub webhook: WebhookSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Прочитать JSON-файл. Отсутствие файла считается ошибкой старта.
    pub fn load(path: &Path) -> Result<Self, HookError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HookError::ConfigurationInvalid(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, HookError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Применить переменные окружения процесса.
    pub fn apply_env(&mut self) -> Result<(), HookError> {
        self.apply_env_from(std::env::vars())
    }

    /// Применить пары `FILEWATCHER_Section__Key=value`. Ключи без учёта регистра,
    /// неизвестные ключи игнорируются.
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<(), HookError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = strip_prefix_ignore_case(&name, ENV_PREFIX) else {
                continue;
            };
            let key = key.replace("__", ":");
            self.set(&key, &value)?;
        }
        Ok(())
    }

    /// Установить значение по ключу вида `Section:Key`.
    /// Заголовки задаются как `Webhook:AdditionalHeaders:Name`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), HookError> {
        let lower = key.to_ascii_lowercase();
        if let Some(header) = lower.strip_prefix("webhook:additionalheaders:") {
            // Имя заголовка берём из исходного ключа, чтобы сохранить регистр.
            let name = &key[key.len() - header.len()..];
            self.webhook
                .additional_headers
                .insert(name.to_string(), value.to_string());
            return Ok(());
        }

        match lower.as_str() {
            "watcher:path" => self.watcher.path = PathBuf::from(value),
            "watcher:includesubdirectories" => {
                self.watcher.include_subdirectories = parse_bool(key, value)?;
            }
            "watcher:filter" => self.watcher.filter = value.to_string(),
            "watcher:notifyoncreated" => self.watcher.notify_on_created = parse_bool(key, value)?,
            "watcher:notifyonchanged" => self.watcher.notify_on_changed = parse_bool(key, value)?,
            "watcher:notifyondeleted" => self.watcher.notify_on_deleted = parse_bool(key, value)?,
            "watcher:notifyonrenamed" => self.watcher.notify_on_renamed = parse_bool(key, value)?,
            "webhook:url" => self.webhook.url = value.to_string(),
            "webhook:method" => self.webhook.method = value.to_string(),
            "webhook:timeoutseconds" => self.webhook.timeout_seconds = parse_number(key, value)?,
            "webhook:maxretries" => self.webhook.max_retries = parse_number(key, value)?,
            "webhook:retrybasedelayseconds" => {
                self.webhook.retry_base_delay_seconds = parse_number(key, value)?;
            }
            "logging:level" => self.logging.level = value.to_string(),
            "logging:logtofile" => self.logging.log_to_file = parse_bool(key, value)?,
            "logging:logfilepath" => self.logging.log_file_path = PathBuf::from(value),
            _ => log::debug!(target: "fswebhook::config", "Ignoring unknown setting {key}"),
        }
        Ok(())
    }

    /// Проверки старта. Отсутствующий корень наблюдения сюда не входит:
    /// его обрабатывает цикл переинициализации watcher'а.
    pub fn validate(&self) -> Result<DeliveryConfig, HookError> {
        NameFilter::new(&self.watcher.filter)?;
        self.webhook.delivery_config()
    }
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, HookError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(HookError::ConfigurationInvalid(format!(
            "{key}: expected boolean, got {value:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, HookError> {
    value.trim().parse().map_err(|_| {
        HookError::ConfigurationInvalid(format!("{key}: expected number, got {value:?}"))
    })
}

/// RFC 7230 token: непустая строка из tchar.
fn is_http_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}
