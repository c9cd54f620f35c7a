use std::path::PathBuf;

/// Единый тип ошибок пайплайна.
///
/// Ошибки отдельных событий (доставка, закрытая очередь, сбой watcher'а)
/// не пробрасываются наверх: компонент, который их обнаружил, сводит их
/// к записи в лог. Наружу (в `main`) выходят только ошибки старта.
#[derive(thiserror::Error, Debug)]
pub enum HookError {
  #[error("Invalid configuration: {0}")]
  ConfigurationInvalid(String),

  #[error("Watch root does not exist: {0:?}")]
  WatchRootMissing(PathBuf),

  #[error("Event queue is closed")]
  QueueClosed,

  #[error("Webhook delivery failed: {0}")]
  DeliveryTransient(String),

  #[error("Webhook delivery cancelled")]
  DeliveryCancelled,

  #[error("Notify error: {0}")]
  NotificationPrimitive(#[from] notify::Error),

  #[error("Notification source reported overflow, rescan required")]
  NotificationOverflow,

  #[error("Invalid filter pattern: {0}")]
  InvalidFilter(#[from] glob::PatternError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}
