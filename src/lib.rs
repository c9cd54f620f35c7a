//! fswebhook
//!
//! Наблюдает за деревом директорий и пересылает каждое событие
//! (создание, изменение, удаление, переименование) JSON-запросом на webhook.
//!
//! Поток данных:
//! `watcher` (notify) → `payload` → `queue` (ограниченная FIFO) →
//! `dispatcher` (один фоновый поток) → `delivery` (HTTP с повторами).
//!
//! Бинарник (`src/main.rs`) разбирает CLI, собирает [`Settings`], включает
//! логирование и переводит Ctrl+C в отмену [`CancelToken`]; остальное
//! делает [`service::run`].

pub mod cancel;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod payload;
pub mod queue;
pub mod service;
pub mod watcher;

pub use cancel::CancelToken;
pub use config::{DeliveryConfig, Settings, WatchConfig};
pub use delivery::{DeliveryOutcome, WebhookClient};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::HookError;
pub use payload::{EventKind, EventRecord};
pub use queue::EventQueue;
