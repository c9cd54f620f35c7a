//! Источник событий файловой системы.
//!
//! [`EventSource`]: абстракция над OS-примитивом уведомлений. Адаптер
//! регистрирует по одному sink'у на каждый включённый вид события и явно
//! управляет жизненным циклом привязки (`bind`/`unbind`).

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::events::{NameFilter, RawNotification, RenamePairer, Translated};
use crate::config::WatchConfig;
use crate::error::HookError;
use crate::payload::EventKind;

/// Получатель уведомлений одного вида.
pub type NotificationSink = Arc<dyn Fn(RawNotification) + Send + Sync>;

/// Получатель ошибок источника.
pub type ErrorSink = Arc<dyn Fn(HookError) + Send + Sync>;

/// Набор подписок, передаваемый источнику при привязке.
#[derive(Clone)]
pub struct Subscriptions {
  sinks: HashMap<EventKind, NotificationSink>,
  on_error: ErrorSink,
}

impl fmt::Debug for Subscriptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscriptions")
      .field("kinds", &self.sinks.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}

impl Subscriptions {
  pub fn new(on_error: ErrorSink) -> Self {
    Self {
      sinks: HashMap::new(),
      on_error,
    }
  }

  /// Зарегистрировать sink для вида события. Повторная регистрация заменяет прежний.
  pub fn subscribe(&mut self, kind: EventKind, sink: NotificationSink) {
    self.sinks.insert(kind, sink);
  }

  pub fn is_subscribed(&self, kind: EventKind) -> bool {
    self.sinks.contains_key(&kind)
  }

  /// Передать уведомление подписчику его вида. Без подписчика возвращает `false`.
  pub fn dispatch(&self, raw: RawNotification) -> bool {
    match self.sinks.get(&raw.kind()) {
      Some(sink) => {
        sink(raw);
        true
      }
      None => false,
    }
  }

  /// Сообщить об ошибке примитива.
  pub fn fail(&self, err: HookError) {
    (self.on_error)(err);
  }
}

/// Примитив уведомлений файловой системы.
pub trait EventSource: Send {
  /// Привязаться к `config.path`. После `Ok` уведомления идут в `subscriptions`
  /// до вызова [`EventSource::unbind`]. Предыдущая привязка снимается.
  fn bind(&mut self, config: &WatchConfig, subscriptions: Subscriptions) -> Result<(), HookError>;

  /// Полностью снять привязку. Повторный вызов безопасен.
  fn unbind(&mut self);
}

/// Тик потока-насоса: как часто проверяются остановка и просроченные
/// половины переименований.
const PUMP_TICK: Duration = Duration::from_millis(100);

type NotifyResult = notify::Result<notify::Event>;

/// Живая привязка: watcher `notify` и поток, который разбирает его события.
struct Binding {
  watcher: RecommendedWatcher,
  stop_tx: mpsc::Sender<()>,
  join: thread::JoinHandle<()>,
}

/// Источник на `notify::RecommendedWatcher`.
///
/// Callback `notify` только пересылает события в канал. Разбор, склейка
/// переименований, фильтр и вызов подписчиков идут в отдельном потоке.
#[derive(Default)]
pub struct NotifySource {
  binding: Option<Binding>,
}

impl fmt::Debug for NotifySource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NotifySource")
      .field("bound", &self.binding.is_some())
      .finish()
  }
}

impl NotifySource {
  pub fn new() -> Self {
    Self::default()
  }
}

impl EventSource for NotifySource {
  fn bind(&mut self, config: &WatchConfig, subscriptions: Subscriptions) -> Result<(), HookError> {
    self.unbind();

    let filter = NameFilter::new(&config.filter)?;
    let (event_tx, event_rx) = mpsc::channel::<NotifyResult>();
    let mut watcher = notify::recommended_watcher(move |res: NotifyResult| {
      // Получатель уходит только вместе с привязкой.
      let _ = event_tx.send(res);
    })?;

    let mode = if config.include_subdirectories {
      RecursiveMode::Recursive
    } else {
      RecursiveMode::NonRecursive
    };
    watcher.watch(&config.path, mode)?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
      .name("notify-pump".to_string())
      .spawn(move || pump(&event_rx, &stop_rx, &subscriptions, &filter))?;

    self.binding = Some(Binding {
      watcher,
      stop_tx,
      join,
    });
    Ok(())
  }

  fn unbind(&mut self) {
    let Some(binding) = self.binding.take() else {
      return;
    };
    // Drop watcher'а останавливает поток notify и снимает все watch'и.
    drop(binding.watcher);
    let _ = binding.stop_tx.send(());
    if binding.join.join().is_err() {
      warn!(target: "fswebhook::watcher", "notify pump thread panicked");
    }
    debug!(target: "fswebhook::watcher", "notify watcher released");
  }
}

impl Drop for NotifySource {
  fn drop(&mut self) {
    self.unbind();
  }
}

fn pump(
  events: &mpsc::Receiver<NotifyResult>,
  stop: &mpsc::Receiver<()>,
  subscriptions: &Subscriptions,
  filter: &NameFilter,
) {
  let mut pairer = RenamePairer::new();
  let forward = |list: Vec<RawNotification>| {
    for raw in list {
      if !filter.matches(&raw) {
        continue;
      }
      if !subscriptions.dispatch(raw) {
        debug!(target: "fswebhook::watcher", "Event kind not subscribed, skipping");
      }
    }
  };

  loop {
    if !matches!(stop.try_recv(), Err(mpsc::TryRecvError::Empty)) {
      break;
    }

    match events.recv_timeout(PUMP_TICK) {
      Ok(Ok(event)) => {
        let now = Instant::now();
        forward(pairer.expire(now));
        match pairer.accept(&event, now) {
          Translated::Overflow => subscriptions.fail(HookError::NotificationOverflow),
          Translated::Notifications(list) => forward(list),
        }
      }
      Ok(Err(err)) => subscriptions.fail(HookError::NotificationPrimitive(err)),
      Err(mpsc::RecvTimeoutError::Timeout) => forward(pairer.expire(Instant::now())),
      Err(mpsc::RecvTimeoutError::Disconnected) => break,
    }
  }

  forward(pairer.drain());
}
