//! Модуль мониторинга файловой системы.
//!
//! Отвечает за:
//! - проверку корня наблюдения перед каждой (пере)инициализацией
//! - подписку только на включённые виды событий
//! - построение [`EventRecord`](crate::payload::EventRecord) и постановку в очередь
//! - перезапуск после ошибки примитива через фиксированную паузу
//!
//! Состояния адаптера: `Uninitialized → Active → Failed → (пауза) → Uninitialized`.

mod events;
mod source;

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::cancel::{CancelToken, WaitOutcome};
use crate::config::WatchConfig;
use crate::error::HookError;
use crate::payload::build_record;
use crate::queue::EventQueue;

pub use events::{translate_event, NameFilter, RawNotification, RenamePairer, Translated, RENAME_PAIR_WINDOW};
pub use source::{ErrorSink, EventSource, NotificationSink, NotifySource, Subscriptions};

const LOG_TARGET: &str = "fswebhook::watcher";

/// Пауза перед повторной инициализацией после ошибки.
pub const RESTART_DELAY: Duration = Duration::from_secs(30);

/// Тик проверки отмены, пока источник активен.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
  Uninitialized,
  Active,
  Failed,
  /// Адаптер вышел по сигналу отмены.
  Stopped,
}

/// Разделяемый снимок состояния адаптера (для логов и тестов).
#[derive(Clone, Debug)]
pub struct AdapterStatus(Arc<Mutex<AdapterState>>);

impl AdapterStatus {
  pub fn get(&self) -> AdapterState {
    *self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set(&self, state: AdapterState) {
    *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }
}

/// Связывает источник событий с очередью.
pub struct WatchAdapter<S: EventSource> {
  source: S,
  config: WatchConfig,
  queue: EventQueue,
  restart_delay: Duration,
  status: AdapterStatus,
}

impl<S: EventSource> WatchAdapter<S> {
  pub fn new(source: S, config: WatchConfig, queue: EventQueue) -> Self {
    Self {
      source,
      config,
      queue,
      restart_delay: RESTART_DELAY,
      status: AdapterStatus(Arc::new(Mutex::new(AdapterState::Uninitialized))),
    }
  }

  /// Изменить паузу перед перезапуском.
  pub fn with_restart_delay(mut self, delay: Duration) -> Self {
    self.restart_delay = delay;
    self
  }

  pub fn status(&self) -> AdapterStatus {
    self.status.clone()
  }

  /// Работать до отмены. Ошибки источника не выходят наружу: адаптер
  /// логирует их и переинициализируется через `restart_delay`.
  pub fn run(&mut self, cancel: &CancelToken) {
    info!(target: LOG_TARGET,
      "Starting watcher: path={}, include_subdirectories={}, filter={}",
      self.config.path.display(), self.config.include_subdirectories, self.config.filter);
    info!(target: LOG_TARGET,
      "Active events: Created={}, Changed={}, Deleted={}, Renamed={}",
      self.config.notify_on_created, self.config.notify_on_changed,
      self.config.notify_on_deleted, self.config.notify_on_renamed);

    while !cancel.is_cancelled() {
      self.status.set(AdapterState::Uninitialized);
      let (fail_tx, fail_rx) = mpsc::channel::<HookError>();

      let failure = match self.activate(fail_tx) {
        Ok(()) => {
          self.status.set(AdapterState::Active);
          info!(target: LOG_TARGET, "Watcher initialized and active");
          match wait_for_failure(&fail_rx, cancel) {
            Some(err) => err,
            None => break,
          }
        }
        Err(err) => err,
      };

      // Старая привязка снимается до следующей попытки, чтобы не было двойных подписок.
      self.source.unbind();
      self.status.set(AdapterState::Failed);
      error!(target: LOG_TARGET, "Watcher error: {failure}");

      if cancel.is_cancelled() {
        break;
      }
      warn!(target: LOG_TARGET,
        "Retrying watcher initialization in {}s", self.restart_delay.as_secs_f64());
      if cancel.wait_timeout(self.restart_delay) == WaitOutcome::Cancelled {
        break;
      }
    }

    self.source.unbind();
    self.status.set(AdapterState::Stopped);
    info!(target: LOG_TARGET, "Watcher stopped");
  }

  fn activate(&mut self, fail_tx: mpsc::Sender<HookError>) -> Result<(), HookError> {
    if !self.config.path.is_dir() {
      return Err(HookError::WatchRootMissing(self.config.path.clone()));
    }

    let on_error: ErrorSink = Arc::new(move |err: HookError| {
      // Адаптер мог уже перейти к следующей привязке.
      let _ = fail_tx.send(err);
    });
    let mut subscriptions = Subscriptions::new(on_error);

    for kind in self.config.enabled_kinds() {
      let queue = self.queue.clone();
      let config = self.config.clone();
      let sink: NotificationSink = Arc::new(move |raw: RawNotification| {
        debug!(target: LOG_TARGET, "Event detected: {} - {}", raw.kind(), raw.path().display());
        let record = build_record(&raw, &config);
        if let Err(err) = queue.enqueue(record) {
          warn!(target: LOG_TARGET,
            "Dropping {} event for {}: {err}", raw.kind(), raw.path().display());
        }
      });
      subscriptions.subscribe(kind, sink);
    }

    self.source.bind(&self.config, subscriptions)
  }
}

/// `Some(err)`: источник сообщил об ошибке. `None`: пришла отмена.
fn wait_for_failure(fail_rx: &mpsc::Receiver<HookError>, cancel: &CancelToken) -> Option<HookError> {
  loop {
    if cancel.is_cancelled() {
      return None;
    }
    match fail_rx.recv_timeout(POLL_INTERVAL) {
      Ok(err) => return Some(err),
      Err(mpsc::RecvTimeoutError::Timeout) => {}
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        return Some(HookError::ConfigurationInvalid(
          "notification source released its subscriptions".to_string(),
        ));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::payload::EventKind;
  use std::path::PathBuf;
  use std::thread;
  use std::time::Instant;

  /// Источник, которым управляет тест.
  #[derive(Clone, Default)]
  struct ManualSource {
    bound: Arc<Mutex<Option<Subscriptions>>>,
    binds: Arc<Mutex<usize>>,
  }

  impl ManualSource {
    fn emit(&self, raw: RawNotification) -> bool {
      let subs = self.bound.lock().unwrap().clone();
      subs.is_some_and(|s| s.dispatch(raw))
    }

    fn fail(&self, err: HookError) {
      let subs = self.bound.lock().unwrap().clone();
      if let Some(s) = subs {
        s.fail(err);
      }
    }

    fn binds(&self) -> usize {
      *self.binds.lock().unwrap()
    }

    fn is_bound(&self) -> bool {
      self.bound.lock().unwrap().is_some()
    }
  }

  impl EventSource for ManualSource {
    fn bind(&mut self, _config: &WatchConfig, subscriptions: Subscriptions) -> Result<(), HookError> {
      *self.bound.lock().unwrap() = Some(subscriptions);
      *self.binds.lock().unwrap() += 1;
      Ok(())
    }

    fn unbind(&mut self) {
      self.bound.lock().unwrap().take();
    }
  }

  fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
      if cond() {
        return true;
      }
      thread::sleep(Duration::from_millis(10));
    }
    false
  }

  fn spawn_adapter(
    source: ManualSource,
    config: WatchConfig,
    queue: EventQueue,
    cancel: &CancelToken,
  ) -> (AdapterStatus, thread::JoinHandle<()>) {
    let mut adapter =
      WatchAdapter::new(source, config, queue).with_restart_delay(Duration::from_millis(50));
    let status = adapter.status();
    let cancel = cancel.clone();
    (status, thread::spawn(move || adapter.run(&cancel)))
  }

  fn temp_config() -> (tempfile::TempDir, WatchConfig) {
    let dir = tempfile::TempDir::new().unwrap();
    let config = WatchConfig {
      path: dir.path().to_path_buf(),
      ..WatchConfig::default()
    };
    (dir, config)
  }

  fn raw(kind: EventKind, dir: &std::path::Path) -> RawNotification {
    let path = dir.join("file.txt");
    match kind {
      EventKind::Created => RawNotification::Created { path, name: None },
      EventKind::Changed => RawNotification::Changed { path, name: None },
      EventKind::Deleted => RawNotification::Deleted { path, name: None },
      EventKind::Renamed => RawNotification::Renamed {
        path,
        name: None,
        old_path: dir.join("old.txt"),
        old_name: None,
      },
    }
  }

  #[test]
  fn test_disabled_kind_never_reaches_queue() {
    let (dir, mut config) = temp_config();
    config.notify_on_changed = false;
    config.notify_on_renamed = false;

    let source = ManualSource::default();
    let queue = EventQueue::new(16);
    let cancel = CancelToken::new();
    let (status, join) = spawn_adapter(source.clone(), config, queue.clone(), &cancel);

    assert!(wait_until(|| status.get() == AdapterState::Active, Duration::from_secs(2)));
    assert!(!source.emit(raw(EventKind::Changed, dir.path())));
    assert!(!source.emit(raw(EventKind::Renamed, dir.path())));
    assert_eq!(queue.len(), 0);

    assert!(source.emit(raw(EventKind::Created, dir.path())));
    assert!(source.emit(raw(EventKind::Deleted, dir.path())));
    assert_eq!(queue.len(), 2);

    cancel.cancel();
    join.join().unwrap();
    assert_eq!(status.get(), AdapterState::Stopped);
    assert!(!source.is_bound());
  }

  #[test]
  fn test_enqueued_record_embeds_config_snapshot() {
    let (dir, config) = temp_config();
    let source = ManualSource::default();
    let queue = EventQueue::new(16);
    let cancel = CancelToken::new();
    let (status, join) = spawn_adapter(source.clone(), config, queue.clone(), &cancel);

    assert!(wait_until(|| status.get() == AdapterState::Active, Duration::from_secs(2)));
    source.emit(raw(EventKind::Renamed, dir.path()));
    cancel.cancel();
    join.join().unwrap();

    queue.close();
    let record = queue.dequeue().unwrap();
    assert_eq!(record.event_type, EventKind::Renamed);
    assert_eq!(record.name, "file.txt");
    assert_eq!(record.old_name.as_deref(), Some("old.txt"));
    assert_eq!(record.watcher_config.path, dir.path().to_string_lossy());
  }

  #[test]
  fn test_source_error_triggers_rebind() {
    let (_dir, config) = temp_config();
    let source = ManualSource::default();
    let cancel = CancelToken::new();
    let (status, join) = spawn_adapter(source.clone(), config, EventQueue::new(4), &cancel);

    assert!(wait_until(|| source.binds() == 1, Duration::from_secs(2)));
    source.fail(HookError::NotificationOverflow);
    assert!(wait_until(|| source.binds() == 2, Duration::from_secs(2)));
    assert!(wait_until(|| status.get() == AdapterState::Active, Duration::from_secs(2)));

    cancel.cancel();
    join.join().unwrap();
  }

  #[test]
  fn test_missing_root_retries_until_it_appears() {
    let dir = tempfile::TempDir::new().unwrap();
    let root: PathBuf = dir.path().join("later");
    let config = WatchConfig {
      path: root.clone(),
      ..WatchConfig::default()
    };
    let source = ManualSource::default();
    let cancel = CancelToken::new();
    let (status, join) = spawn_adapter(source.clone(), config, EventQueue::new(4), &cancel);

    assert!(wait_until(|| status.get() == AdapterState::Failed, Duration::from_secs(2)));
    assert_eq!(source.binds(), 0);

    std::fs::create_dir(&root).unwrap();
    assert!(wait_until(|| source.binds() == 1, Duration::from_secs(2)));

    cancel.cancel();
    join.join().unwrap();
  }

  #[test]
  fn test_cancel_interrupts_restart_delay() {
    let config = WatchConfig {
      path: PathBuf::from("/definitely/not/here/fswebhook"),
      ..WatchConfig::default()
    };
    let mut adapter = WatchAdapter::new(ManualSource::default(), config, EventQueue::new(4));
    let status = adapter.status();
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let join = thread::spawn(move || adapter.run(&remote));

    assert!(wait_until(|| status.get() == AdapterState::Failed, Duration::from_secs(2)));
    let start = Instant::now();
    cancel.cancel();
    join.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(status.get(), AdapterState::Stopped);
  }

  #[test]
  fn test_closed_queue_drops_with_log() {
    let (dir, config) = temp_config();
    let source = ManualSource::default();
    let queue = EventQueue::new(4);
    queue.close();
    let cancel = CancelToken::new();
    let (status, join) = spawn_adapter(source.clone(), config, queue.clone(), &cancel);

    assert!(wait_until(|| status.get() == AdapterState::Active, Duration::from_secs(2)));
    assert!(source.emit(raw(EventKind::Created, dir.path())));
    assert_eq!(queue.len(), 0);
    assert_eq!(status.get(), AdapterState::Active);

    cancel.cancel();
    join.join().unwrap();
  }
}
