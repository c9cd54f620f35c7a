//! Фоновый потребитель очереди событий.
//!
//! Состояния: `Created → Running → Draining → Stopped`, обратного перехода нет.
//! Ошибка или паника при доставке одной записи не останавливает цикл.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::delivery::{Deliver, DeliveryOutcome};
use crate::error::HookError;
use crate::queue::{EventQueue, QUEUE_CAPACITY};

const LOG_TARGET: &str = "fswebhook::dispatcher";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    Running,
    Draining,
    Stopped,
}

type SharedState = Arc<Mutex<DispatcherState>>;

fn set_state(state: &SharedState, next: DispatcherState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Очередь плюс единственный поток, который её вычитывает.
pub struct Dispatcher {
    queue: EventQueue,
    deliver: Arc<dyn Deliver>,
    state: SharedState,
    cancel: Option<CancelToken>,
    join: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("buffered", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(deliver: Arc<dyn Deliver>) -> Self {
        Self::with_capacity(deliver, QUEUE_CAPACITY)
    }

    pub fn with_capacity(deliver: Arc<dyn Deliver>, capacity: usize) -> Self {
        Self {
            queue: EventQueue::new(capacity),
            deliver,
            state: Arc::new(Mutex::new(DispatcherState::Created)),
            cancel: None,
            join: None,
        }
    }

    /// Handle очереди для писателей.
    pub fn queue(&self) -> EventQueue {
        self.queue.clone()
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Запустить поток-потребитель. Повторный запуск игнорируется.
    pub fn start(&mut self, cancel: CancelToken) -> Result<(), HookError> {
        if self.state() != DispatcherState::Created {
            warn!(target: LOG_TARGET, "Dispatcher already started, ignoring start()");
            return Ok(());
        }

        let queue = self.queue.clone();
        let deliver = Arc::clone(&self.deliver);
        let state = Arc::clone(&self.state);
        let loop_cancel = cancel.clone();

        set_state(&self.state, DispatcherState::Running);
        let spawned = thread::Builder::new()
            .name("event-dispatcher".to_string())
            .spawn(move || {
                consume(&queue, deliver.as_ref(), &loop_cancel);
                set_state(&state, DispatcherState::Stopped);
                info!(target: LOG_TARGET, "Dispatcher thread finished");
            });
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                set_state(&self.state, DispatcherState::Created);
                return Err(e.into());
            }
        };

        self.cancel = Some(cancel);
        self.join = Some(join);
        info!(target: LOG_TARGET, "Dispatcher started, queue capacity {}", self.queue.capacity());
        Ok(())
    }

    /// Закрыть очередь, выставить отмену и дождаться, пока поток вычитает
    /// остаток буфера и завершится.
    ///
    /// Рассчитан на один вызов; повторный вызов ничего не делает.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            self.queue.close();
            if self.state() == DispatcherState::Created {
                set_state(&self.state, DispatcherState::Stopped);
            }
            return;
        };

        info!(target: LOG_TARGET,
            "Dispatcher stopping, {} event(s) buffered", self.queue.len());
        set_state(&self.state, DispatcherState::Draining);
        self.queue.close();
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }

        if join.join().is_err() {
            error!(target: LOG_TARGET, "Dispatcher thread panicked");
        }
        set_state(&self.state, DispatcherState::Stopped);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

fn consume(queue: &EventQueue, deliver: &dyn Deliver, cancel: &CancelToken) {
    info!(target: LOG_TARGET, "Processing events...");

    while let Some(record) = queue.dequeue() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| deliver.deliver(&record, cancel)));
        match result {
            Ok(DeliveryOutcome::Delivered { attempts, status }) => {
                debug!(target: LOG_TARGET,
                    "{} - {} delivered with {status} after {attempts} attempt(s)",
                    record.event_type, record.name);
            }
            Ok(outcome @ DeliveryOutcome::Cancelled { .. }) => {
                if let Some(err) = outcome.error() {
                    debug!(target: LOG_TARGET, "{} - {} not delivered: {err}",
                        record.event_type, record.name);
                }
            }
            Ok(outcome) => {
                if let Some(err) = outcome.error() {
                    warn!(target: LOG_TARGET, "{} - {} dropped: {err}",
                        record.event_type, record.name);
                }
            }
            Err(_) => {
                error!(target: LOG_TARGET,
                    "Error processing event: {} - {}", record.event_type, record.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::payload::{build_record, EventRecord};
    use crate::watcher::RawNotification;
    use std::path::PathBuf;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        panic_on: Option<String>,
        delay: Duration,
    }

    impl Deliver for Recorder {
        fn deliver(&self, record: &EventRecord, _cancel: &CancelToken) -> DeliveryOutcome {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.seen.lock().unwrap().push(record.name.clone());
            if self.panic_on.as_deref() == Some(record.name.as_str()) {
                panic!("boom");
            }
            DeliveryOutcome::Delivered {
                attempts: 1,
                status: 200,
            }
        }
    }

    fn record(name: &str) -> EventRecord {
        let raw = RawNotification::Created {
            path: PathBuf::from("/w").join(name),
            name: None,
        };
        build_record(&raw, &WatchConfig::default())
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i:04}.txt")).collect()
    }

    #[test]
    fn test_delivers_in_enqueue_order() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(recorder.clone());
        assert_eq!(dispatcher.state(), DispatcherState::Created);

        dispatcher.start(CancelToken::new()).unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Running);

        let queue = dispatcher.queue();
        for name in names(200) {
            queue.enqueue(record(&name)).unwrap();
        }
        dispatcher.stop();

        assert_eq!(*recorder.seen.lock().unwrap(), names(200));
    }

    #[test]
    fn test_stop_drains_buffer_and_terminates() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(5),
            ..Recorder::default()
        });
        let mut dispatcher = Dispatcher::with_capacity(recorder.clone(), 64);
        let queue = dispatcher.queue();
        for name in names(20) {
            queue.enqueue(record(&name)).unwrap();
        }

        dispatcher.start(CancelToken::new()).unwrap();
        dispatcher.stop();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(queue.is_empty());
        assert_eq!(recorder.seen.lock().unwrap().len(), 20);
        assert!(matches!(
            queue.enqueue(record("late.txt")),
            Err(HookError::QueueClosed)
        ));
    }

    #[test]
    fn test_stop_signals_cancellation() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(recorder);
        let cancel = CancelToken::new();
        dispatcher.start(cancel.clone()).unwrap();
        dispatcher.stop();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_panicking_delivery_does_not_stop_loop() {
        let recorder = Arc::new(Recorder {
            panic_on: Some("0001.txt".to_string()),
            ..Recorder::default()
        });
        let mut dispatcher = Dispatcher::new(recorder.clone());
        dispatcher.start(CancelToken::new()).unwrap();

        let queue = dispatcher.queue();
        for name in names(3) {
            queue.enqueue(record(&name)).unwrap();
        }
        dispatcher.stop();

        assert_eq!(*recorder.seen.lock().unwrap(), names(3));
    }

    #[test]
    fn test_full_queue_blocks_writer_until_consumer_frees_space() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::with_capacity(recorder.clone(), 2);
        let queue = dispatcher.queue();
        queue.enqueue(record("a")).unwrap();
        queue.enqueue(record("b")).unwrap();

        let writer = {
            let queue = queue.clone();
            thread::spawn(move || queue.enqueue(record("c")))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!writer.is_finished());
        assert!(recorder.seen.lock().unwrap().is_empty());

        dispatcher.start(CancelToken::new()).unwrap();
        writer.join().unwrap().unwrap();
        dispatcher.stop();

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_without_start_closes_queue() {
        let mut dispatcher = Dispatcher::new(Arc::new(Recorder::default()));
        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(dispatcher.queue().is_closed());
    }
}
