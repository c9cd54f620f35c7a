//! Сигнал отмены, общий для всех компонентов процесса.
//!
//! Токен передаётся явно в каждую точку входа (dispatcher, delivery,
//! watcher). Ожидания через [`CancelToken::wait_timeout`] прерываются
//! сразу после вызова [`CancelToken::cancel`].

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Результат прерываемого ожидания.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Интервал истёк, отмены не было.
    Elapsed,
    /// Ожидание прервано отменой.
    Cancelled,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Клонируемый токен отмены. Все клоны разделяют одно состояние.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Выставить отмену и разбудить всех ожидающих. Повторный вызов ничего не делает.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*cancelled {
            *cancelled = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ждать `timeout` или отмены, что наступит раньше.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Condvar допускает ложные пробуждения, поэтому считаем остаток до дедлайна.
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }
            cancelled = self
                .inner
                .cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        WaitOutcome::Cancelled
    }
}
