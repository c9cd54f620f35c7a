//! Ограниченная FIFO-очередь между источником событий и доставкой.
//!
//! Писателей может быть несколько (по одному callback'у на вид события),
//! читатель один. Полная очередь блокирует писателя, а не теряет запись.
//! После [`BoundedQueue::close`] новые записи отклоняются, а читатель
//! дочитывает то, что уже лежит в буфере.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::HookError;
use crate::payload::EventRecord;

/// Ёмкость очереди событий.
pub const QUEUE_CAPACITY: usize = 1000;

/// Очередь записей о событиях.
pub type EventQueue = BoundedQueue<EventRecord>;

#[derive(Debug)]
struct State<T> {
    buf: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

/// Клонируемый handle очереди. Все клоны работают с одним буфером.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Паника в другом потоке не портит VecDeque, поэтому продолжаем работу.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Положить элемент в конец. Блокируется, пока нет места.
    ///
    /// Возвращает [`HookError::QueueClosed`], если очередь закрыта до или во
    /// время ожидания; элемент в этом случае не добавляется.
    pub fn enqueue(&self, item: T) -> Result<(), HookError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(HookError::QueueClosed);
            }
            if state.buf.len() < self.shared.capacity {
                break;
            }
            state = self
                .shared
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.buf.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Взять элемент из головы. Блокируется, пока очередь пуста и открыта.
    /// `None` означает, что очередь закрыта и полностью вычитана.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.buf.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Закрыть очередь для записи и разбудить всех ожидающих.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}
