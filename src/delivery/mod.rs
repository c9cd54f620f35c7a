//! Доставка событий на webhook.
//!
//! Отвечает за:
//! - сериализацию записи в JSON
//! - повторы с экспоненциальной задержкой (5s, 10s, 20s, ... при базе 5s)
//! - прерывание ожиданий и запроса в полёте по сигналу отмены
//! - маскирование query string в логах
//!
//! Ошибка доставки никогда не пробрасывается: [`WebhookClient::send`]
//! всегда возвращает [`DeliveryOutcome`].

mod transport;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::cancel::{CancelToken, WaitOutcome};
use crate::config::DeliveryConfig;
use crate::error::HookError;
use crate::payload::EventRecord;

pub use transport::{Transport, TransportError, UreqTransport};

const LOG_TARGET: &str = "fswebhook::delivery";

/// Как часто проверять отмену, пока запрос в полёте.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Маркер, которым заменяется query string.
pub const REDACTION_MARKER: &str = "***";

/// Итог доставки одной записи.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Получен 2xx.
    Delivered { attempts: u32, status: u16 },
    /// Все попытки исчерпаны.
    Failed { attempts: u32 },
    /// Прервано сигналом отмены; повторов больше не будет.
    Cancelled { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts, .. }
            | DeliveryOutcome::Failed { attempts }
            | DeliveryOutcome::Cancelled { attempts } => attempts,
        }
    }

    pub fn is_delivered(self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// Неуспешный итог в виде ошибки для логов; `None` для доставленной записи.
    pub fn error(self) -> Option<HookError> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Failed { attempts } => Some(HookError::DeliveryTransient(format!(
                "gave up after {attempts} attempt(s)"
            ))),
            DeliveryOutcome::Cancelled { .. } => Some(HookError::DeliveryCancelled),
        }
    }
}

/// Потребитель записей из очереди.
pub trait Deliver: Send + Sync {
    fn deliver(&self, record: &EventRecord, cancel: &CancelToken) -> DeliveryOutcome;
}

/// Задержки между попытками: база, затем удвоение.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { next: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        delay
    }
}

/// `https://host/hook?code=SECRET` → `https://host/hook?***`.
/// URL без query string возвращается как есть.
pub fn mask_url(url: &str) -> String {
    match url.find('?') {
        Some(idx) if idx > 0 => format!("{}?{}", &url[..idx], REDACTION_MARKER),
        _ => url.to_string(),
    }
}

/// Исход одной попытки.
enum Attempt {
    Response(u16),
    Failed(TransportError),
    Cancelled,
}

/// Клиент webhook'а с циклом повторов.
pub struct WebhookClient {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    masked_url: String,
}

impl std::fmt::Debug for WebhookClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookClient")
            .field("url", &self.masked_url)
            .field("method", &self.config.method)
            .field("max_retries", &self.config.max_retries)
            .finish_non_exhaustive()
    }
}

impl WebhookClient {
    /// Клиент поверх `ureq`.
    pub fn new(config: DeliveryConfig) -> Self {
        let transport = Arc::new(UreqTransport::new(&config));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: DeliveryConfig, transport: Arc<dyn Transport>) -> Self {
        let masked_url = mask_url(&config.url);
        Self {
            config,
            transport,
            masked_url,
        }
    }

    pub fn masked_url(&self) -> &str {
        &self.masked_url
    }

    /// Доставить запись: до `max_retries + 1` попыток.
    pub fn send(&self, record: &EventRecord, cancel: &CancelToken) -> DeliveryOutcome {
        let body = match record.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(target: LOG_TARGET,
                    "Cannot serialize {} event for {}: {e}", record.event_type, record.name);
                return DeliveryOutcome::Failed { attempts: 0 };
            }
        };

        let total = self.config.total_attempts();
        let mut backoff = Backoff::new(self.config.retry_base_delay);
        let mut attempt = 0;

        while attempt < total {
            if cancel.is_cancelled() {
                return self.cancelled(record, attempt);
            }
            attempt += 1;
            debug!(target: LOG_TARGET,
                "Sending event to webhook (attempt {attempt}/{total}): {} - {}",
                record.event_type, record.name);

            match self.attempt(&body, cancel) {
                Attempt::Response(status) if (200..300).contains(&status) => {
                    info!(target: LOG_TARGET,
                        "Event delivered: {} - {} ({status})", record.event_type, record.name);
                    return DeliveryOutcome::Delivered {
                        attempts: attempt,
                        status,
                    };
                }
                Attempt::Response(status) => {
                    warn!(target: LOG_TARGET,
                        "Webhook responded with non-success status {status} for {} - {} (attempt {attempt})",
                        record.event_type, record.name);
                }
                Attempt::Failed(TransportError::Timeout) => {
                    warn!(target: LOG_TARGET,
                        "Timeout sending {} - {} (attempt {attempt})", record.event_type, record.name);
                }
                Attempt::Failed(e) => {
                    warn!(target: LOG_TARGET,
                        "HTTP error sending {} - {} (attempt {attempt}): {e}",
                        record.event_type, record.name);
                }
                Attempt::Cancelled => return self.cancelled(record, attempt),
            }

            if attempt < total {
                let delay = backoff.next_delay();
                debug!(target: LOG_TARGET, "Waiting {delay:?} before next attempt");
                if cancel.wait_timeout(delay) == WaitOutcome::Cancelled {
                    return self.cancelled(record, attempt);
                }
            }
        }

        error!(target: LOG_TARGET,
            "Delivery failed after {attempt} attempts: {} - {} to webhook {}",
            record.event_type, record.name, self.masked_url);
        DeliveryOutcome::Failed { attempts: attempt }
    }

    fn cancelled(&self, record: &EventRecord, attempts: u32) -> DeliveryOutcome {
        info!(target: LOG_TARGET,
            "Delivery cancelled: {} - {} after {attempts} attempt(s)",
            record.event_type, record.name);
        DeliveryOutcome::Cancelled { attempts }
    }

    /// Запрос выполняется в отдельном потоке, чтобы отмена не ждала таймаута.
    /// Брошенный запрос завершится сам по своему таймауту.
    fn attempt(&self, body: &str, cancel: &CancelToken) -> Attempt {
        let (tx, rx) = mpsc::sync_channel(1);
        let transport = Arc::clone(&self.transport);
        let body = body.to_string();

        let spawned = thread::Builder::new()
            .name("webhook-request".to_string())
            .spawn(move || {
                // Получатель мог уйти по отмене, результат тогда не нужен.
                let _ = tx.send(transport.send(&body));
            });
        if let Err(e) = spawned {
            return Attempt::Failed(TransportError::Connection(format!(
                "cannot spawn request thread: {e}"
            )));
        }

        loop {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(Ok(status)) => return Attempt::Response(status),
                Ok(Err(e)) => return Attempt::Failed(e),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Attempt::Failed(TransportError::Connection(
                        "request thread terminated without a result".to_string(),
                    ));
                }
            }
        }
    }
}

impl Deliver for WebhookClient {
    fn deliver(&self, record: &EventRecord, cancel: &CancelToken) -> DeliveryOutcome {
        self.send(record, cancel)
    }
}
