//! Один HTTP-запрос к webhook'у.
//!
//! [`Transport`] отделяет цикл повторов от сетевого клиента, чтобы его
//! можно было подменить в тестах.

use std::error::Error as _;
use std::io;

use crate::config::DeliveryConfig;

/// Ошибка попытки, после которой HTTP-ответа нет.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Connection(String),
}

/// Отправка готового JSON-тела.
///
/// `Ok(status)` возвращается для любого HTTP-ответа, включая 4xx/5xx:
/// решение о повторе принимает [`super::WebhookClient`].
pub trait Transport: Send + Sync {
    fn send(&self, body: &str) -> Result<u16, TransportError>;
}

/// Транспорт на `ureq`. Метод, URL, заголовки и таймаут фиксируются при создании.
#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
}

impl UreqTransport {
    pub fn new(config: &DeliveryConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            method: config.method.clone(),
            url: config.url.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl Transport for UreqTransport {
    fn send(&self, body: &str) -> Result<u16, TransportError> {
        let mut request = self
            .agent
            .request(&self.method, &self.url)
            .set("Content-Type", "application/json; charset=utf-8");
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }

        match request.send_string(body) {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(transport)) => {
                if is_timeout(&transport) {
                    Err(TransportError::Timeout)
                } else {
                    Err(TransportError::Connection(transport.to_string()))
                }
            }
        }
    }
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    transport
        .source()
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|e| matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
}
