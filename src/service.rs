//! Сборка пайплайна на время работы процесса:
//! источник → очередь → dispatcher → webhook.

use std::sync::Arc;

use log::info;

use crate::cancel::CancelToken;
use crate::config::{Settings, WatchConfig};
use crate::delivery::{mask_url, Deliver, WebhookClient};
use crate::dispatcher::Dispatcher;
use crate::error::HookError;
use crate::watcher::{EventSource, NotifySource, WatchAdapter};

const LOG_TARGET: &str = "fswebhook";

/// Проверить конфигурацию и работать до отмены.
///
/// Ошибки конфигурации возвращаются до запуска потоков. Всё, что
/// случается после старта, логируется и не прерывает работу.
pub fn run(settings: &Settings, cancel: &CancelToken) -> Result<(), HookError> {
    let delivery = settings.validate()?;

    info!(target: LOG_TARGET, "Configuration loaded:");
    info!(target: LOG_TARGET, "  - Path: {}", settings.watcher.path.display());
    info!(target: LOG_TARGET, "  - Filter: {}", settings.watcher.filter);
    info!(target: LOG_TARGET, "  - Webhook URL: {}", mask_url(&delivery.url));
    info!(target: LOG_TARGET,
        "  - Method: {}, timeout {:?}, retries {}, base delay {:?}",
        delivery.method, delivery.timeout, delivery.max_retries, delivery.retry_base_delay);

    let client = Arc::new(WebhookClient::new(delivery));
    run_with(settings.watcher.clone(), client, NotifySource::new(), cancel)
}

/// Пайплайн с произвольными доставкой и источником.
pub fn run_with<S: EventSource>(
    watch: WatchConfig,
    deliver: Arc<dyn Deliver>,
    source: S,
    cancel: &CancelToken,
) -> Result<(), HookError> {
    let mut dispatcher = Dispatcher::new(deliver);
    dispatcher.start(cancel.clone())?;

    let mut adapter = WatchAdapter::new(source, watch, dispatcher.queue());
    adapter.run(cancel);

    dispatcher.stop();
    info!(target: LOG_TARGET, "Pipeline stopped");
    Ok(())
}
