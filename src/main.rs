//! FileSystemWatcher → webhook.
//!
//! Коды выхода: 0 при штатной остановке по Ctrl+C, 1 при ошибке старта.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use log::{error, info, warn};

use fswebhook::config::DEFAULT_CONFIG_FILE;
use fswebhook::{logging, service, CancelToken, HookError, Settings};

/// Пересылка событий файловой системы на HTTP webhook.
#[derive(Debug, Parser)]
#[command(name = "fswebhook", version, about)]
struct Cli {
    /// JSON-файл конфигурации.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Корень наблюдения (Watcher:Path).
    #[arg(long)]
    path: Option<String>,

    /// Фильтр имён файлов (Watcher:Filter).
    #[arg(long)]
    filter: Option<String>,

    /// Наблюдать поддиректории (Watcher:IncludeSubdirectories).
    #[arg(long)]
    include_subdirectories: Option<bool>,

    /// URL webhook'а (Webhook:Url).
    #[arg(long)]
    webhook_url: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(path) = &self.path {
            out.push(("Watcher:Path", path.clone()));
        }
        if let Some(filter) = &self.filter {
            out.push(("Watcher:Filter", filter.clone()));
        }
        if let Some(include) = self.include_subdirectories {
            out.push(("Watcher:IncludeSubdirectories", include.to_string()));
        }
        if let Some(url) = &self.webhook_url {
            out.push(("Webhook:Url", url.clone()));
        }
        out
    }
}

fn load_settings(cli: &Cli) -> Result<Settings, HookError> {
    let mut settings = Settings::load(&cli.config)?;
    settings.apply_env()?;
    for (key, value) in cli.overrides() {
        settings.set(key, &value)?;
    }
    Ok(settings)
}

/// Ctrl+C ловится в отдельном потоке на однопоточном runtime'е tokio.
fn spawn_ctrl_c_listener(cancel: CancelToken) -> Result<(), HookError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                warn!("Ctrl+C detected, stopping...");
                cancel.cancel();
            }
            Err(e) => error!("Cannot listen for Ctrl+C: {e}"),
        })?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), HookError> {
    let settings = load_settings(cli)?;
    logging::init_logging(&settings.logging);

    info!("FileSystemWatcher -> Webhook v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::new();
    spawn_ctrl_c_listener(cancel.clone())?;
    info!("Press Ctrl+C to stop");

    service::run(&settings, &cancel)?;

    info!("Application finished");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal error: {e}");
            ExitCode::from(1)
        }
    }
}
