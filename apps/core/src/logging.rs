use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

const LOG_FILE_PREFIX: &str = "bwflow.log";

static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

/// Relative log dirs resolve against the working directory, which the
/// launcher sets to the plugin folder.
pub fn logs_dir(cfg: &Config) -> PathBuf {
    cfg.log_dir.clone()
}

/// Installs the global subscriber. Output goes to a daily rolling file and
/// never to stdout, which carries the launcher protocol. Keep the returned
/// guard alive for the life of the process or buffered lines are lost.
pub fn init(cfg: &Config) -> Result<WorkerGuard, std::io::Error> {
    let dir = logs_dir(cfg);
    fs::create_dir_all(&dir)?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();

    install_panic_hook();
    Ok(guard)
}

fn install_panic_hook() {
    let _ = PANIC_HOOK_INSTALLED.get_or_init(|| {
        let prior = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            let location = panic_info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown".to_string());
            let payload = panic_info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic payload unavailable".to_string());
            tracing::error!(%location, %payload, "panic");
            prior(panic_info);
        }));
    });
}
