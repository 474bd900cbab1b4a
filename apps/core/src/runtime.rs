use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::info;

use crate::clipboard::SystemClipboard;
use crate::config::{self, Config};
use crate::orchestrator::{OrchestratorOptions, PluginHandler, QueryOrchestrator};
use crate::supervisor::{ProcessSupervisor, SystemProcessControl};
use crate::transport;
use crate::vault_client::VaultClient;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("unknown argument: {0}")]
    UnknownArgument(String),
    #[error("{0} expects a value")]
    MissingValue(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub config_path: Option<PathBuf>,
}

pub fn parse_cli_args(args: &[String]) -> Result<RuntimeOptions, RuntimeError> {
    let mut options = RuntimeOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| RuntimeError::MissingValue(arg.clone()))?;
                options.config_path = Some(PathBuf::from(value));
            }
            other => {
                if let Some(value) = other.strip_prefix("--config=") {
                    options.config_path = Some(PathBuf::from(value));
                } else {
                    return Err(RuntimeError::UnknownArgument(other.to_string()));
                }
            }
        }
    }
    Ok(options)
}

pub fn run_with_options(options: RuntimeOptions) -> anyhow::Result<()> {
    let config_path = options
        .config_path
        .unwrap_or_else(config::default_config_path);
    let config = Config::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _log_guard = crate::logging::init(&config).context("initializing logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    runtime.block_on(serve_stdio(config))
}

async fn serve_stdio(config: Config) -> anyhow::Result<()> {
    info!(
        executable = %config.bw_executable.display(),
        hostname = %config.server_hostname,
        "plugin starting"
    );

    let vault = Arc::new(VaultClient::new(&config).context("building vault client")?);
    let supervisor = ProcessSupervisor::new(
        Arc::new(SystemProcessControl),
        config.bw_executable.clone(),
        config.server_hostname.clone(),
    );
    let orchestrator = Arc::new(QueryOrchestrator::new(
        vault,
        supervisor,
        Arc::new(SystemClipboard),
        OrchestratorOptions::from(&config),
    ));

    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    let handler: Arc<dyn PluginHandler> = orchestrator;
    let served = transport::serve(
        reader,
        tokio::io::stdout(),
        Arc::clone(&handler),
        config.request_timeout(),
    )
    .await;

    handler.shutdown().await;
    served.context("serving launcher protocol")
}
