use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use error::AppError;
use fileproxy_engine::{
    FileProxy, FileProxyConfig, FileProxyDelegate, HttpEngineConfig, HttpTransferEngine,
    Resolution, TransferConfig, TransferFinished, TransferHandle, TransferOutcome,
};
use tokio::sync::oneshot;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use utils::{format_bytes, parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

/// Logs what the proxy reports.
struct LoggingDelegate;

impl FileProxyDelegate for LoggingDelegate {
    fn transfer_finished(&self, event: &TransferFinished) {
        match &event.outcome {
            TransferOutcome::Installed(path) => info!(url = %event.url, path = ?path, "Cached"),
            TransferOutcome::Failed(e) => warn!(url = %event.url, error = %e, "Not cached"),
            TransferOutcome::Cancelled => info!(url = %event.url, "Cancelled"),
        }
    }

    fn eviction_finished(&self, deleted: &[PathBuf]) {
        for path in deleted {
            info!(path = ?path, "Evicted");
        }
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let config = load_config(&args)?;
    info!(
        identifier = %config.identifier,
        root = ?config.root_dir,
        budget = %format_bytes(config.max_bytes),
        "Proxy configuration"
    );

    let http_config = HttpEngineConfig::default()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_resume(!args.no_resume);
    let http_config = HttpEngineConfig {
        headers: parse_headers(&args.headers),
        ..http_config
    };
    let engine = Arc::new(HttpTransferEngine::new(http_config)?);

    let delegate = Arc::new(LoggingDelegate);
    let (done_tx, done_rx) = oneshot::channel();
    let proxy = FileProxy::builder()
        .with_config(config)
        .with_delegate(&delegate)
        .with_background_completion_handler(move || {
            let _ = done_tx.send(());
        })
        .build(engine)
        .await?;

    let urls = args
        .urls
        .iter()
        .map(|u| Url::parse(u).map_err(|e| AppError::InvalidInput(format!("{u}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;

    let mut failures = 0;
    if args.remove {
        for url in &urls {
            match proxy.remove_item(url).await {
                Ok(()) => println!("removed {url}"),
                Err(e) => {
                    eprintln!("{url}: {e}");
                    failures += 1;
                }
            }
        }
    } else {
        let transfer_config = match &args.expected_size {
            Some(size) => TransferConfig::new().with_expected_bytes_to_receive(parse_size(size)?),
            None => TransferConfig::new(),
        };

        let mut pending: Vec<TransferHandle> = Vec::new();
        for url in &urls {
            match proxy.resolve(url, Some(transfer_config.clone())) {
                Ok(Resolution::Local(local)) => println!("{url} -> {local}"),
                Ok(Resolution::Remote { transfer, .. }) => {
                    info!(url = %url, task = %transfer.task_id(), "Fetching in background");
                    pending.push(transfer);
                }
                Err(e) => {
                    eprintln!("{url}: {e}");
                    failures += 1;
                }
            }
        }

        if args.wait {
            for transfer in pending {
                match transfer.wait().await {
                    TransferOutcome::Installed(path) => {
                        println!("{} -> {}", transfer.url(), path.display())
                    }
                    TransferOutcome::Failed(e) => {
                        eprintln!("{}: {e}", transfer.url());
                        failures += 1;
                    }
                    TransferOutcome::Cancelled => {
                        eprintln!("{}: cancelled", transfer.url());
                        failures += 1;
                    }
                }
            }
        }
    }

    // Running transfers still finish before exiting
    proxy.invalidate(true);
    let _ = done_rx.await;

    let stored = proxy.storage_size().await?;
    info!(stored = %format_bytes(stored), "Done");

    if failures > 0 {
        return Err(AppError::TransfersFailed(failures));
    }
    Ok(())
}

/// The configuration file, if any, overridden by command-line flags.
fn load_config(args: &CliArgs) -> Result<FileProxyConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str::<FileProxyConfig>(&contents)?
        }
        None => FileProxyConfig::default(),
    };

    if let Some(identifier) = &args.identifier {
        config.identifier = identifier.clone();
    }
    if let Some(root_dir) = &args.root_dir {
        config.root_dir = root_dir.clone();
    }
    if let Some(max_bytes) = &args.max_bytes {
        config.max_bytes = parse_size(max_bytes)?;
    }

    config.validate()?;
    Ok(config)
}
