//! OBD-II Data Logger - Main Entry Point

use obd_logger::config::{LoggerConfig, DEFAULT_CONFIG_PATH};
use obd_logger::{init_logging, install_metrics, output, run_session};
use obd_protocol::list_ports;
use std::io::Write;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--list-ports") {
        for port in list_ports() {
            println!("{}", output::port_line(&port));
        }
        return Ok(());
    }

    let path = arg.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = LoggerConfig::load(&path)?;
    init_logging(config.log_json);

    info!("=== OBD-II Logger v{} ===", env!("CARGO_PKG_VERSION"));
    info!(port = %config.port, "Configuration loaded from {}", path);

    if let Some(addr) = &config.metrics_addr {
        install_metrics(addr)?;
    }

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler: run until the configured duration ends
            std::future::pending::<()>().await;
        }
    };
    let session = run_session(&config, shutdown).await?;

    match &config.output_path {
        Some(path) => {
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            output::write_session(&session, config.output, &mut file)?;
            file.flush()?;
            info!("Session written to {}", path);
        }
        None => output::write_session(&session, config.output, &mut std::io::stdout().lock())?,
    }

    Ok(())
}
