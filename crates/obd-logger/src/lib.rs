//! OBD-II Data Logger
//!
//! Connects to an adapter (or the simulated vehicle), polls the configured
//! parameters, reports trouble codes and writes the recorded session out.

pub mod config;
pub mod output;

use metrics_exporter_prometheus::PrometheusBuilder;
use obd_protocol::{MockTransport, SerialTransport};
use obd_scheduler::start_session;
use session_recorder::Session;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{LoggerConfig, MOCK_PORT};

/// Install the global tracing subscriber. Logs go to stderr so stdout
/// carries only session data. `RUST_LOG` overrides the default `info`.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve Prometheus metrics on `addr`
pub fn install_metrics(addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run one logging session until `shutdown` completes, the configured
/// duration elapses or the adapter disconnects.
pub async fn run_session(
    config: &LoggerConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<Session> {
    let handle = if config.port == MOCK_PORT {
        info!("Using simulated vehicle");
        start_session(MockTransport::demo_vehicle(), &config.vehicle, config.engine.clone()).await?
    } else {
        let transport = SerialTransport::open(&config.port, config.baud_rate)?;
        start_session(transport, &config.vehicle, config.engine.clone()).await?
    };

    let vehicle = handle.vehicle();
    info!(
        session = %handle.session_id(),
        vin = vehicle.vin.as_deref().unwrap_or("unknown"),
        protocol = ?vehicle.protocol,
        supported = handle.supported().len(),
        "Session running"
    );

    if config.read_dtcs {
        match handle.request_dtcs().await {
            Ok(codes) if codes.is_empty() => info!("No stored trouble codes"),
            Ok(codes) => {
                for code in &codes {
                    warn!("{}", output::dtc_line(code));
                }
            }
            Err(e) => warn!("Reading trouble codes failed: {}", e),
        }
    }

    let deadline = config
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut display = tokio::time::interval(Duration::from_millis(config.display_interval_ms.max(1)));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = sleep_until_deadline(deadline) => {
                info!("Logging duration reached");
                break;
            }
            _ = display.tick() => {
                for sample in handle.latest_all() {
                    info!("{}", output::sample_line(&sample));
                }
                if !handle.current_connection_state().is_connected() {
                    warn!("Adapter disconnected, ending session");
                    break;
                }
            }
        }
    }

    Ok(handle.stop().await?)
}
