use home_power_monitor::acquisition::HEARTBEAT_PERIOD;
use home_power_monitor::{LogPublisher, ModbusLink, MonitorConfig, PowerMonitor, ValueFetcher};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MonitorConfig::from_env();
    init_tracing(config.as_ref().map_or("info", MonitorConfig::log_level));

    info!("Starting home power monitor");
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return Err(e.into());
        }
    };

    let connection = &config.connection;
    let link = ModbusLink::new(&connection.host, connection.port, connection.unit_id);
    let values = ValueFetcher::new(&config.query_url)?;
    let mut monitor = PowerMonitor::new(
        connection,
        config.channels,
        config.mode,
        link,
        values,
        LogPublisher::new(),
    );
    monitor.start().await;

    monitor
        .run_until(HEARTBEAT_PERIOD, tokio::signal::ctrl_c())
        .await;

    monitor.stop().await;
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
