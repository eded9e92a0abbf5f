use std::process;

use janus::{config::Config, logger::LoggerManager, print_error, service};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    info!("Starting janus version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!(
        "Brokers: {:?}, topic: {}, tuning: {:?}",
        cfg.mqtt.brokers, cfg.mqtt.topic, cfg.mqtt.tuning
    );

    if let Err(e) = service::run(cfg.mqtt).await {
        error!("{}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}
