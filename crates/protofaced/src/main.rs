use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{Bus, Config};
use dbus_interface::{EnrollService, ServiceInfo};

const BUS_NAME: &str = "org.protoface.Enroll1";
const OBJECT_PATH: &str = "/org/protoface/Enroll1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("protofaced starting");

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        strategy = %config.enroll.strategy,
        augment_count = config.enroll.augment_count,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config)?;

    let service = EnrollService::new(
        engine,
        Duration::from_secs(config.enroll_timeout_secs),
        ServiceInfo {
            model_dir: config.model_dir.display().to_string(),
            db_path: config.db_path.display().to_string(),
            strategy: config.enroll.strategy.to_string(),
            augment_count: config.enroll.augment_count,
        },
    );

    let builder = match config.bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "protofaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("protofaced shutting down");

    Ok(())
}
