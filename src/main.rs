use std::env;
use std::sync::Arc;

use anyhow::Context;
use log::info;

use rfhub::manifest;
use rfhub::{
    Cache, NrfTransmitter, RedisBridge, RfModel, Settings, Transmitter, TransportSettings,
    UmTransmitter,
};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = env::args().nth(1).unwrap_or_else(|| "settings.ini".to_string());
    let settings = Settings::load(&path).with_context(|| format!("settings file {}", path))?;

    let transmitter: Box<dyn Transmitter + Send> = match &settings.transport {
        TransportSettings::Nrf(nrf) => {
            Box::new(NrfTransmitter::open(nrf).context("nrf transceiver")?)
        }
        TransportSettings::UartMaster(uart) => {
            Box::new(UmTransmitter::open(uart).context("uart modem")?)
        }
    };
    let rf = Arc::new(RfModel::new(transmitter));
    let outside = Arc::new(RedisBridge::open(&settings.redis).context("redis bridge")?);
    let cache = Cache::new(Arc::clone(&rf), outside);

    let manifest = manifest::load(&settings.devices)
        .with_context(|| format!("device manifest {}", settings.devices))?;
    manifest::register(&cache, &manifest).context("manifest registration")?;

    let update_loop = cache.spawn_update_loop().context("update loop")?;
    info!("gateway running");
    update_loop
        .join()
        .map_err(|_| anyhow::anyhow!("update loop panicked"))?;
    rf.close();
    Ok(())
}
