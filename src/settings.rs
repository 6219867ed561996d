//! Flat INI settings file consumed at startup.
//!
//! The general section selects the RF transport (`rf model = nrf` or
//! `uart master`) and names the device manifest; `[nrf]`, `[uart master]`
//! and `[redis]` hold the transport and store parameters.

use std::path::Path;
use std::str::FromStr;

use ini::Ini;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct NrfSettings {
    /// SPI device path, e.g. `/dev/spidev0.0`.
    pub port: String,
    /// IRQ GPIO number (SysFS).
    pub irq: u64,
    /// CE GPIO number (SysFS).
    pub ce: u64,
    /// SPI clock in Hz.
    pub speed: u32,
    /// RF channel to tune at startup, left as-is when absent.
    pub channel: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct UartSettings {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    /// Baud rate.
    pub speed: u32,
    pub channel: Option<u8>,
}

#[derive(Debug, Clone)]
pub enum TransportSettings {
    Nrf(NrfSettings),
    UartMaster(UartSettings),
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub address: String,
    pub db: i64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub transport: TransportSettings,
    /// Path of the JSON device manifest.
    pub devices: String,
    pub redis: RedisSettings,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|e| {
            Error::BadParameter(format!("unable to load {}: {}", path.display(), e))
        })?;
        Settings::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Settings> {
        let general = ini.general_section();
        let transport = match general.get("rf model").unwrap_or("nrf") {
            "nrf" => TransportSettings::Nrf(NrfSettings {
                port: require(ini, "nrf", "port")?.to_string(),
                irq: number(require(ini, "nrf", "irq")?, "irq")?,
                ce: number(require(ini, "nrf", "ce")?, "ce")?,
                speed: number(require(ini, "nrf", "speed")?, "speed")?,
                channel: optional_number(ini, "nrf", "channel")?,
            }),
            "uart master" => TransportSettings::UartMaster(UartSettings {
                port: require(ini, "uart master", "port")?.to_string(),
                speed: number(require(ini, "uart master", "speed")?, "speed")?,
                channel: optional_number(ini, "uart master", "channel")?,
            }),
            other => {
                return Err(Error::BadParameter(format!(
                    "unknown rf model {:?}",
                    other
                )))
            }
        };
        let redis_section = ini.section(Some("redis"));
        let redis = RedisSettings {
            address: redis_section
                .and_then(|section| section.get("address"))
                .unwrap_or("127.0.0.1:6379")
                .to_string(),
            db: match redis_section.and_then(|section| section.get("db")) {
                Some(text) => number(text, "db")?,
                None => 0,
            },
        };
        Ok(Settings {
            transport,
            devices: general.get("devices").unwrap_or("devices.json").to_string(),
            redis,
        })
    }
}

fn require<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str> {
    ini.section(Some(section))
        .and_then(|properties| properties.get(key))
        .ok_or_else(|| Error::BadParameter(format!("settings key [{}] {} is missing", section, key)))
}

fn number<T: FromStr>(text: &str, what: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::BadParameter(format!("settings key {} has invalid value {:?}", what, text)))
}

fn optional_number<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Result<Option<T>> {
    match ini.section(Some(section)).and_then(|properties| properties.get(key)) {
        Some(text) => Ok(Some(number(text, key)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nrf_transport() {
        let ini = Ini::load_from_str(
            "rf model = nrf\n\
             devices = /etc/rfhub/devices.json\n\
             [nrf]\n\
             port = /dev/spidev0.0\n\
             irq = 24\n\
             ce = 25\n\
             speed = 10000000\n\
             channel = 108\n\
             [redis]\n\
             address = 10.0.0.2:6379\n\
             db = 3\n",
        )
        .unwrap();
        let settings = Settings::from_ini(&ini).unwrap();
        match settings.transport {
            TransportSettings::Nrf(nrf) => {
                assert_eq!(nrf.port, "/dev/spidev0.0");
                assert_eq!(nrf.irq, 24);
                assert_eq!(nrf.ce, 25);
                assert_eq!(nrf.speed, 10_000_000);
                assert_eq!(nrf.channel, Some(108));
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(settings.devices, "/etc/rfhub/devices.json");
        assert_eq!(settings.redis.address, "10.0.0.2:6379");
        assert_eq!(settings.redis.db, 3);
    }

    #[test]
    fn uart_transport_with_defaults() {
        let ini = Ini::load_from_str(
            "rf model = uart master\n\
             [uart master]\n\
             port = /dev/ttyUSB0\n\
             speed = 115200\n",
        )
        .unwrap();
        let settings = Settings::from_ini(&ini).unwrap();
        match settings.transport {
            TransportSettings::UartMaster(uart) => {
                assert_eq!(uart.port, "/dev/ttyUSB0");
                assert_eq!(uart.speed, 115200);
                assert_eq!(uart.channel, None);
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(settings.devices, "devices.json");
        assert_eq!(settings.redis.address, "127.0.0.1:6379");
        assert_eq!(settings.redis.db, 0);
    }

    #[test]
    fn missing_keys_are_reported() {
        let ini = Ini::load_from_str("rf model = nrf\n[nrf]\nport = /dev/spidev0.0\n").unwrap();
        assert!(matches!(
            Settings::from_ini(&ini),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let ini = Ini::load_from_str("rf model = carrier pigeon\n").unwrap();
        assert!(matches!(
            Settings::from_ini(&ini),
            Err(Error::BadParameter(_))
        ));
    }
}
