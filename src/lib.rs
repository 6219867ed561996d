//! A user space gateway mirroring nRF24L01(+) radio devices into a
//! key-value store on Linux.
//!
//! Remote devices expose flat, numbered functions addressed by
//! `(device address, unit, function number)`. The gateway discovers each
//! device's declared capabilities, periodically polls readable functions,
//! flushes commanded writes, and mirrors both directions through Redis so
//! other processes never have to speak the radio protocol.
//!
//! Two transports are supported: an nRF24L01(+) on SPI with a GPIO
//! interrupt line (`nrf`), and a UART-attached modem speaking a
//! SLIP-framed command set (`uart master`).
//!
//! # Usage
//!
//! The shipped binary wires everything from `settings.ini`:
//!
//! ```text
//! rf model = nrf
//! devices = devices.json
//!
//! [nrf]
//! port = /dev/spidev0.0
//! irq = 24
//! ce = 25
//! speed = 10000000
//!
//! [redis]
//! address = 127.0.0.1:6379
//! db = 0
//! ```
//!
//! The pieces compose as a library too:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rfhub::{Cache, NrfSettings, NrfTransmitter, RedisBridge, RedisSettings, RfModel};
//!
//! fn main() -> rfhub::Result<()> {
//!     let transmitter = NrfTransmitter::open(&NrfSettings {
//!         port: "/dev/spidev0.0".into(),
//!         irq: 24,
//!         ce: 25,
//!         speed: 10_000_000,
//!         channel: Some(108),
//!     })?;
//!     let rf = Arc::new(RfModel::new(Box::new(transmitter)));
//!     let outside = Arc::new(RedisBridge::open(&RedisSettings {
//!         address: "127.0.0.1:6379".into(),
//!         db: 0,
//!     })?);
//!     let cache = Cache::new(rf, outside);
//!     cache.spawn_update_loop()?.join().ok();
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod cache;
pub mod error;
pub mod manifest;
pub mod modem;
pub mod nrf;
pub mod outside;
pub mod protocol;
pub mod registers;
pub mod rf;
pub mod settings;
pub mod slip;
mod sysfs_pins;
pub mod transceiver;
pub mod value;

pub use crate::bridge::RedisBridge;
pub use crate::cache::{Cache, DeviceState, ItemConfig, WriteState};
pub use crate::error::{Error, Result};
pub use crate::modem::UmTransmitter;
pub use crate::nrf::NrfTransmitter;
pub use crate::outside::{OutsideInterface, SubMessage};
pub use crate::rf::{FuncNo, RfModel, Uid};
pub use crate::settings::{NrfSettings, RedisSettings, Settings, TransportSettings, UartSettings};
pub use crate::transceiver::{Address, Message, MessageStatus, Transmitter};
pub use crate::value::{DataType, Value};
