use std::io;

use thiserror::Error;

/// Failure classes surfaced by the protocol stack.
///
/// The update engine keys device-state transitions off the variant:
/// `DeviceTimeout` marks a device offline, everything else marks it errored.
#[derive(Error, Debug)]
pub enum Error {
    #[error("general error: {0}")]
    General(String),
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("packet validation: {0}")]
    PacketValidation(String),
    #[error("device did not respond 3 times in a row")]
    DeviceTimeout,
    #[error("function return code {code:#04x} is not 0")]
    BadCode { code: u8 },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("gpio error: {0}")]
    Gpio(#[from] sysfs_gpio::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, Error>;
