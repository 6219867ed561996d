//! Link-level message model shared by both transceiver variants.

use std::fmt;

use crate::error::Result;

/// Radio hardware address, little endian order: the first byte is the
/// least significant one.
pub type Address = [u8; 5];

/// Outcome of a link-level exchange. Statuses are outcomes, not errors;
/// transport faults are reported through `Error` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Nothing definitive happened within the deadline.
    None,
    /// The frame left the air interface (TX_DS).
    Transmitted,
    /// A frame arrived on the air interface (RX_DR).
    Received,
    /// The chip gave up after its hardware retries (MAX_RT).
    NoAck,
    /// The modem reported the slave did not answer in time.
    SlaveTimeout,
    /// The modem never saw the link-level acknowledgement.
    AckTimeout,
    /// A payload-bearing response frame.
    DataPacket,
    /// A bare acknowledgement frame.
    AckPacket,
}

/// One link-level event: status plus the peer address and any payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub status: MessageStatus,
    pub address: Address,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn status_only(status: MessageStatus, address: Address) -> Message {
        Message {
            status,
            address,
            payload: Vec::new(),
        }
    }
}

/// Seam between the RF model and the concrete radio hardware.
///
/// One synchronous request/response exchange at a time; implementations
/// serialize access internally where a worker thread shares the hardware.
pub trait Transmitter: Send {
    /// Send `data` to `address` and wait for the device's reply frame.
    ///
    /// Link-level failures (no ack, slave silent, deadline elapsed) come
    /// back as a `Message` status; only transport faults are `Err`.
    fn send_command(&mut self, address: Address, data: &[u8]) -> Result<Message>;

    /// Release the hardware. Idempotent.
    fn close(&mut self) {}
}

/// `AA:BB:CC:DD:EE` rendering used in log lines and outside keys.
pub fn format_address(address: &Address) -> String {
    let mut out = String::with_capacity(14);
    for (i, b) in address.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Parse the `AA:BB:CC:DD:EE` manifest form.
pub fn parse_address(text: &str) -> std::result::Result<Address, AddressParseError> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 5 {
        return Err(AddressParseError(text.to_string()));
    }
    let mut address = [0u8; 5];
    for (i, part) in parts.iter().enumerate() {
        address[i] =
            u8::from_str_radix(part, 16).map_err(|_| AddressParseError(text.to_string()))?;
    }
    Ok(address)
}

#[derive(Debug)]
pub struct AddressParseError(String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed device address {:?}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let address: Address = [0xAA, 0xBB, 0xCC, 0xDD, 0x01];
        let text = format_address(&address);
        assert_eq!(text, "AA:BB:CC:DD:01");
        assert_eq!(parse_address(&text).unwrap(), address);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(parse_address("AA:BB:CC:DD").is_err());
        assert!(parse_address("AA:BB:CC:DD:EE:FF").is_err());
        assert!(parse_address("AA:BB:CC:DD:GG").is_err());
        assert!(parse_address("").is_err());
    }
}
