//! UART-attached radio modem ("uart master" transport).
//!
//! The modem speaks a SLIP-framed command envelope over a serial line and
//! performs the actual air-interface work itself; the host issues one
//! command at a time and polls the modem's RX queue for slave responses.

use std::io;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use serialport::SerialPort;

use crate::error::{Error, Result};
use crate::settings::UartSettings;
use crate::slip;
use crate::transceiver::{format_address, Address, Message, MessageStatus, Transmitter};

/// Inner envelope protocol version.
pub const MODEM_PROTOCOL_VERSION: u8 = 0;

/// Bound on a single serial request/response exchange.
const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on waiting for the modem to produce a definitive slave response.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Serial read slicing; each read returns whatever arrived within this.
const READ_TIMEOUT: Duration = Duration::from_millis(50);
/// Pause between RX queue polls when the modem reports no packets.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub type ModemCommand = u8;

pub const MC_ECHO: ModemCommand = 0x00;
pub const MC_FW_VERSION: ModemCommand = 0x01;
pub const MC_MODEM_STATUS: ModemCommand = 0x08;
pub const MC_ADDRESSES: ModemCommand = 0x09;
pub const MC_SET_RF_CHANNEL: ModemCommand = 0x10;
pub const MC_SET_TX_POWER: ModemCommand = 0x11;
pub const MC_SET_BIT_RATE: ModemCommand = 0x12;
pub const MC_SET_AUTO_RETRANSMIT_DELAY: ModemCommand = 0x13;
pub const MC_SET_AUTO_RETRANSMIT_COUNT: ModemCommand = 0x14;
pub const MC_CLEAR_TX_QUEUE: ModemCommand = 0x20;
pub const MC_CLEAR_RX_QUEUE: ModemCommand = 0x21;
pub const MC_LISTEN: ModemCommand = 0x30;
pub const MC_SET_MASTER_SLAVE_MODE: ModemCommand = 0x40;
pub const MC_SET_MASTER_ADDRESS: ModemCommand = 0x41;
pub const MC_GET_RX_ITEM: ModemCommand = 0x50;
pub const MC_TRANSMIT: ModemCommand = 0x7F;

/// A response command echoes the request command with the top bit set.
pub const MC_RESPONSE_FLAG: ModemCommand = 0x80;

pub type ModemResponseCode = u8;

pub const MR_OK: ModemResponseCode = 0x00;
pub const MR_NO_PACKETS: ModemResponseCode = 0x10;
pub const MR_SLAVE_RESPONSE_TIMEOUT: ModemResponseCode = 0x11;
pub const MR_ACK_TIMEOUT: ModemResponseCode = 0x12;
pub const MR_DATA_PACKET: ModemResponseCode = 0x14;
pub const MR_ACK_PACKET: ModemResponseCode = 0x15;
// fatal errors
pub const MR_FAIL: ModemResponseCode = 0x80;
pub const MR_BAD_PROTOCOL_VERSION: ModemResponseCode = 0x90;
pub const MR_BAD_COMMAND: ModemResponseCode = 0x91;
pub const MR_MEMORY_ERROR: ModemResponseCode = 0x92;
pub const MR_ARGUMENT_VALIDATION_ERROR: ModemResponseCode = 0x93;
pub const MR_NOT_IMPLEMENTED: ModemResponseCode = 0x94;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemResponse {
    pub version: u8,
    pub command: ModemCommand,
    pub code: ModemResponseCode,
    pub payload: Vec<u8>,
}

/// Register dump answered to the ModemStatus debug command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemStatusRegisters {
    pub config: u8,
    pub en_aa: u8,
    pub en_rx_addr: u8,
    pub setup_aw: u8,
    pub setup_retr: u8,
    pub rf_ch: u8,
    pub rf_setup: u8,
    pub status: u8,
    pub observe_tx: u8,
    pub rpd: u8,
    pub rx_pw: [u8; 6],
    pub fifo_status: u8,
    pub dynpd: u8,
    pub feature: u8,
    pub buffer_packet_count: u8,
}

impl ModemStatusRegisters {
    pub fn parse(payload: &[u8]) -> Result<ModemStatusRegisters> {
        if payload.len() != 20 {
            return Err(Error::BadResponse(format!(
                "modem status dump has {} bytes instead of 20",
                payload.len()
            )));
        }
        let mut rx_pw = [0u8; 6];
        rx_pw.copy_from_slice(&payload[10..16]);
        Ok(ModemStatusRegisters {
            config: payload[0],
            en_aa: payload[1],
            en_rx_addr: payload[2],
            setup_aw: payload[3],
            setup_retr: payload[4],
            rf_ch: payload[5],
            rf_setup: payload[6],
            status: payload[7],
            observe_tx: payload[8],
            rpd: payload[9],
            rx_pw,
            fifo_status: payload[16],
            dynpd: payload[17],
            feature: payload[18],
            buffer_packet_count: payload[19],
        })
    }
}

/// Address registers answered to the Addresses debug command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemAddressRegisters {
    pub rx_addr_p0: Address,
    pub rx_addr_p1: Address,
    /// Pipes 2-5 differ from pipe 1 in a single byte.
    pub rx_addr_lsb: [u8; 4],
    pub tx_addr: Address,
}

impl ModemAddressRegisters {
    pub fn parse(payload: &[u8]) -> Result<ModemAddressRegisters> {
        if payload.len() != 19 {
            return Err(Error::BadResponse(format!(
                "modem address dump has {} bytes instead of 19",
                payload.len()
            )));
        }
        let mut registers = ModemAddressRegisters {
            rx_addr_p0: Default::default(),
            rx_addr_p1: Default::default(),
            rx_addr_lsb: [0u8; 4],
            tx_addr: Default::default(),
        };
        registers.rx_addr_p0.copy_from_slice(&payload[0..5]);
        registers.rx_addr_p1.copy_from_slice(&payload[5..10]);
        registers.rx_addr_lsb.copy_from_slice(&payload[10..14]);
        registers.tx_addr.copy_from_slice(&payload[14..19]);
        Ok(registers)
    }
}

pub fn encode_request(command: ModemCommand, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(3 + payload.len());
    packet.push(MODEM_PROTOCOL_VERSION);
    packet.push(command);
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    packet
}

pub fn parse_response(packet: &[u8]) -> Result<ModemResponse> {
    if packet.len() < 4 {
        return Err(Error::PacketValidation("too short response".into()));
    }
    if 4 + packet[3] as usize != packet.len() {
        return Err(Error::PacketValidation(
            "incorrect response payload length".into(),
        ));
    }
    Ok(ModemResponse {
        version: packet[0],
        command: packet[1],
        code: packet[2],
        payload: packet[4..].to_vec(),
    })
}

/// Does the accumulated serial buffer hold one well-formed framed response?
fn is_frame_complete(buffer: &[u8]) -> bool {
    match slip::unstuff(buffer) {
        Ok(body) => parse_response(&body).is_ok(),
        Err(_) => false,
    }
}

/// Split a GetRxItem payload into the link-level message it describes.
fn rx_item_message(code: ModemResponseCode, payload: &[u8]) -> Result<Message> {
    let status = match code {
        MR_NO_PACKETS => MessageStatus::None,
        MR_SLAVE_RESPONSE_TIMEOUT => MessageStatus::SlaveTimeout,
        MR_ACK_TIMEOUT => MessageStatus::AckTimeout,
        MR_DATA_PACKET => MessageStatus::DataPacket,
        MR_ACK_PACKET => MessageStatus::AckPacket,
        other => {
            return Err(Error::BadResponse(format!(
                "unexpected rx item code {:#04x}",
                other
            )))
        }
    };
    let mut address: Address = Default::default();
    if payload.len() >= address.len() {
        address.copy_from_slice(&payload[..5]);
    }
    let data = if payload.len() > address.len() {
        payload[5..].to_vec()
    } else {
        Vec::new()
    };
    Ok(Message {
        status,
        address,
        payload: data,
    })
}

/// Serial-attached modem transmitter.
pub struct UmTransmitter {
    port: Box<dyn SerialPort>,
}

impl UmTransmitter {
    /// Open the serial port and verify the modem is alive with an echo
    /// probe, then log its firmware version.
    pub fn open(settings: &UartSettings) -> Result<UmTransmitter> {
        let port = serialport::new(settings.port.as_str(), settings.speed)
            .timeout(READ_TIMEOUT)
            .open()?;
        let mut transmitter = UmTransmitter { port };
        transmitter.echo(&[0x55, 0xAA, 0x31])?;
        let version = transmitter.fw_version()?;
        info!(
            "modem on {} answered, firmware {:02X?}",
            settings.port, version
        );
        if let Some(channel) = settings.channel {
            transmitter.set_rf_channel(channel)?;
        }
        Ok(transmitter)
    }

    /// One framed request, one framed response, bounded in time.
    fn transaction(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        trace!("modem transaction {:02X?}", frame);
        self.port
            .write_all(frame)
            .map_err(|e| Error::General(format!("modem write: {}", e)))?;
        let deadline = Instant::now() + TRANSACTION_TIMEOUT;
        let mut buffer = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(n) if n > 0 => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if is_frame_complete(&buffer) {
                        trace!("modem answered {:02X?}", &buffer[..]);
                        return Ok(buffer.to_vec());
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(Error::General(format!("modem read: {}", e))),
            }
            if Instant::now() >= deadline {
                return Err(Error::General(format!(
                    "modem response timeout, request {:02X?}",
                    frame
                )));
            }
        }
    }

    fn command(&mut self, command: ModemCommand, payload: &[u8]) -> Result<ModemResponse> {
        let raw = self.transaction(&slip::stuff(&encode_request(command, payload)))?;
        let response = parse_response(&slip::unstuff(&raw)?)?;
        if response.command != command | MC_RESPONSE_FLAG {
            return Err(Error::PacketValidation(format!(
                "modem answered command {:#04x} to command {:#04x}",
                response.command, command
            )));
        }
        Ok(response)
    }

    /// A command that must come back `Ok` with no interesting payload.
    fn checked_command(&mut self, command: ModemCommand, payload: &[u8]) -> Result<()> {
        let response = self.command(command, payload)?;
        if response.code != MR_OK {
            return Err(Error::General(format!(
                "modem response code {:#04x} to command {:#04x} is not ok",
                response.code, command
            )));
        }
        Ok(())
    }

    pub fn echo(&mut self, probe: &[u8]) -> Result<()> {
        let response = self.command(MC_ECHO, probe)?;
        if response.code != MR_OK || response.payload != probe {
            return Err(Error::General(format!(
                "modem echo mismatch: sent {:02X?}, got {:02X?}",
                probe, response.payload
            )));
        }
        Ok(())
    }

    pub fn fw_version(&mut self) -> Result<Vec<u8>> {
        let response = self.command(MC_FW_VERSION, &[])?;
        if response.code != MR_OK {
            return Err(Error::General(format!(
                "modem refused version query, code {:#04x}",
                response.code
            )));
        }
        Ok(response.payload)
    }

    pub fn set_rf_channel(&mut self, channel: u8) -> Result<()> {
        if channel > 125 {
            return Err(Error::BadParameter(format!(
                "incorrect rf channel {}",
                channel
            )));
        }
        self.checked_command(MC_SET_RF_CHANNEL, &[channel])
    }

    /// Transmit power attenuation step, 0 (max) to 3 (min).
    pub fn set_tx_power(&mut self, power: u8) -> Result<()> {
        if power > 3 {
            return Err(Error::BadParameter(format!("incorrect tx power {}", power)));
        }
        self.checked_command(MC_SET_TX_POWER, &[power])
    }

    pub fn set_bit_rate(&mut self, rate: u8) -> Result<()> {
        self.checked_command(MC_SET_BIT_RATE, &[rate])
    }

    /// Delay between hardware retransmits in 250 µs steps, 0-15.
    pub fn set_auto_retransmit_delay(&mut self, delay: u8) -> Result<()> {
        if delay > 15 {
            return Err(Error::BadParameter(format!(
                "incorrect auto retransmit delay {}",
                delay
            )));
        }
        self.checked_command(MC_SET_AUTO_RETRANSMIT_DELAY, &[delay])
    }

    /// Hardware retransmit budget, 0-15.
    pub fn set_auto_retransmit_count(&mut self, count: u8) -> Result<()> {
        if count > 15 {
            return Err(Error::BadParameter(format!(
                "incorrect auto retransmit count {}",
                count
            )));
        }
        self.checked_command(MC_SET_AUTO_RETRANSMIT_COUNT, &[count])
    }

    pub fn clear_tx_queue(&mut self) -> Result<()> {
        self.checked_command(MC_CLEAR_TX_QUEUE, &[])
    }

    pub fn clear_rx_queue(&mut self) -> Result<()> {
        self.checked_command(MC_CLEAR_RX_QUEUE, &[])
    }

    pub fn listen(&mut self, address: Address) -> Result<()> {
        self.checked_command(MC_LISTEN, &address)
    }

    /// True puts the modem in master mode, false in slave mode.
    pub fn set_master_slave_mode(&mut self, master: bool) -> Result<()> {
        self.checked_command(MC_SET_MASTER_SLAVE_MODE, &[master as u8])
    }

    pub fn set_master_address(&mut self, address: Address) -> Result<()> {
        self.checked_command(MC_SET_MASTER_ADDRESS, &address)
    }

    pub fn modem_status(&mut self) -> Result<ModemStatusRegisters> {
        let response = self.command(MC_MODEM_STATUS, &[])?;
        if response.code != MR_OK {
            return Err(Error::General(format!(
                "modem refused status query, code {:#04x}",
                response.code
            )));
        }
        ModemStatusRegisters::parse(&response.payload)
    }

    pub fn addresses(&mut self) -> Result<ModemAddressRegisters> {
        let response = self.command(MC_ADDRESSES, &[])?;
        if response.code != MR_OK {
            return Err(Error::General(format!(
                "modem refused address query, code {:#04x}",
                response.code
            )));
        }
        ModemAddressRegisters::parse(&response.payload)
    }

    fn transmit(&mut self, address: Address, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(address.len() + data.len());
        payload.extend_from_slice(&address);
        payload.extend_from_slice(data);
        self.checked_command(MC_TRANSMIT, &payload)
    }

    fn get_rx_item(&mut self) -> Result<Message> {
        let response = self.command(MC_GET_RX_ITEM, &[])?;
        rx_item_message(response.code, &response.payload)
    }
}

impl Transmitter for UmTransmitter {
    /// Command the modem to transact with a slave, then poll its RX queue
    /// until something definitive arrives or the deadline passes.
    fn send_command(&mut self, address: Address, data: &[u8]) -> Result<Message> {
        self.transmit(address, data)?;
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let message = self.get_rx_item()?;
            match message.status {
                // wasn't even sent
                MessageStatus::AckTimeout => {
                    return Ok(Message::status_only(MessageStatus::AckTimeout, address));
                }
                MessageStatus::DataPacket | MessageStatus::SlaveTimeout => {
                    if message.address == address {
                        debug!(
                            "modem delivered {:?} from {}",
                            message.status,
                            format_address(&message.address)
                        );
                        return Ok(message);
                    }
                    warn!(
                        "discarding packet from the wrong address {}",
                        format_address(&message.address)
                    );
                }
                MessageStatus::None => thread::sleep(POLL_INTERVAL),
                _ => {}
            }
            if Instant::now() >= deadline {
                warn!(
                    "modem did not produce a response for {} within {:?}",
                    format_address(&address),
                    RESPONSE_TIMEOUT
                );
                return Ok(Message::status_only(MessageStatus::None, address));
            }
        }
    }
}
