//! nRF24L01(+) transmitter on SPI with a GPIO interrupt line.
//!
//! The chip is driven in interrupt mode: a dedicated worker thread blocks
//! on the falling edge of the IRQ pin, reads the STATUS register and turns
//! the pending interrupt source into a link-level `Message`. The
//! `send_command` caller waits on bounded channels fed by that worker.
//!
//! Every SPI transaction and CE toggle happens under one driver-wide mutex;
//! the worker takes the same mutex when servicing an edge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::error::{Error, Result};
use crate::registers::*;
use crate::settings::NrfSettings;
use crate::sysfs_pins::{CePin, IrqPin};
use crate::transceiver::{format_address, Address, Message, MessageStatus, Transmitter};

/// How long a transmission may take to resolve into TX_DS or MAX_RT.
const SEND_STATUS_TIMEOUT: Duration = Duration::from_millis(20);
/// How long a slave gets to answer once we are back in PRIM_RX.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);
/// Edge-poll slicing so the worker can notice shutdown.
const IRQ_POLL_MS: isize = 100;

/// Everything that talks to the chip. Wrapped in the driver mutex.
struct NrfHw {
    spi: Spidev,
    ce: CePin,
    // STATUS is clocked out on every SPI command; keep the latest copy
    status: u8,
}

impl NrfHw {
    /// One full-duplex SPI transaction: command word, then `data.len()`
    /// bytes shifted in each direction. Refreshes `self.status`.
    fn send_spi(&mut self, command: Command, data: &[u8]) -> Result<Vec<u8>> {
        let mut write = Vec::with_capacity(1 + data.len());
        write.push(command);
        write.extend_from_slice(data);
        let mut read = vec![0u8; write.len()];
        {
            let mut transfer = SpidevTransfer::read_write(&write, &mut read);
            self.spi.transfer(&mut transfer)?;
        }
        self.status = read[0];
        trace!("spi {:02X?} -> {:02X?}", write, read);
        Ok(read.split_off(1))
    }

    fn read_register(&mut self, register: Register) -> Result<Vec<u8>> {
        let placeholder = vec![0u8; register_length(register)];
        self.send_spi(R_REGISTER | register, &placeholder)
    }

    fn write_register(&mut self, register: Register, data: &[u8]) -> Result<()> {
        if data.len() > register_length(register) {
            return Err(Error::BadParameter(format!(
                "data is bigger than register {:#04x} size",
                register
            )));
        }
        self.send_spi(W_REGISTER | register, data)?;
        Ok(())
    }

    fn write_byte_register(&mut self, register: Register, data: u8) -> Result<()> {
        self.write_register(register, &[data])
    }

    fn update_config<F: FnOnce(u8) -> u8>(&mut self, f: F) -> Result<()> {
        let config = self.read_register(CONFIG)?[0];
        self.write_byte_register(CONFIG, f(config))
    }

    /// NOP clocks nothing but still returns STATUS.
    fn refresh_status(&mut self) -> Result<u8> {
        self.send_spi(NOP, &[])?;
        Ok(self.status)
    }

    fn flush_tx(&mut self) -> Result<()> {
        self.send_spi(FLUSH_TX, &[])?;
        Ok(())
    }

    fn flush_rx(&mut self) -> Result<()> {
        self.send_spi(FLUSH_RX, &[])?;
        Ok(())
    }

    fn set_ce(&mut self, high: bool) -> Result<()> {
        if high {
            self.ce.up()
        } else {
            self.ce.down()
        }
    }

    fn register_address(&mut self, register: Register) -> Result<Address> {
        let raw = self.read_register(register)?;
        let mut address: Address = Default::default();
        if raw.len() != address.len() {
            return Err(Error::General(format!(
                "register {:#04x} returned {} address bytes",
                register,
                raw.len()
            )));
        }
        address.copy_from_slice(&raw);
        Ok(address)
    }

    /// Source address of the payload waiting on `pipe`. Pipes 2-5 share
    /// the high bytes of pipe 1 and differ in one byte.
    fn pipe_address(&mut self, pipe: u8) -> Result<Address> {
        if pipe == 0 {
            return self.register_address(RX_ADDR_P0);
        }
        let mut address = self.register_address(RX_ADDR_P1)?;
        if pipe > 1 {
            let lsb = self.read_register(RX_ADDR_P2 - 2 + pipe)?;
            address[4] = lsb[0];
        }
        Ok(address)
    }

    /// Bring the chip into the gateway's ground state: CRC16, powered up,
    /// listening on pipe 0 with dynamic payload lengths, hardware auto-ack
    /// off (acknowledgement is an explicit protocol response), 1 Mbps at
    /// full power.
    fn init(&mut self) -> Result<()> {
        self.set_ce(false)?;
        self.flush_rx()?;
        self.flush_tx()?;
        self.write_byte_register(STATUS, RX_DR | TX_DS | MAX_RT)?;
        self.write_byte_register(CONFIG, EN_CRC | CRCO | PWR_UP | PRIM_RX)?;
        self.write_byte_register(EN_AA, 0)?;
        self.write_byte_register(DYNPD, PIPE_0 | PIPE_1)?;
        self.write_byte_register(FEATURE, EN_DPL)?;
        self.write_byte_register(EN_RXADDR, PIPE_0)?;
        self.write_byte_register(RF_SETUP, RF_PWR_MAX)?;
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<()> {
        if channel > 125 {
            return Err(Error::BadParameter(format!(
                "incorrect rf channel {}",
                channel
            )));
        }
        self.write_byte_register(RF_CH, channel)
    }

    /// Push one frame at `address` and start the TX burst. The IRQ worker
    /// reports the outcome.
    fn transmit(&mut self, address: Address, data: &[u8]) -> Result<()> {
        if data.len() > 32 {
            return Err(Error::BadParameter(format!(
                "too big payload, {} bytes",
                data.len()
            )));
        }
        self.set_ce(false)?;
        // transmission starts on a clean low-to-high CE edge
        thread::sleep(Duration::new(0, 10_000));
        self.write_byte_register(STATUS, TX_DS | MAX_RT)?;
        self.write_register(TX_ADDR, &address)?;
        self.write_register(RX_ADDR_P0, &address)?;
        self.send_spi(W_TX_PAYLOAD, data)?;
        self.update_config(|config| config & !PRIM_RX)?;
        self.set_ce(true)
    }

    /// Return to PRIM_RX listening for `address` on pipe 0.
    fn listen(&mut self, address: Address) -> Result<()> {
        self.write_register(RX_ADDR_P0, &address)?;
        self.write_byte_register(EN_RXADDR, PIPE_0)?;
        self.update_config(|config| config | PRIM_RX)?;
        self.set_ce(true)
    }

    fn power_down(&mut self) -> Result<()> {
        self.set_ce(false)?;
        self.update_config(|config| config & !PWR_UP)
    }
}

/// SPI+IRQ transmitter handle.
pub struct NrfTransmitter {
    hw: Arc<Mutex<NrfHw>>,
    tx_status: Receiver<Message>,
    rx_messages: Receiver<Message>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NrfTransmitter {
    /// Open the SPI device and GPIO pins, initialize the chip and start
    /// the IRQ worker.
    pub fn open(settings: &NrfSettings) -> Result<NrfTransmitter> {
        let mut spi = Spidev::open(&settings.port)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(settings.speed)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.configure(&options)?;
        let ce = CePin::new(settings.ce)?;
        let irq = IrqPin::new(settings.irq)?;

        let mut hw = NrfHw { spi, ce, status: 0 };
        hw.init()?;
        if let Some(channel) = settings.channel {
            hw.set_channel(channel)?;
        }

        let hw = Arc::new(Mutex::new(hw));
        let running = Arc::new(AtomicBool::new(true));
        let (tx_status_tx, tx_status_rx) = channel();
        let (rx_messages_tx, rx_messages_rx) = channel();
        let worker = {
            let hw = Arc::clone(&hw);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("nrf-irq".into())
                .spawn(move || irq_worker(hw, irq, tx_status_tx, rx_messages_tx, running))?
        };
        info!("nrf transceiver ready on {}", settings.port);
        Ok(NrfTransmitter {
            hw,
            tx_status: tx_status_rx,
            rx_messages: rx_messages_rx,
            running,
            worker: Some(worker),
        })
    }

    fn drain_stale_messages(&self) {
        while self.tx_status.try_recv().is_ok() {}
        while self.rx_messages.try_recv().is_ok() {}
    }
}

impl Transmitter for NrfTransmitter {
    fn send_command(&mut self, address: Address, data: &[u8]) -> Result<Message> {
        self.drain_stale_messages();
        self.hw.lock().unwrap().transmit(address, data)?;

        let sent = match self.tx_status.recv_timeout(SEND_STATUS_TIMEOUT) {
            Ok(message) => message,
            Err(_) => {
                debug!(
                    "no transmit outcome for {} within {:?}",
                    format_address(&address),
                    SEND_STATUS_TIMEOUT
                );
                return Ok(Message::status_only(MessageStatus::SlaveTimeout, address));
            }
        };
        match sent.status {
            MessageStatus::Transmitted => {
                self.hw.lock().unwrap().listen(address)?;
                match self.rx_messages.recv_timeout(RECEIVE_TIMEOUT) {
                    Ok(message) => Ok(Message {
                        status: MessageStatus::DataPacket,
                        address: message.address,
                        payload: message.payload,
                    }),
                    Err(_) => Ok(Message::status_only(MessageStatus::SlaveTimeout, address)),
                }
            }
            MessageStatus::NoAck => Ok(Message::status_only(MessageStatus::AckTimeout, address)),
            _ => Ok(Message::status_only(MessageStatus::SlaveTimeout, address)),
        }
    }

    fn close(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
        if let Err(e) = self.hw.lock().unwrap().power_down() {
            warn!("power down failed: {}", e);
        }
        info!("nrf transceiver closed");
    }
}

impl Drop for NrfTransmitter {
    fn drop(&mut self) {
        self.close();
    }
}

/// The IRQ pin goes low when TX_DS, MAX_RT or RX_DR is set in STATUS.
/// One interrupt source is serviced per wake, highest priority first.
fn irq_worker(
    hw: Arc<Mutex<NrfHw>>,
    irq: IrqPin,
    tx_status: Sender<Message>,
    rx_messages: Sender<Message>,
    running: Arc<AtomicBool>,
) {
    let mut poller = match irq.poller() {
        Ok(poller) => poller,
        Err(e) => {
            error!("irq poller unavailable: {}", e);
            return;
        }
    };
    while running.load(Ordering::SeqCst) {
        match poller.poll(IRQ_POLL_MS) {
            Ok(Some(_)) => {
                let mut hw = hw.lock().unwrap();
                if let Err(e) = service_irq(&mut hw, &tx_status, &rx_messages) {
                    warn!("irq service failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("irq poll failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn service_irq(
    hw: &mut NrfHw,
    tx_status: &Sender<Message>,
    rx_messages: &Sender<Message>,
) -> Result<()> {
    hw.set_ce(false)?;
    let status = hw.refresh_status()?;
    trace!("irq status {:#04x}", status);
    if status & TX_DS != 0 {
        let address = hw.register_address(TX_ADDR)?;
        hw.write_byte_register(STATUS, TX_DS)?;
        // half-duplex turnaround: be listening before the slave answers
        hw.update_config(|config| config | PRIM_RX)?;
        tx_status
            .send(Message::status_only(MessageStatus::Transmitted, address))
            .ok();
    } else if status & MAX_RT != 0 {
        let address = hw.register_address(TX_ADDR)?;
        // the failed frame stays in the TX FIFO and would be re-sent
        hw.flush_tx()?;
        hw.write_byte_register(STATUS, MAX_RT)?;
        debug!("no ack from {}", format_address(&address));
        tx_status
            .send(Message::status_only(MessageStatus::NoAck, address))
            .ok();
    } else if status & RX_DR != 0 {
        receive_all(hw, rx_messages)?;
    }
    Ok(())
}

/// Drain the RX FIFO: payload width, payload, source pipe and address,
/// repeated until the FIFO reports empty.
fn receive_all(hw: &mut NrfHw, rx_messages: &Sender<Message>) -> Result<()> {
    loop {
        let pipe = (hw.status & RX_P_NO_MASK) >> RX_P_NO_SHIFT;
        if pipe == RX_P_NO_EMPTY {
            break;
        }
        if pipe > 5 {
            hw.flush_rx()?;
            return Err(Error::General(format!("invalid rx pipe number {}", pipe)));
        }
        hw.write_byte_register(STATUS, RX_DR)?;
        let width = hw.send_spi(R_RX_PL_WID, &[0])?[0];
        if width > 32 {
            // corrupt FIFO entry; nothing downstream can use it
            hw.flush_rx()?;
            break;
        }
        let payload = if width == 0 {
            Vec::new()
        } else {
            let placeholder = vec![0u8; width as usize];
            hw.send_spi(R_RX_PAYLOAD, &placeholder)?
        };
        let address = hw.pipe_address(pipe)?;
        trace!(
            "received {} bytes from {} on pipe {}",
            payload.len(),
            format_address(&address),
            pipe
        );
        rx_messages
            .send(Message {
                status: MessageStatus::Received,
                address,
                payload,
            })
            .ok();
        hw.refresh_status()?;
    }
    Ok(())
}
