//! CE and IRQ pin handling through the Linux SysFS GPIO interface.

use sysfs_gpio::{Direction, Edge, Pin, PinPoller};

use crate::error::Result;

/// Chip Enable output. Low keeps the transceiver idle; transitions low to
/// high start RX listening or a TX burst depending on PRIM_RX.
pub struct CePin {
    pin: Pin,
}

impl CePin {
    pub fn new(pin_num: u64) -> Result<CePin> {
        let pin = Pin::new(pin_num);
        pin.export()?;
        // exported low: the chip must stay idle until configured
        pin.set_direction(Direction::Low)?;
        Ok(CePin { pin })
    }

    pub fn up(&mut self) -> Result<()> {
        self.pin.set_value(1)?;
        Ok(())
    }

    pub fn down(&mut self) -> Result<()> {
        self.pin.set_value(0)?;
        Ok(())
    }
}

/// The transceiver's active-low interrupt line.
pub struct IrqPin {
    pin: Pin,
}

impl IrqPin {
    pub fn new(pin_num: u64) -> Result<IrqPin> {
        let pin = Pin::new(pin_num);
        pin.export()?;
        pin.set_direction(Direction::In)?;
        pin.set_edge(Edge::FallingEdge)?;
        Ok(IrqPin { pin })
    }

    /// A poller must be created on the thread that waits on it.
    pub fn poller(&self) -> Result<PinPoller> {
        Ok(self.pin.get_poller()?)
    }
}
