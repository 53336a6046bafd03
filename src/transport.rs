//! Blocking SocketCAN transport.
//!
//! # Example
//!
//! ```no_run
//! use pylonbms_lib::{protocol, transport::CanBus, Assembler};
//!
//! fn main() -> Result<(), pylonbms_lib::Error> {
//!     let mut bus = CanBus::open("can0")?;
//!     bus.send(&protocol::build_poll_request())?;
//!
//!     let mut assembler = Assembler::default();
//!     loop {
//!         if let Some(frame) = bus.receive()? {
//!             let _ = assembler.process(&frame);
//!         }
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use crate::protocol::RawFrame;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};

#[derive(Debug)]
pub struct CanBus {
    socket: CanSocket,
    ifname: String,
    sequence: u64,
}

impl CanBus {
    pub fn open(ifname: &str) -> Result<Self> {
        let socket = CanSocket::open(ifname)?;
        log::debug!("Opened CAN interface {ifname}");
        Ok(Self {
            socket,
            ifname: ifname.to_string(),
            sequence: 0,
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Blocks until the next frame arrives.
    ///
    /// Returns `None` for remote, error and extended-id frames, which
    /// never belong to the BMS protocol.
    pub fn receive(&mut self) -> Result<Option<RawFrame>> {
        let frame = self.socket.read_frame()?;
        match frame {
            CanFrame::Data(data) if !data.is_extended() => {
                self.sequence += 1;
                let raw = RawFrame::new(data.raw_id(), data.data(), self.sequence)?;
                log::trace!("receive: {raw:?}");
                Ok(Some(raw))
            }
            CanFrame::Data(data) => {
                log::trace!("Skipping extended frame 0x{:08X}", data.raw_id());
                Ok(None)
            }
            CanFrame::Remote(remote) => {
                log::trace!("Skipping remote frame 0x{:03X}", remote.raw_id());
                Ok(None)
            }
            CanFrame::Error(error) => {
                log::debug!("CAN error frame received: {}", socketcan::CanError::from(error));
                Ok(None)
            }
        }
    }

    pub fn send(&self, frame: &RawFrame) -> Result<()> {
        let id = u16::try_from(frame.identifier())
            .ok()
            .and_then(StandardId::new)
            .ok_or(Error::OutOfRange)?;
        let can_frame =
            CanFrame::new(id, frame.payload()).ok_or(Error::PayloadLength(frame.payload().len()))?;
        log::trace!("send: {frame:?}");
        self.socket.write_frame(&can_frame)?;
        Ok(())
    }
}
