//! The three-phase Bulk-Only Transport state machine.
//!
//! Per command: `SendCommand -> {NoData | SendData | ReceiveData} ->
//! ReceiveStatus`, with the BOT error recovery procedure (mass storage
//! reset plus clearing both endpoint halts) reachable from every step.

use tracing::{debug, warn};

use super::UsbTransport;
use super::cbw::{
    CBW_SIZE, CSW_SIZE, CommandBlockWrapper, CommandStatusWrapper, CswStatus, Direction,
    MAX_CDB_SIZE, next_tag,
};
use crate::error::{Error, Result};

/// Capability the engine requires of a command: produce a command block and
/// describe its data phase. The SCSI command set implements this; the engine
/// never needs to know which command it is driving.
pub trait BotCommand {
    /// The encoded command block, zero-padded, plus its valid length.
    fn command_block(&self) -> ([u8; MAX_CDB_SIZE], u8);
    /// Direction of the data phase.
    fn direction(&self) -> Direction;
    /// Bytes expected to move in the data phase, zero for none.
    fn transfer_length(&self) -> u32;
}

/// The caller-side buffer for the data phase. Must agree with the command's
/// declared direction; a mismatch is a programming error, not a device
/// error.
pub enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Drives the bulk-only transport over one claimed pipe, for one logical
/// unit. Commands are strictly serialized: each one completes all three
/// phases before the next is issued, so tag order equals device execution
/// order.
pub struct BulkOnlyTransport<T: UsbTransport> {
    transport: T,
    lun: u8,
}

impl<T: UsbTransport> BulkOnlyTransport<T> {
    pub fn new(transport: T, lun: u8) -> Self {
        Self { transport, lun }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Executes one command through all three phases and returns the data
    /// residue the device reported.
    ///
    /// A short data phase is not an error; it shows up in the residue. A tag
    /// or signature mismatch in the status phase means the pipe is
    /// desynchronized and surfaces as [`Error::Protocol`] without any
    /// command-level retry. A phase error triggers the reset recovery before
    /// returning [`Error::PhaseError`].
    pub async fn execute(
        &mut self,
        command: &impl BotCommand,
        data: DataPhase<'_>,
    ) -> Result<u32> {
        let transfer_length = command.transfer_length();
        match (&data, command.direction()) {
            (DataPhase::None, Direction::None) => {}
            (DataPhase::In(buf), Direction::In) if buf.len() as u32 >= transfer_length => {}
            (DataPhase::Out(buf), Direction::Out) if buf.len() as u32 == transfer_length => {}
            _ => {
                return Err(Error::InvalidArgument(
                    "data phase buffer does not match the command's declared transfer",
                ));
            }
        }

        let (block, cb_length) = command.command_block();
        let tag = next_tag();
        let cbw = CommandBlockWrapper::new(
            tag,
            transfer_length,
            command.direction(),
            self.lun,
            block,
            cb_length,
        )?;

        debug!(tag, transfer_length, "command phase");
        match self.transport.bulk_out(cbw.as_bytes()).await {
            Ok(n) if n == CBW_SIZE => {}
            Ok(_) => {
                self.recover().await;
                return Err(Error::Transfer("cbw was not sent in full".into()));
            }
            Err(e) => {
                self.recover_after(&e).await;
                return Err(e);
            }
        }

        match data {
            DataPhase::None => {}
            DataPhase::In(buf) => {
                let wanted = transfer_length as usize;
                match Self::drain_in(&mut self.transport, &mut buf[..wanted]).await {
                    Ok(got) => debug!(tag, got, wanted, "data phase (in) done"),
                    Err(e) => {
                        self.recover_after(&e).await;
                        return Err(e);
                    }
                }
            }
            DataPhase::Out(buf) => match self.transport.bulk_out(buf).await {
                Ok(_) => debug!(tag, len = buf.len(), "data phase (out) done"),
                Err(e) => {
                    self.recover_after(&e).await;
                    return Err(e);
                }
            },
        }

        let mut csw_buf = [0u8; CSW_SIZE];
        let got = match Self::drain_in(&mut self.transport, &mut csw_buf).await {
            Ok(got) => got,
            Err(e) => {
                self.recover_after(&e).await;
                return Err(e);
            }
        };
        let csw = CommandStatusWrapper::parse(&csw_buf[..got])?;
        if csw.tag != tag {
            // The device answered some other command. The pipe can no longer
            // be trusted; the whole session is failed, not this command.
            return Err(Error::Protocol {
                what: "csw tag",
                expected: tag,
                actual: csw.tag,
            });
        }

        match csw.status {
            CswStatus::Passed => Ok(csw.data_residue),
            CswStatus::Failed => {
                debug!(tag, residue = csw.data_residue, "device failed command");
                Err(Error::CommandFailed)
            }
            CswStatus::PhaseError => {
                warn!(tag, "phase error, running bulk-only reset recovery");
                self.recover().await;
                Err(Error::PhaseError)
            }
        }
    }

    /// Reads from the IN endpoint until the buffer is full or the device
    /// stops sending.
    async fn drain_in(transport: &mut T, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = transport.bulk_in(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn recover_after(&mut self, cause: &Error) {
        warn!(error = %cause, "transfer aborted, running bulk-only reset recovery");
        self.recover().await;
    }

    /// The reset recovery sequence from BOT section 5.3.4: mass storage
    /// reset, then clear the halt condition on both bulk endpoints.
    /// Secondary failures here are logged and dropped; the original error is
    /// the one the caller needs.
    async fn recover(&mut self) {
        if let Err(e) = self.transport.mass_storage_reset().await {
            warn!(error = %e, "mass storage reset failed");
        }
        if let Err(e) = self.transport.clear_halt_in().await {
            warn!(error = %e, "clearing IN halt failed");
        }
        if let Err(e) = self.transport.clear_halt_out().await {
            warn!(error = %e, "clearing OUT halt failed");
        }
    }
}
