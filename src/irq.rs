//! Error-interrupt classification.
//!
//! Splits the UHS-II error interrupt status into a command-phase group
//! and a data-phase group, maps each to an error on the in-flight
//! command or transfer, and dumps the register block when an interrupt
//! arrives with nothing in flight to blame.

use crate::engine::{Command, Uhs2Controller};
use crate::error::Uhs2Error;
use crate::io::RegisterBus;
use crate::regs::*;

impl<B: RegisterBus> Uhs2Controller<B> {
    /// Interrupt-context entry point.
    ///
    /// Acknowledges and classifies pending UHS-II error interrupt
    /// sources; returns the normal interrupt bits consumed.
    pub fn handle_irq(&mut self, intmask: u32, cmd: Option<&mut Command<'_>>) -> u32 {
        if intmask & SDHCI_INT_ERROR == 0 {
            return 0;
        }
        let err_status = self.bus.read32(SDHCI_UHS2_ERR_INT_STATUS);
        self.bus.write32(
            SDHCI_UHS2_ERR_INT_STATUS,
            err_status & SDHCI_UHS2_ERR_ALL_MASK,
        );
        self.handle_error_irq(err_status, cmd);
        SDHCI_INT_ERROR
    }

    pub(crate) fn handle_error_irq(&mut self, err_status: u32, mut cmd: Option<&mut Command<'_>>) {
        log::debug!("UHS-II error interrupt status {:#010x}", err_status);

        if err_status & SDHCI_UHS2_ERR_CMD_MASK != 0 {
            let inflight = self.cmd_inflight;
            match cmd.as_deref_mut() {
                Some(c) if inflight => {
                    c.error = Some(if err_status & SDHCI_UHS2_ERR_RES_TIMEOUT != 0 {
                        Uhs2Error::Timeout
                    } else {
                        Uhs2Error::SequenceError
                    });
                }
                _ => {
                    log::error!(
                        "command error interrupt with no command in flight: {:#010x}",
                        err_status
                    );
                    self.dump_regs();
                    return;
                }
            }
        }

        if err_status & SDHCI_UHS2_ERR_DATA_MASK != 0 {
            if !self.data_inflight {
                log::error!(
                    "data error interrupt with no transfer in flight: {:#010x}",
                    err_status
                );
                self.dump_regs();
                return;
            }
            let Some(data) = cmd.as_deref_mut().and_then(|c| c.data.as_mut()) else {
                log::error!(
                    "data error interrupt with no transfer in flight: {:#010x}",
                    err_status
                );
                self.dump_regs();
                return;
            };
            if err_status & SDHCI_UHS2_ERR_DEADLOCK_TIMEOUT != 0 {
                log::error!("data transfer deadlock timeout");
                data.error = Some(Uhs2Error::DeadlockTimeout);
            } else if err_status & SDHCI_UHS2_ERR_ADMA != 0 {
                log::error!(
                    "ADMA error, status {:#04x}",
                    self.bus.read8(SDHCI_ADMA_ERROR)
                );
                data.error = Some(Uhs2Error::AdmaError);
            } else {
                data.error = Some(Uhs2Error::SequenceError);
            }
        }
    }

    /// Diagnostic register dump, debug level.
    pub fn dump_regs(&self) {
        log::debug!("=========== UHS-II REGISTER DUMP ===========");
        log::debug!(
            "Present:  {:#010x} | Int stat: {:#010x}",
            self.bus.read32(SDHCI_PRESENT_STATE),
            self.bus.read32(SDHCI_INT_STATUS)
        );
        log::debug!(
            "Int en:   {:#010x} | Sig en:   {:#010x}",
            self.bus.read32(SDHCI_INT_ENABLE),
            self.bus.read32(SDHCI_SIGNAL_ENABLE)
        );
        log::debug!(
            "Err stat: {:#010x} | Err en:   {:#010x}",
            self.bus.read32(SDHCI_UHS2_ERR_INT_STATUS),
            self.bus.read32(SDHCI_UHS2_ERR_INT_STATUS_EN)
        );
        log::debug!(
            "Command:  {:#06x}     | Trans md: {:#06x}",
            self.bus.read16(SDHCI_UHS2_COMMAND),
            self.bus.read16(SDHCI_UHS2_TRANS_MODE)
        );
        log::debug!(
            "Blk size: {:#010x} | Blk cnt:  {:#010x}",
            self.bus.read32(SDHCI_UHS2_BLOCK_SIZE),
            self.bus.read32(SDHCI_UHS2_BLOCK_COUNT)
        );
        log::debug!(
            "Timer:    {:#06x}     | SW reset: {:#06x}",
            self.bus.read16(SDHCI_UHS2_TIMER_CTRL),
            self.bus.read16(SDHCI_UHS2_SW_RESET)
        );
        log::debug!(
            "Caps ptr: {:#06x}     | Set ptr:  {:#06x}",
            self.bus.read16(SDHCI_UHS2_HOST_CAPS_PTR),
            self.bus.read16(SDHCI_UHS2_SETTINGS_PTR)
        );
        log::debug!("============================================");
    }
}
