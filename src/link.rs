//! Link controller.
//!
//! Interface detection and lane training, interface resets, clock and
//! power sequencing, and the dormant-state excursion used to switch
//! the link into speed range B.

use crate::engine::{Command, LinkFlags, Uhs2Controller};
use crate::error::{Result, Uhs2Error};
use crate::io::RegisterBus;
use crate::packet::Uhs2Packet;
use crate::regs::*;
use crate::wire::*;

/// Settle time between power-on and the first presence sample
const DETECT_SETTLE_US: u32 = 200;

/// Interface detect window
const IF_DETECT_TIMEOUT_US: u32 = 100_000;

/// Lane synchronization window
const LANE_SYNC_TIMEOUT_US: u32 = 150_000;

/// Dormant entry window
const DORMANT_TIMEOUT_US: u32 = 100_000;

/// Internal clock stabilization window
const CLOCK_STABLE_TIMEOUT_US: u32 = 20_000;

/// Software reset self-clear window
const RESET_TIMEOUT_US: u32 = 100_000;

/// Supply stabilization delay after each power rail change
const POWER_DELAY_US: u32 = 5_000;

/// Link quiesce time between clock-off and clock-on in dormant
const DORMANT_CLOCK_GAP_US: u32 = 5_000;

/// Config-complete poll attempts, 1 ms apart
const CFG_COMPLETE_ATTEMPTS: u32 = 100;

impl<B: RegisterBus> Uhs2Controller<B> {
    /// Replace the enabled/signalled normal interrupt set.
    pub(crate) fn clear_set_irqs(&mut self, clear: u32, set: u32) {
        let mut ier = self.bus.read32(SDHCI_INT_ENABLE);
        ier &= !clear;
        ier |= set;
        self.bus.write32(SDHCI_INT_ENABLE, ier);
        self.bus.write32(SDHCI_SIGNAL_ENABLE, ier);
    }

    /// Reset UHS-II interface circuits and wait for the bit to
    /// self-clear. On a stuck reset the bit is forced clear so the
    /// register block stays usable for diagnostics.
    pub fn uhs2_reset(&mut self, mask: u16) -> Result<()> {
        self.bus.write16(SDHCI_UHS2_SW_RESET, mask);
        if mask & SDHCI_UHS2_SW_RESET_FULL != 0 {
            self.clock_hz = 0;
        }
        let done = self
            .bus
            .poll16(SDHCI_UHS2_SW_RESET, 1000, RESET_TIMEOUT_US, |v| {
                v & mask == 0
            });
        if done.is_err() {
            log::error!("UHS-II reset {:#06x} never completed", mask);
            self.dump_regs();
            self.bus.write16(SDHCI_UHS2_SW_RESET, 0);
            return Err(Uhs2Error::ResetFailed);
        }
        Ok(())
    }

    /// Wait for an attached UHS-II device and synchronized lanes.
    ///
    /// Error interrupts are unmasked between the two waits so lane
    /// training failures surface through the classifier.
    pub fn detect_interface(&mut self) -> Result<()> {
        self.bus.udelay(DETECT_SETTLE_US);
        let detected = self
            .bus
            .poll32(SDHCI_PRESENT_STATE, 100, IF_DETECT_TIMEOUT_US, |v| {
                v & SDHCI_UHS2_IF_DETECT != 0
            });
        if detected.is_err() {
            log::warn!("no UHS-II interface detected");
            self.dump_regs();
            return Err(Uhs2Error::LinkNotFound);
        }

        self.bus
            .write32(SDHCI_UHS2_ERR_INT_STATUS_EN, SDHCI_UHS2_ERR_ALL_MASK);
        self.bus
            .write32(SDHCI_UHS2_ERR_INT_SIG_EN, SDHCI_UHS2_ERR_ALL_MASK);

        let synced = self
            .bus
            .poll32(SDHCI_PRESENT_STATE, 100, LANE_SYNC_TIMEOUT_US, |v| {
                v & SDHCI_UHS2_LANE_SYNC != 0
            });
        if synced.is_err() {
            log::warn!("UHS-II lanes never synchronized");
            self.dump_regs();
            return Err(Uhs2Error::LinkNotFound);
        }
        log::debug!("UHS-II link detected and synchronized");
        Ok(())
    }

    /// Bring the PHY up: detect the link, capture host capabilities,
    /// reset the command circuits and rearm the interrupt set.
    pub fn phy_init(&mut self) -> Result<()> {
        self.detect_interface()?;
        let caps = self.read_host_caps()?;
        self.host_caps = Some(caps);
        self.uhs2_reset(SDHCI_UHS2_SW_RESET_SD)?;
        self.clear_set_irqs(
            SDHCI_INT_ALL_MASK,
            SDHCI_INT_RESPONSE | SDHCI_INT_DATA_END | SDHCI_INT_CARD_INT | SDHCI_INT_ERROR,
        );
        Ok(())
    }

    pub(crate) fn enable_clock(&mut self) -> Result<()> {
        let clk = self.bus.read16(SDHCI_CLOCK_CONTROL) | SDHCI_CLOCK_INT_EN;
        self.bus.write16(SDHCI_CLOCK_CONTROL, clk);
        let stable = self
            .bus
            .poll16(SDHCI_CLOCK_CONTROL, 100, CLOCK_STABLE_TIMEOUT_US, |v| {
                v & SDHCI_CLOCK_INT_STABLE != 0
            });
        if stable.is_err() {
            log::error!("internal clock never stabilized");
            self.dump_regs();
            return Err(Uhs2Error::Timeout);
        }
        let clk = self.bus.read16(SDHCI_CLOCK_CONTROL) | SDHCI_CLOCK_CARD_EN;
        self.bus.write16(SDHCI_CLOCK_CONTROL, clk);
        Ok(())
    }

    pub(crate) fn disable_clock(&mut self) {
        let clk = self.bus.read16(SDHCI_CLOCK_CONTROL) & !SDHCI_CLOCK_CARD_EN;
        self.bus.write16(SDHCI_CLOCK_CONTROL, clk);
    }

    /// Power both supply rails, select UHS-II mode and start the bus
    /// clock at `clock_hz`.
    pub fn power_up(&mut self, clock_hz: u32) -> Result<()> {
        let ctrl2 = (self.bus.read16(SDHCI_HOST_CONTROL2) & !SDHCI_CTRL_UHS_MASK)
            | SDHCI_CTRL_UHS2
            | SDHCI_CTRL_UHS2_ENABLE;
        self.bus.write16(SDHCI_HOST_CONTROL2, ctrl2);

        self.bus
            .write8(SDHCI_POWER_CONTROL, SDHCI_POWER_180 | SDHCI_POWER_ON);
        self.bus.udelay(POWER_DELAY_US);
        self.bus.write8(
            SDHCI_POWER_CONTROL,
            SDHCI_POWER_180 | SDHCI_POWER_ON | SDHCI_VDD2_POWER_ON,
        );
        self.bus.udelay(POWER_DELAY_US);

        self.enable_clock()?;
        self.clock_hz = clock_hz;
        self.power_on = true;
        self.set_timer_ctrl();
        Ok(())
    }

    /// Drop clock, power and mode selection; forgets link state.
    pub fn power_off(&mut self) {
        self.bus.write16(SDHCI_CLOCK_CONTROL, 0);
        self.bus.write8(SDHCI_POWER_CONTROL, 0);
        let ctrl2 =
            self.bus.read16(SDHCI_HOST_CONTROL2) & !(SDHCI_CTRL_UHS_MASK | SDHCI_CTRL_UHS2_ENABLE);
        self.bus.write16(SDHCI_HOST_CONTROL2, ctrl2);
        self.power_on = false;
        self.clock_hz = 0;
        self.flags = LinkFlags::empty();
    }

    /// Wait for the PHY to report Dormant.
    pub(crate) fn check_dormant(&mut self) -> Result<()> {
        let dormant = self
            .bus
            .poll32(SDHCI_PRESENT_STATE, 100, DORMANT_TIMEOUT_US, |v| {
                v & SDHCI_UHS2_IN_DORMANT_STATE != 0
            });
        if dormant.is_err() {
            log::error!("link never entered dormant state");
            self.dump_regs();
            return Err(Uhs2Error::Timeout);
        }
        Ok(())
    }

    /// Take the link through Dormant and bring it back up.
    ///
    /// Card interrupts stay masked for the whole excursion. The PHY is
    /// re-trained before control returns, so the link comes back in
    /// whatever speed range the settings registers now select.
    pub fn go_dormant(&mut self) -> Result<()> {
        let node_id = self.node_id();
        self.clear_set_irqs(SDHCI_INT_CARD_INT, 0);

        let header = make_header(true, UHS2_PACKET_TYPE_CCMD, node_id);
        let arg = make_native_arg(
            UHS2_DEV_CMD_GO_DORMANT_STATE,
            UHS2_NATIVE_CMD_WRITE,
            UHS2_NATIVE_CMD_PLEN_4B,
        );
        // Plain dormant entry, no hibernate
        let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, &[0], 4)?, 0);
        self.execute(&mut cmd)?;

        self.check_dormant()?;
        self.disable_clock();
        self.bus.udelay(DORMANT_CLOCK_GAP_US);
        self.enable_clock()?;
        self.clear_set_irqs(0, SDHCI_INT_CARD_INT);
        self.phy_init()
    }

    /// Select speed range B in the host PHY settings register.
    pub(crate) fn set_host_speed_b(&mut self) {
        let set_ptr = self.bus.read16(SDHCI_UHS2_SETTINGS_PTR);
        let phy = self.bus.read32(set_ptr + UHS2_HS_PHY_SET)
            | (UHS2_DEV_CONFIG_PHY_SET_SPEED_B << UHS2_HS_PHY_RANGE_POS);
        self.bus.write32(set_ptr + UHS2_HS_PHY_SET, phy);
    }

    /// Re-read the device's GEN_SET register until the configuration
    /// complete bit reads back set.
    pub(crate) fn poll_config_complete(&mut self) -> Result<()> {
        let node_id = self.node_id();
        for _ in 0..CFG_COMPLETE_ATTEMPTS {
            let header = make_header(true, UHS2_PACKET_TYPE_CCMD, node_id);
            let arg = make_native_arg(
                UHS2_DEV_CONFIG_GEN_SET,
                UHS2_NATIVE_CMD_READ,
                UHS2_NATIVE_CMD_PLEN_8B,
            );
            let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, &[], 0)?, 0);
            self.execute(&mut cmd)?;
            if cmd.resp[1] & UHS2_DEV_CONFIG_GEN_SET_CFG_COMPLETE != 0 {
                return Ok(());
            }
            self.bus.udelay(1000);
        }
        log::error!("device never confirmed its configuration");
        Err(Uhs2Error::Timeout)
    }

    /// Switch the link to speed range B via a dormant excursion and
    /// wait for the device to confirm the new configuration.
    pub fn change_speed(&mut self) -> Result<()> {
        self.set_host_speed_b();
        self.go_dormant()?;
        self.poll_config_complete()
    }
}
