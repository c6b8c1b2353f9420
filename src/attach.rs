//! Attach orchestration.
//!
//! Runs the full bring-up: power and PHY, DEVICE_INIT with power-group
//! arbitration, ENUMERATE, capability exchange, optional speed-range
//! switch, and finally the legacy SD identification sequence carried
//! over SD-transparent packets.

use crate::engine::{CmdFlags, Command, DataTransfer, LinkFlags, Uhs2Controller};
use crate::error::{Result, Uhs2Error};
use crate::io::RegisterBus;
use crate::packet::{self, Uhs2Packet};
use crate::wire::*;

/// Initialization clock rates, tried highest first
pub const ATTACH_FREQS_HZ: [u32; 2] = [52_000_000, 26_000_000];

/// DEVICE_INIT attempts before giving up on power-group arbitration
const DEV_INIT_ATTEMPTS: u32 = 30;

/// ACMD41 polls before declaring the card stuck in power-up
const OCR_POLL_ATTEMPTS: u32 = 100;

/// ACMD41 poll spacing
const OCR_POLL_DELAY_US: u32 = 10_000;

/// Settle time after power-off before a hard reset re-attaches
const HARD_RESET_SETTLE_US: u32 = 1_000;

/// Identification data collected from the card during attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardIdent {
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub scr: [u32; 2],
    pub rca: u16,
    pub ocr: u32,
}

/// CMD6 argument for function `value` in 1-based `group`.
fn switch_arg(set: bool, group: u32, value: u32) -> u32 {
    let shift = (group - 1) * 4;
    let mut arg = (0x00FF_FFFF & !(0xF << shift)) | (value << shift);
    if set {
        arg |= SD_SWITCH_SET;
    }
    arg
}

impl<B: RegisterBus> Uhs2Controller<B> {
    /// Attach the UHS-II device behind this controller.
    ///
    /// Tries each initialization frequency in turn, powering the
    /// interface down between failed attempts.
    pub fn attach(&mut self) -> Result<()> {
        if !self.bus.card_present() {
            return Err(Uhs2Error::NoCard);
        }
        let mut last = Uhs2Error::NotSupported;
        for &freq in &ATTACH_FREQS_HZ {
            log::info!("UHS-II attach attempt at {} MHz", freq / 1_000_000);
            match self.try_attach(freq) {
                Ok(()) => {
                    log::info!("UHS-II attach complete, node {}", self.node_id());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("attach at {} MHz failed: {:?}", freq / 1_000_000, e);
                    last = e;
                    self.power_off();
                }
            }
        }
        Err(last)
    }

    fn try_attach(&mut self, freq: u32) -> Result<()> {
        self.power_up(freq)?;
        self.phy_init()?;
        self.dev_init()?;
        let node_id = self.enumerate()?;
        let config = self.read_card_config(node_id)?;
        self.card = Some(config);
        self.negotiate_config()?;
        if self.flags.contains(LinkFlags::SPEED_B) {
            self.change_speed()?;
        }
        self.flags |= LinkFlags::INITIALIZED;
        if let Err(e) = self.legacy_ident() {
            self.flags.remove(LinkFlags::INITIALIZED);
            return Err(e);
        }
        Ok(())
    }

    /// Power down and forget the attached device.
    pub fn detach(&mut self) {
        self.power_off();
        self.card = None;
        self.ident = None;
        log::info!("UHS-II device detached");
    }

    /// Power-cycle the interface and run the full attach again.
    pub fn hard_reset(&mut self) -> Result<()> {
        log::info!("UHS-II hard reset");
        self.detach();
        self.bus.udelay(HARD_RESET_SETTLE_US);
        self.attach()
    }

    /// DEVICE_INIT with power-group arbitration.
    ///
    /// Starts from group descriptor 0 and moves to the next group each
    /// time the device reports a collision with our group-allocated
    /// power, for at most [`DEV_INIT_ATTEMPTS`] rounds.
    pub(crate) fn dev_init(&mut self) -> Result<()> {
        let (dap, gap) = {
            let host = self.host_caps.as_ref().ok_or(Uhs2Error::SequenceError)?;
            (host.dap, host.gap)
        };
        let echo = (UHS2_DEV_CMD_DEVICE_INIT & 0xFF) as u8;
        let mut gd = 0u32;

        for _ in 0..DEV_INIT_ATTEMPTS {
            let payload = ((dap as u32) << UHS2_DEV_INIT_DAP_POS)
                | UHS2_DEV_INIT_COMPLETE_FLAG
                | ((gd & 0xF) << UHS2_DEV_INIT_GD_POS)
                | (gap as u32 & UHS2_DEV_INIT_GAP_MASK);
            let header = make_header(true, UHS2_PACKET_TYPE_CCMD, 0);
            let arg = make_native_arg(
                UHS2_DEV_CMD_DEVICE_INIT,
                UHS2_NATIVE_CMD_WRITE,
                UHS2_NATIVE_CMD_PLEN_4B,
            );
            let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, &[payload], 4)?, 6);
            self.execute(&mut cmd)?;

            if cmd.uhs2_resp.get(3) != Some(&echo) {
                log::error!("DEVICE_INIT response echo mismatch");
                return Err(Uhs2Error::SequenceError);
            }
            if cmd.uhs2_resp.get(5).is_some_and(|b| b & 0x8 != 0) {
                if let Some(host) = self.host_caps.as_mut() {
                    host.group_desc = gd as u8;
                }
                log::debug!("DEVICE_INIT complete, group descriptor {}", gd);
                return Ok(());
            }
            if cmd
                .uhs2_resp
                .get(4)
                .is_some_and(|b| (b & 0xF) as u32 == gap as u32 & UHS2_DEV_INIT_GAP_MASK)
            {
                // Collision on our power group; try the next one
                gd += 1;
            }
        }
        log::error!(
            "DEVICE_INIT never completed in {} attempts",
            DEV_INIT_ATTEMPTS
        );
        Err(Uhs2Error::Io)
    }

    /// Assign the device a node ID.
    pub(crate) fn enumerate(&mut self) -> Result<u8> {
        let payload = (0xFu32 << UHS2_DEV_ENUM_ID_F_POS) | (0x0 & UHS2_DEV_ENUM_ID_L_MASK);
        let header = make_header(true, UHS2_PACKET_TYPE_CCMD, 0);
        let arg = make_native_arg(
            UHS2_DEV_CMD_ENUMERATE,
            UHS2_NATIVE_CMD_WRITE,
            UHS2_NATIVE_CMD_PLEN_4B,
        );
        let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, &[payload], 4)?, 8);
        self.execute(&mut cmd)?;

        let echo = (UHS2_DEV_CMD_ENUMERATE & 0xFF) as u8;
        if cmd.uhs2_resp.get(3) != Some(&echo) {
            log::error!("ENUMERATE response echo mismatch");
            return Err(Uhs2Error::SequenceError);
        }
        let ids = cmd.uhs2_resp.get(4).copied().unwrap_or(0);
        let node_id = ids >> 4;
        log::info!("UHS-II device enumerated as node {}", node_id);
        Ok(node_id)
    }

    /// One SD-transparent command without data.
    fn sd_cmd(&mut self, opcode: u8, arg: u32, flags: CmdFlags, app: bool) -> Result<[u32; 4]> {
        let mut cmd = Command {
            opcode,
            arg,
            flags,
            init_tmode: true,
            ..Default::default()
        };
        packet::prepare_sd_packet(&mut cmd, self.node_id(), false, app)?;
        self.execute(&mut cmd)?;
        Ok(cmd.resp)
    }

    /// One SD-transparent command with a single-block read.
    fn sd_cmd_read(
        &mut self,
        opcode: u8,
        arg: u32,
        flags: CmdFlags,
        app: bool,
        blksz: u16,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut cmd = Command {
            opcode,
            arg,
            flags: flags | CmdFlags::ADTC,
            init_tmode: true,
            data: Some(DataTransfer::read(1, blksz, buf)),
            ..Default::default()
        };
        packet::prepare_sd_packet(&mut cmd, self.node_id(), false, app)?;
        self.execute(&mut cmd)
    }

    /// Legacy SD identification over the transparent channel.
    ///
    /// Application commands carry the APP header bit instead of a
    /// CMD55 prefix. Collects OCR, CID, RCA, CSD and SCR, selects the
    /// card and raises the power limit to 1.80W when the card offers
    /// that function.
    pub(crate) fn legacy_ident(&mut self) -> Result<()> {
        self.sd_cmd(SD_CMD_GO_IDLE_STATE, 0, CmdFlags::NONE, false)?;

        let resp = self.sd_cmd(SD_CMD_SEND_IF_COND, SD_IF_COND_ARG, CmdFlags::R7, false)?;
        if resp[0] & 0xFF != SD_IF_COND_ARG & 0xFF {
            log::error!("CMD8 check pattern mismatch: {:#010x}", resp[0]);
            return Err(Uhs2Error::Io);
        }

        let ocr_arg = SD_OCR_VDD_RANGE | SD_OCR_CCS | SD_OCR_XPC;
        let mut ocr;
        let mut attempts = OCR_POLL_ATTEMPTS;
        loop {
            let resp = self.sd_cmd(SD_ACMD_SEND_OP_COND, ocr_arg, CmdFlags::R3, true)?;
            ocr = resp[0];
            if ocr & SD_OCR_BUSY != 0 {
                break;
            }
            attempts -= 1;
            if attempts == 0 {
                log::error!("card never finished power-up");
                return Err(Uhs2Error::Timeout);
            }
            self.bus.udelay(OCR_POLL_DELAY_US);
        }

        let cid = self.sd_cmd(SD_CMD_ALL_SEND_CID, 0, CmdFlags::R2, false)?;
        let resp = self.sd_cmd(SD_CMD_SEND_RELATIVE_ADDR, 0, CmdFlags::R6, false)?;
        let rca = (resp[0] >> 16) as u16;
        let csd = self.sd_cmd(SD_CMD_SEND_CSD, (rca as u32) << 16, CmdFlags::R2, false)?;
        self.sd_cmd(SD_CMD_SELECT_CARD, (rca as u32) << 16, CmdFlags::R1B, false)?;

        let mut scr_buf = [0u8; 8];
        self.sd_cmd_read(SD_ACMD_SEND_SCR, 0, CmdFlags::R1, true, 8, &mut scr_buf)?;
        let scr = [
            u32::from_be_bytes([scr_buf[0], scr_buf[1], scr_buf[2], scr_buf[3]]),
            u32::from_be_bytes([scr_buf[4], scr_buf[5], scr_buf[6], scr_buf[7]]),
        ];

        self.raise_power_limit()?;

        self.ident = Some(CardIdent {
            cid,
            csd,
            scr,
            rca,
            ocr,
        });
        log::info!("card identified: rca={:#06x} ocr={:#010x}", rca, ocr);
        Ok(())
    }

    /// Query and, when available, commit the 1.80W power limit.
    fn raise_power_limit(&mut self) -> Result<()> {
        let mut status = [0u8; 64];
        self.sd_cmd_read(
            SD_CMD_SWITCH_FUNC,
            switch_arg(false, SD_SWITCH_GRP_PWR_LIMIT, SD_SWITCH_PWR_LIMIT_1_80W),
            CmdFlags::R1,
            false,
            64,
            &mut status,
        )?;
        // Function group 4 result nibble
        if (status[15] >> 4) as u32 != SD_SWITCH_PWR_LIMIT_1_80W {
            log::debug!("card does not offer the 1.80W power limit");
            return Ok(());
        }
        self.sd_cmd_read(
            SD_CMD_SWITCH_FUNC,
            switch_arg(true, SD_SWITCH_GRP_PWR_LIMIT, SD_SWITCH_PWR_LIMIT_1_80W),
            CmdFlags::R1,
            false,
            64,
            &mut status,
        )?;
        if (status[15] >> 4) as u32 != SD_SWITCH_PWR_LIMIT_1_80W {
            log::warn!("power limit switch not committed by the card");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::HostCapabilities;
    use crate::mock::MockBus;

    fn controller() -> Uhs2Controller<MockBus> {
        Uhs2Controller::new(MockBus::new())
    }

    fn with_host_caps(ctrl: &mut Uhs2Controller<MockBus>) {
        ctrl.host_caps = Some(HostCapabilities {
            dap: 1,
            gap: 1,
            ..Default::default()
        });
    }

    #[test]
    fn dev_init_gives_up_after_thirty_attempts() {
        let mut ctrl = controller();
        with_host_caps(&mut ctrl);
        // Device reports a power-group collision on every attempt
        ctrl.bus.dev.init_accept_attempt = None;
        assert_eq!(ctrl.dev_init(), Err(Uhs2Error::Io));
        assert_eq!(ctrl.bus.dev.init_seen, 30);
    }

    #[test]
    fn dev_init_walks_group_descriptors_on_collision() {
        let mut ctrl = controller();
        with_host_caps(&mut ctrl);
        ctrl.bus.dev.init_accept_attempt = Some(5);
        assert_eq!(ctrl.dev_init(), Ok(()));
        assert_eq!(ctrl.host_caps.as_ref().unwrap().group_desc, 4);

        // Each rejected round advanced the group descriptor
        let gds: Vec<u32> = ctrl
            .bus
            .dev
            .history
            .iter()
            .map(|p| (p.payload[0] >> UHS2_DEV_INIT_GD_POS) & 0xF)
            .collect();
        assert_eq!(gds, vec![0, 1, 2, 3, 4]);
        // Every attempt carried the complete flag
        assert!(
            ctrl.bus
                .dev
                .history
                .iter()
                .all(|p| p.payload[0] & UHS2_DEV_INIT_COMPLETE_FLAG != 0)
        );
    }

    #[test]
    fn enumerate_reads_assigned_node() {
        let mut ctrl = controller();
        ctrl.bus.dev.node_id = 3;
        assert_eq!(ctrl.enumerate(), Ok(3));
    }

    #[test]
    fn attach_without_card_fails_fast() {
        let mut ctrl = controller();
        ctrl.bus.present = false;
        assert_eq!(ctrl.attach(), Err(Uhs2Error::NoCard));
    }

    #[test]
    fn attach_brings_up_full_stack() {
        let mut ctrl = controller();
        assert_eq!(ctrl.attach(), Ok(()));
        assert!(ctrl.is_initialized());
        assert_eq!(ctrl.node_id(), 1);

        let card = ctrl.card_config().unwrap();
        assert_eq!(card.maxblk_len_set, 512);
        assert_eq!(card.n_fcu_set, 256);
        assert_eq!(card.max_retry_set, 3);

        // Host PHY advertises range B: attach crossed dormant once
        assert_eq!(ctrl.bus.dev.dormant_entries, 1);

        let ident = ctrl.ident().unwrap();
        assert_eq!(ident.rca, 0x0001);
        assert_ne!(ident.ocr & SD_OCR_BUSY, 0);
        assert_ne!(ident.cid[0], 0);
        assert_ne!(ident.scr[0], 0);
    }

    #[test]
    fn attach_with_range_a_host_stays_in_range_a() {
        let mut ctrl = controller();
        // Host PHY advertises range A only
        let ptr = ctrl.bus.read16(crate::regs::SDHCI_UHS2_HOST_CAPS_PTR);
        ctrl.bus.write32(ptr + crate::regs::UHS2_HC_PHY_CAPS, 0);
        assert_eq!(ctrl.attach(), Ok(()));
        assert!(ctrl.is_initialized());
        // No speed switch, so the link never crossed dormant
        assert_eq!(ctrl.bus.dev.dormant_entries, 0);
        let card = ctrl.card_config().unwrap();
        assert_eq!(
            card.speed_range_set as u32,
            UHS2_DEV_CONFIG_PHY_SET_SPEED_A
        );
        assert_eq!(card.n_fcu_set, 256);
        assert_eq!(card.max_retry_set, 3);
    }

    #[test]
    fn attach_falls_back_to_lower_frequency() {
        let mut ctrl = controller();
        // First DEVICE_INIT round never completes; the retry at the
        // lower frequency succeeds.
        ctrl.bus.dev.init_accept_attempt = Some(31);
        assert_eq!(ctrl.attach(), Ok(()));
        assert!(ctrl.is_initialized());
        assert!(ctrl.bus.dev.init_seen > 30);
    }

    #[test]
    fn hard_reset_runs_the_full_bring_up_again() {
        let mut ctrl = controller();
        ctrl.attach().unwrap();
        let first = ctrl.ident().copied();
        assert_eq!(ctrl.hard_reset(), Ok(()));
        assert!(ctrl.is_initialized());
        // Both attaches switched to range B across dormant
        assert_eq!(ctrl.bus.dev.dormant_entries, 2);
        assert_eq!(ctrl.ident().copied(), first);
        assert!(ctrl.bus.dev.init_seen >= 2);
    }

    #[test]
    fn detach_powers_off_and_clears_state() {
        let mut ctrl = controller();
        ctrl.attach().unwrap();
        ctrl.detach();
        assert!(!ctrl.is_initialized());
        assert!(ctrl.ident().is_none());
        assert!(ctrl.card_config().is_none());
        assert_eq!(ctrl.bus.read8(crate::regs::SDHCI_POWER_CONTROL), 0);
    }

    #[test]
    fn switch_arg_layout() {
        // Check-mode query for 1.80W leaves other groups untouched
        assert_eq!(switch_arg(false, 4, 0x4), 0x00FF_4FFF);
        assert_eq!(switch_arg(true, 4, 0x4), 0x80FF_4FFF);
    }
}
