//! Capability decode and link configuration negotiation.
//!
//! Reads host capabilities out of the controller register block and
//! device capabilities over CCMD config reads, then writes the
//! negotiated settings to both ends of the link.

use crate::engine::{Command, LinkFlags, Uhs2Controller};
use crate::error::{Result, Uhs2Error};
use crate::io::RegisterBus;
use crate::packet::Uhs2Packet;
use crate::regs::*;
use crate::wire::*;

/// Fixed retry count handed to the device transport layer
const MAX_RETRY_COUNT: u8 = 3;

/// Minimum inter-packet data gap in full-duplex operation
const MIN_DATA_GAP_FD: u8 = 3;

/// Minimum inter-packet data gap in 2L-HD operation
const MIN_DATA_GAP_HD: u8 = 1;

/// Host-side UHS-II capabilities, decoded from the capability
/// registers behind the host capabilities pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub dap: u8,
    pub gap: u8,
    pub n_lanes: u8,
    pub addr64: bool,
    pub card_type: u8,
    pub phy_rev: u8,
    pub speed_range: u8,
    pub n_lss_sync: u32,
    pub n_lss_dir: u32,
    pub link_rev: u8,
    pub n_fcu: u16,
    pub host_type: u8,
    pub maxblk_len: u16,
    pub n_data_gap: u8,
    /// Power group descriptor assigned during DEVICE_INIT
    pub group_desc: u8,
}

/// Device capabilities and the settings negotiated onto the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardConfig {
    pub node_id: u8,
    pub n_lanes: u8,
    pub dadr_len: u8,
    pub app_type: u8,
    pub phy_minor_rev: u8,
    pub phy_major_rev: u8,
    pub can_hibernate: bool,
    pub n_lss_sync: u32,
    pub n_lss_dir: u32,
    pub link_minor_rev: u8,
    pub link_major_rev: u8,
    pub n_fcu: u16,
    pub dev_type: u8,
    pub maxblk_len: u16,
    pub n_data_gap: u8,
    // Negotiated values
    pub n_lanes_set: u8,
    pub speed_range_set: u8,
    pub n_lss_sync_set: u8,
    pub n_lss_dir_set: u8,
    pub n_fcu_set: u16,
    pub maxblk_len_set: u16,
    pub n_data_gap_set: u8,
    pub max_retry_set: u8,
}

/// N_LSS_SYN decode: zero encodes 16, scaled by the sync prescaler.
fn decode_n_lss_sync(raw: u32) -> u32 {
    let n = if raw == 0 { 16 } else { raw };
    n << 2
}

/// N_LSS_DIR decode: zero encodes 16, scaled by the dir prescaler.
fn decode_n_lss_dir(raw: u32) -> u32 {
    let n = if raw == 0 { 16 } else { raw };
    n << 3
}

/// N_FCU decode: zero encodes 256.
fn decode_n_fcu(raw: u32) -> u16 {
    if raw == 0 { 256 } else { raw as u16 }
}

impl<B: RegisterBus> Uhs2Controller<B> {
    /// Decode the host capability registers.
    pub(crate) fn read_host_caps(&mut self) -> Result<HostCapabilities> {
        let ptr = self.bus.read16(SDHCI_UHS2_HOST_CAPS_PTR);
        if !(SDHCI_UHS2_CAPS_PTR_MIN..=SDHCI_UHS2_CAPS_PTR_MAX).contains(&ptr) {
            log::error!("implausible host capabilities pointer {:#06x}", ptr);
            return Err(Uhs2Error::MalformedCaps);
        }

        let gen_caps = self.bus.read32(ptr + UHS2_HC_GEN_CAPS);
        let phy = self.bus.read32(ptr + UHS2_HC_PHY_CAPS);
        let tran = self.bus.read32(ptr + UHS2_HC_TRAN_CAPS);
        let tran1 = self.bus.read32(ptr + UHS2_HC_TRAN_CAPS1);

        let caps = HostCapabilities {
            dap: (gen_caps & UHS2_HC_GEN_DAP_MASK) as u8,
            gap: ((gen_caps >> UHS2_HC_GEN_GAP_POS) & UHS2_HC_GEN_GAP_MASK) as u8,
            n_lanes: ((gen_caps >> UHS2_HC_GEN_N_LANES_POS) & UHS2_HC_GEN_N_LANES_MASK) as u8,
            addr64: gen_caps & UHS2_HC_GEN_ADDR_64 != 0,
            card_type: ((gen_caps >> UHS2_HC_GEN_CARD_TYPE_POS) & UHS2_HC_GEN_CARD_TYPE_MASK)
                as u8,
            phy_rev: (phy & UHS2_HC_PHY_REV_MASK) as u8,
            speed_range: ((phy >> UHS2_HC_PHY_RANGE_POS) & UHS2_HC_PHY_RANGE_MASK) as u8,
            n_lss_sync: decode_n_lss_sync(
                (phy >> UHS2_HC_PHY_N_LSS_SYN_POS) & UHS2_HC_PHY_N_LSS_SYN_MASK,
            ),
            n_lss_dir: decode_n_lss_dir(
                (phy >> UHS2_HC_PHY_N_LSS_DIR_POS) & UHS2_HC_PHY_N_LSS_DIR_MASK,
            ),
            link_rev: (tran & UHS2_HC_TRAN_LINK_REV_MASK) as u8,
            n_fcu: decode_n_fcu((tran >> UHS2_HC_TRAN_N_FCU_POS) & UHS2_HC_TRAN_N_FCU_MASK),
            host_type: ((tran >> UHS2_HC_TRAN_HOST_TYPE_POS) & UHS2_HC_TRAN_HOST_TYPE_MASK) as u8,
            maxblk_len: ((tran >> UHS2_HC_TRAN_BLK_LEN_POS) & UHS2_HC_TRAN_BLK_LEN_MASK) as u16,
            n_data_gap: (tran1 & UHS2_HC_TRAN_N_DATA_GAP_MASK) as u8,
            group_desc: 0,
        };
        if caps.maxblk_len == 0 {
            log::error!("host capabilities report a zero block length");
            return Err(Uhs2Error::MalformedCaps);
        }
        log::debug!(
            "host caps: lanes={:#x} range={} n_fcu={} maxblk={}",
            caps.n_lanes,
            caps.speed_range,
            caps.n_fcu,
            caps.maxblk_len
        );
        Ok(caps)
    }

    /// CCMD read of one 8-byte device config register pair.
    fn config_read(&mut self, node_id: u8, ioadr: u16) -> Result<[u32; 2]> {
        let header = make_header(true, UHS2_PACKET_TYPE_CCMD, node_id);
        let arg = make_native_arg(ioadr, UHS2_NATIVE_CMD_READ, UHS2_NATIVE_CMD_PLEN_8B);
        let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, &[], 0)?, 0);
        self.execute(&mut cmd)?;
        Ok([cmd.resp[0], cmd.resp[1]])
    }

    /// CCMD write of one 8-byte device config register pair.
    fn config_write(
        &mut self,
        node_id: u8,
        ioadr: u16,
        payload: &[u32; 2],
        resp_len: usize,
    ) -> Result<Command<'static>> {
        let header = make_header(true, UHS2_PACKET_TYPE_CCMD, node_id);
        let arg = make_native_arg(ioadr, UHS2_NATIVE_CMD_WRITE, UHS2_NATIVE_CMD_PLEN_8B);
        let mut cmd = Command::native(Uhs2Packet::assemble(header, arg, payload, 8)?, resp_len);
        self.execute(&mut cmd)?;
        Ok(cmd)
    }

    /// Read and decode the device's capability registers.
    pub(crate) fn read_card_config(&mut self, node_id: u8) -> Result<CardConfig> {
        let gen_caps = self.config_read(node_id, UHS2_DEV_CONFIG_GEN_CAPS)?;
        let phy = self.config_read(node_id, UHS2_DEV_CONFIG_PHY_CAPS)?;
        let lt = self.config_read(node_id, UHS2_DEV_CONFIG_LINK_TRAN_CAPS)?;

        let config = CardConfig {
            node_id,
            n_lanes: ((gen_caps[0] >> UHS2_DEV_CONFIG_N_LANES_POS) & UHS2_DEV_CONFIG_N_LANES_MASK)
                as u8,
            dadr_len: ((gen_caps[0] >> UHS2_DEV_CONFIG_DADR_POS) & UHS2_DEV_CONFIG_DADR_MASK)
                as u8,
            app_type: ((gen_caps[0] >> UHS2_DEV_CONFIG_APP_POS) & UHS2_DEV_CONFIG_APP_MASK) as u8,
            phy_minor_rev: (phy[0] & UHS2_DEV_CONFIG_PHY_MINOR_MASK) as u8,
            phy_major_rev: ((phy[0] >> UHS2_DEV_CONFIG_PHY_MAJOR_POS)
                & UHS2_DEV_CONFIG_PHY_MAJOR_MASK) as u8,
            can_hibernate: (phy[0] >> UHS2_DEV_CONFIG_CAN_HIBER_POS)
                & UHS2_DEV_CONFIG_CAN_HIBER_MASK
                != 0,
            n_lss_sync: decode_n_lss_sync(phy[1] & UHS2_DEV_CONFIG_N_LSS_SYN_MASK),
            n_lss_dir: decode_n_lss_dir(
                (phy[1] >> UHS2_DEV_CONFIG_N_LSS_DIR_POS) & UHS2_DEV_CONFIG_N_LSS_DIR_MASK,
            ),
            link_minor_rev: (lt[0] & UHS2_DEV_CONFIG_LT_MINOR_MASK) as u8,
            link_major_rev: ((lt[0] >> UHS2_DEV_CONFIG_LT_MAJOR_POS)
                & UHS2_DEV_CONFIG_LT_MAJOR_MASK) as u8,
            n_fcu: decode_n_fcu((lt[0] >> UHS2_DEV_CONFIG_N_FCU_POS) & UHS2_DEV_CONFIG_N_FCU_MASK),
            dev_type: ((lt[0] >> UHS2_DEV_CONFIG_DEV_TYPE_POS) & UHS2_DEV_CONFIG_DEV_TYPE_MASK)
                as u8,
            maxblk_len: ((lt[0] >> UHS2_DEV_CONFIG_MAX_BLK_LEN_POS)
                & UHS2_DEV_CONFIG_MAX_BLK_LEN_MASK) as u16,
            n_data_gap: (lt[1] & UHS2_DEV_CONFIG_N_DATA_GAP_MASK) as u8,
            ..Default::default()
        };
        log::debug!(
            "card caps: node={} lanes={:#x} app={:#x} n_fcu={} maxblk={} gap={}",
            config.node_id,
            config.n_lanes,
            config.app_type,
            config.n_fcu,
            config.maxblk_len,
            config.n_data_gap
        );
        Ok(config)
    }

    /// Negotiate the link configuration and commit it to both ends.
    ///
    /// Writes the device settings registers over CCMDs (finishing with
    /// the config-complete flag), then mirrors the negotiated values
    /// into the host settings registers.
    pub fn negotiate_config(&mut self) -> Result<()> {
        let host = self.host_caps.take().ok_or(Uhs2Error::SequenceError)?;
        let mut card = self.card.take().ok_or(Uhs2Error::SequenceError)?;
        let node_id = card.node_id;

        // Engage 2L-HD only when both ends advertise it; half-duplex
        // operation permits the tighter inter-packet gap.
        card.n_lanes_set = UHS2_DEV_CONFIG_GEN_SET_2L_FD_HD as u8;
        let min_data_gap = if card.n_lanes as u32 == UHS2_DEV_CONFIG_2L_HD_FD
            && host.n_lanes as u32 == UHS2_DEV_CONFIG_2L_HD_FD
        {
            self.flags |= LinkFlags::HD_MODE;
            MIN_DATA_GAP_HD
        } else {
            self.flags.remove(LinkFlags::HD_MODE);
            MIN_DATA_GAP_FD
        };

        let payload = [
            (card.n_lanes_set as u32) << UHS2_DEV_CONFIG_GEN_SET_N_LANES_POS,
            0,
        ];
        self.config_write(node_id, UHS2_DEV_CONFIG_GEN_SET, &payload, 0)?;

        // Range B is selected whenever the host PHY can drive it; the
        // device confirms after the dormant excursion.
        card.speed_range_set = if host.speed_range as u32 == UHS2_DEV_CONFIG_PHY_SET_SPEED_B {
            self.flags |= LinkFlags::SPEED_B;
            UHS2_DEV_CONFIG_PHY_SET_SPEED_B as u8
        } else {
            self.flags.remove(LinkFlags::SPEED_B);
            UHS2_DEV_CONFIG_PHY_SET_SPEED_A as u8
        };
        card.n_lss_sync_set = ((card.n_lss_sync.max(host.n_lss_sync) >> 2) & 0xF) as u8;
        card.n_lss_dir_set = ((card.n_lss_dir.max(host.n_lss_dir) >> 3) & 0xF) as u8;
        let payload = [
            (card.speed_range_set as u32) << UHS2_DEV_CONFIG_PHY_SET_SPEED_POS,
            ((card.n_lss_dir_set as u32) << UHS2_DEV_CONFIG_N_LSS_DIR_POS)
                | card.n_lss_sync_set as u32,
        ];
        let cmd = self.config_write(node_id, UHS2_DEV_CONFIG_PHY_SET, &payload, 8)?;
        if cmd
            .uhs2_resp
            .get(2)
            .is_some_and(|b| b & UHS2_RES_NACK_MASK != 0)
        {
            log::error!("device rejected the PHY settings");
            return Err(Uhs2Error::Io);
        }

        card.maxblk_len_set = if card.app_type as u32 == UHS2_DEV_CONFIG_APP_SD_MEM {
            UHS2_DEV_CONFIG_LT_SET_MAX_BLK_LEN as u16
        } else {
            card.maxblk_len.min(host.maxblk_len)
        };
        card.n_fcu_set = card.n_fcu.min(host.n_fcu);
        card.n_data_gap_set = card.n_data_gap.max(min_data_gap);
        card.max_retry_set = MAX_RETRY_COUNT;
        let payload = [
            ((card.maxblk_len_set as u32) << UHS2_DEV_CONFIG_LT_SET_MAX_BLK_LEN_POS)
                | ((card.max_retry_set as u32) << UHS2_DEV_CONFIG_LT_SET_MAX_RETRY_POS)
                | ((card.n_fcu_set as u32 & UHS2_DEV_CONFIG_N_FCU_MASK)
                    << UHS2_DEV_CONFIG_LT_SET_N_FCU_POS),
            card.n_data_gap_set as u32,
        ];
        self.config_write(node_id, UHS2_DEV_CONFIG_LINK_TRAN_SET, &payload, 0)?;

        let payload = [0, UHS2_DEV_CONFIG_GEN_SET_CFG_COMPLETE];
        self.config_write(node_id, UHS2_DEV_CONFIG_GEN_SET, &payload, 5)?;

        self.apply_host_settings(&card);
        log::debug!(
            "negotiated: hd={} range={} n_fcu={} maxblk={} gap={}",
            self.flags.contains(LinkFlags::HD_MODE),
            card.speed_range_set,
            card.n_fcu_set,
            card.maxblk_len_set,
            card.n_data_gap_set
        );
        self.host_caps = Some(host);
        self.card = Some(card);
        Ok(())
    }

    /// Mirror the negotiated configuration into the host settings
    /// registers behind the settings pointer.
    fn apply_host_settings(&mut self, card: &CardConfig) {
        let set_ptr = self.bus.read16(SDHCI_UHS2_SETTINGS_PTR);
        self.bus.write32(
            set_ptr + UHS2_HS_GEN_SET,
            (card.n_lanes_set as u32) << UHS2_HS_GEN_N_LANES_POS,
        );
        self.bus.write32(
            set_ptr + UHS2_HS_PHY_SET,
            ((card.speed_range_set as u32) << UHS2_HS_PHY_RANGE_POS)
                | ((card.n_lss_sync_set as u32) << UHS2_HS_PHY_N_LSS_SYN_POS)
                | ((card.n_lss_dir_set as u32) << UHS2_HS_PHY_N_LSS_DIR_POS),
        );
        self.bus.write32(
            set_ptr + UHS2_HS_TRAN_SET,
            ((card.maxblk_len_set as u32) << UHS2_HS_TRAN_BLK_LEN_POS)
                | ((card.max_retry_set as u32) << UHS2_HS_TRAN_RETRY_CNT_POS)
                | ((card.n_fcu_set as u32 & UHS2_HC_TRAN_N_FCU_MASK) << UHS2_HS_TRAN_N_FCU_POS),
        );
        self.bus
            .write32(set_ptr + UHS2_HS_TRAN_SET1, card.n_data_gap_set as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    fn controller() -> Uhs2Controller<MockBus> {
        Uhs2Controller::new(MockBus::new())
    }

    #[test]
    fn host_caps_decode_applies_zero_rules() {
        let mut ctrl = controller();
        let caps = ctrl.read_host_caps().unwrap();
        // Mock host advertises zero N_LSS and N_FCU fields
        assert_eq!(caps.n_lss_sync, 16 << 2);
        assert_eq!(caps.n_lss_dir, 16 << 3);
        assert_eq!(caps.n_fcu, 256);
        assert_eq!(caps.maxblk_len, 512);
        assert_eq!(caps.speed_range, 1);
    }

    #[test]
    fn bogus_caps_pointer_is_rejected() {
        let mut ctrl = controller();
        ctrl.bus.write16(SDHCI_UHS2_HOST_CAPS_PTR, 0x0040);
        assert_eq!(ctrl.read_host_caps(), Err(Uhs2Error::MalformedCaps));
        ctrl.bus.write16(SDHCI_UHS2_HOST_CAPS_PTR, 0x0200);
        assert_eq!(ctrl.read_host_caps(), Err(Uhs2Error::MalformedCaps));
    }

    #[test]
    fn card_config_decode_applies_zero_rules() {
        let mut ctrl = controller();
        let config = ctrl.read_card_config(1).unwrap();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.n_lanes as u32, UHS2_DEV_CONFIG_2L_HD_FD);
        assert_eq!(config.app_type as u32, UHS2_DEV_CONFIG_APP_SD_MEM);
        assert_eq!(config.n_lss_sync, 16 << 2);
        assert_eq!(config.n_lss_dir, 16 << 3);
        assert_eq!(config.n_fcu, 256);
    }

    #[test]
    fn negotiation_picks_sd_memory_block_length_and_minima() {
        let mut ctrl = controller();
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        ctrl.negotiate_config().unwrap();

        let card = ctrl.card.unwrap();
        assert_eq!(card.maxblk_len_set, 512);
        assert_eq!(card.n_fcu_set, 256);
        assert_eq!(card.max_retry_set, 3);
        // Both ends are 2L capable: HD engaged, HD minimum gap applies
        assert!(ctrl.flags.contains(LinkFlags::HD_MODE));
        assert_eq!(card.n_data_gap_set, 1);
        assert!(ctrl.flags.contains(LinkFlags::SPEED_B));
    }

    #[test]
    fn negotiation_without_hd_uses_full_duplex_gap() {
        let mut ctrl = controller();
        // Host advertises a single lane
        let ptr = ctrl.bus.read16(SDHCI_UHS2_HOST_CAPS_PTR);
        let gen_caps = ctrl.bus.read32(ptr + UHS2_HC_GEN_CAPS);
        ctrl.bus.write32(
            ptr + UHS2_HC_GEN_CAPS,
            gen_caps & !(0x3F << UHS2_HC_GEN_N_LANES_POS),
        );
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        ctrl.negotiate_config().unwrap();

        let card = ctrl.card.unwrap();
        assert!(!ctrl.flags.contains(LinkFlags::HD_MODE));
        assert_eq!(card.n_data_gap_set, 3);
    }

    #[test]
    fn non_sd_memory_card_uses_min_block_length() {
        let mut ctrl = controller();
        // Clear the application type and shrink the card's block length
        ctrl.bus.dev.gen_caps[0] &= !(UHS2_DEV_CONFIG_APP_MASK << UHS2_DEV_CONFIG_APP_POS);
        ctrl.bus.dev.lt_caps[0] = (ctrl.bus.dev.lt_caps[0]
            & !(UHS2_DEV_CONFIG_MAX_BLK_LEN_MASK << UHS2_DEV_CONFIG_MAX_BLK_LEN_POS))
            | (128 << UHS2_DEV_CONFIG_MAX_BLK_LEN_POS);
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        ctrl.negotiate_config().unwrap();
        assert_eq!(ctrl.card.unwrap().maxblk_len_set, 128);
    }

    #[test]
    fn phy_settings_nack_fails_negotiation() {
        let mut ctrl = controller();
        ctrl.bus.dev.nack_phy_set = true;
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        assert_eq!(ctrl.negotiate_config(), Err(Uhs2Error::Io));
    }

    #[test]
    fn negotiation_mirrors_settings_to_host_registers() {
        let mut ctrl = controller();
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        ctrl.negotiate_config().unwrap();

        let set_ptr = ctrl.bus.read16(SDHCI_UHS2_SETTINGS_PTR);
        let tran = ctrl.bus.read32(set_ptr + UHS2_HS_TRAN_SET);
        assert_eq!((tran >> UHS2_HS_TRAN_BLK_LEN_POS) & 0xFFF, 512);
        assert_eq!((tran >> UHS2_HS_TRAN_RETRY_CNT_POS) & 0xF, 3);
        // 256 FCUs re-encode as zero
        assert_eq!((tran >> UHS2_HS_TRAN_N_FCU_POS) & 0xFF, 0);
        let tran1 = ctrl.bus.read32(set_ptr + UHS2_HS_TRAN_SET1);
        assert_eq!(tran1 & 0xFF, 1);
    }

    #[test]
    fn device_saw_config_complete_last() {
        let mut ctrl = controller();
        let host = ctrl.read_host_caps().unwrap();
        ctrl.host_caps = Some(host);
        let card = ctrl.read_card_config(1).unwrap();
        ctrl.card = Some(card);
        ctrl.negotiate_config().unwrap();

        let writes = &ctrl.bus.dev.writes;
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].0, UHS2_DEV_CONFIG_GEN_SET);
        assert_eq!(writes[1].0, UHS2_DEV_CONFIG_PHY_SET);
        assert_eq!(writes[2].0, UHS2_DEV_CONFIG_LINK_TRAN_SET);
        assert_eq!(writes[3].0, UHS2_DEV_CONFIG_GEN_SET);
        assert_eq!(writes[3].1[1], UHS2_DEV_CONFIG_GEN_SET_CFG_COMPLETE);
    }
}
