//! Register-file bus double with a scripted device model.
//!
//! Backs the unit tests: a flat register file stands in for the host
//! controller, and writes to the UHS-II command register run a small
//! device model that parses the staged packet and synthesizes the
//! response, status bits and transfer data a real card would produce.

use core::cell::Cell;

use crate::io::RegisterBus;
use crate::regs::*;
use crate::wire::*;

/// A command packet as the device model saw it.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: u16,
    pub arg: u16,
    pub payload: [u32; 4],
}

/// Scripted behaviour of the attached device.
#[derive(Debug)]
pub struct DeviceModel {
    pub if_detect: bool,
    pub lane_sync: bool,
    pub dormant: bool,
    pub dormant_entries: u32,
    pub node_id: u8,
    /// Power group the device occupies; echoed on DEVICE_INIT rejects
    pub gap: u8,
    /// Accept DEVICE_INIT on this 1-based attempt; `None` never accepts
    pub init_accept_attempt: Option<u32>,
    pub init_seen: u32,
    pub gen_caps: [u32; 2],
    pub phy_caps: [u32; 2],
    pub lt_caps: [u32; 2],
    /// GEN_SET reads before the config-complete bit reads back set
    pub cfg_complete_after: u32,
    pub gen_set_reads: u32,
    /// Config register writes in arrival order
    pub writes: Vec<(u16, [u32; 2])>,
    pub nack_phy_set: bool,
    pub nack_all: bool,
    /// Error interrupt bits to raise instead of serving the next command
    pub fail_next: Option<u32>,
    pub acmd41_seen: u32,
    /// ACMD41 polls before the OCR busy bit reports ready
    pub ocr_ready_after: u32,
    pub history: Vec<ParsedPacket>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        DeviceModel {
            if_detect: true,
            lane_sync: true,
            dormant: false,
            dormant_entries: 0,
            node_id: 1,
            gap: 1,
            init_accept_attempt: Some(1),
            init_seen: 0,
            // 2L-HD/FD capable SD-memory card
            gen_caps: [
                (UHS2_DEV_CONFIG_2L_HD_FD << UHS2_DEV_CONFIG_N_LANES_POS)
                    | (UHS2_DEV_CONFIG_APP_SD_MEM << UHS2_DEV_CONFIG_APP_POS),
                0,
            ],
            // PHY major revision 1, zero-encoded N_LSS fields
            phy_caps: [1 << UHS2_DEV_CONFIG_PHY_MAJOR_POS, 0],
            // 512-byte blocks, zero-encoded N_FCU, one-gap transport
            lt_caps: [
                (512 << UHS2_DEV_CONFIG_MAX_BLK_LEN_POS)
                    | (1 << UHS2_DEV_CONFIG_DEV_TYPE_POS),
                1,
            ],
            cfg_complete_after: 1,
            gen_set_reads: 0,
            writes: Vec::new(),
            nack_phy_set: false,
            nack_all: false,
            fail_next: None,
            acmd41_seen: 0,
            ocr_ready_after: 2,
            history: Vec::new(),
        }
    }
}

/// Register-file implementation of [`RegisterBus`].
pub struct MockBus {
    regs: [u8; 0x200],
    pub present: bool,
    pub inhibit: bool,
    /// Report the card gone once this many delays have elapsed
    pub present_after_delays: Option<u64>,
    pub delay_calls: u64,
    pub delays_us: u64,
    pub present_state_reads: Cell<u32>,
    pub stuck_reset: bool,
    pub sd_resets: u32,
    pub last_cmd_reg: u16,
    pub dma_data: Vec<u8>,
    pub dma_written: Vec<u8>,
    pub dma_releases: u32,
    pub dev: DeviceModel,
}

impl MockBus {
    pub fn new() -> Self {
        let mut bus = MockBus {
            regs: [0; 0x200],
            present: true,
            inhibit: false,
            present_after_delays: None,
            delay_calls: 0,
            delays_us: 0,
            present_state_reads: Cell::new(0),
            stuck_reset: false,
            sd_resets: 0,
            last_cmd_reg: 0,
            dma_data: Vec::new(),
            dma_written: Vec::new(),
            dma_releases: 0,
            dev: DeviceModel::default(),
        };
        bus.put16(SDHCI_UHS2_HOST_CAPS_PTR, 0x100);
        bus.put16(SDHCI_UHS2_SETTINGS_PTR, 0x180);
        // Host: DAP/GAP 1, 2L-HD/FD lanes
        bus.put32(
            0x100 + UHS2_HC_GEN_CAPS,
            0x1 | (1 << UHS2_HC_GEN_GAP_POS)
                | (UHS2_DEV_CONFIG_2L_HD_FD << UHS2_HC_GEN_N_LANES_POS),
        );
        // Host PHY: speed range B, zero-encoded N_LSS fields
        bus.put32(0x100 + UHS2_HC_PHY_CAPS, 1 << UHS2_HC_PHY_RANGE_POS);
        // Host transport: 512-byte blocks, zero-encoded N_FCU
        bus.put32(
            0x100 + UHS2_HC_TRAN_CAPS,
            (512 << UHS2_HC_TRAN_BLK_LEN_POS) | (1 << UHS2_HC_TRAN_HOST_TYPE_POS),
        );
        bus.put32(0x100 + UHS2_HC_TRAN_CAPS1, 1);
        bus
    }

    fn get16(&self, offset: u16) -> u16 {
        let i = offset as usize;
        u16::from_le_bytes([self.regs[i], self.regs[i + 1]])
    }

    fn put16(&mut self, offset: u16, value: u16) {
        let i = offset as usize;
        self.regs[i..i + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn get32(&self, offset: u16) -> u32 {
        let i = offset as usize;
        u32::from_le_bytes([
            self.regs[i],
            self.regs[i + 1],
            self.regs[i + 2],
            self.regs[i + 3],
        ])
    }

    fn put32(&mut self, offset: u16, value: u32) {
        let i = offset as usize;
        self.regs[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Latch UHS-II error interrupt bits, as the controller would.
    pub fn raise_error(&mut self, bits: u32) {
        let cur = self.get32(SDHCI_UHS2_ERR_INT_STATUS);
        self.put32(SDHCI_UHS2_ERR_INT_STATUS, cur | bits);
    }

    fn raise_int(&mut self, bits: u32) {
        let cur = self.get32(SDHCI_INT_STATUS);
        self.put32(SDHCI_INT_STATUS, cur | bits);
    }

    fn put_resp_words(resp: &mut [u8; 20], words: &[u32; 2]) {
        resp[4..8].copy_from_slice(&words[0].to_be_bytes());
        resp[8..12].copy_from_slice(&words[1].to_be_bytes());
    }

    fn present_state(&self) -> u32 {
        let mut v = 0;
        if self.inhibit {
            v |= SDHCI_CMD_INHIBIT;
        }
        if self.present {
            v |= SDHCI_CARD_PRESENT;
        }
        let powered = self.regs[SDHCI_POWER_CONTROL as usize] != 0;
        if powered && self.dev.if_detect {
            v |= SDHCI_UHS2_IF_DETECT;
        }
        if powered && self.dev.lane_sync {
            v |= SDHCI_UHS2_LANE_SYNC;
        }
        if self.dev.dormant {
            v |= SDHCI_UHS2_IN_DORMANT_STATE;
        }
        v
    }

    fn dispatch_command(&mut self) {
        if let Some(bits) = self.dev.fail_next.take() {
            self.raise_error(bits);
            self.raise_int(SDHCI_INT_ERROR);
            return;
        }

        let header = self.get16(SDHCI_UHS2_CMD_PACKET);
        let arg = self.get16(SDHCI_UHS2_CMD_PACKET + 2);
        let mut payload = [0u32; 4];
        for (i, word) in payload.iter_mut().enumerate() {
            let off = (SDHCI_UHS2_CMD_PACKET_PAYLOAD + i as u16 * 4) as usize;
            *word = u32::from_be_bytes([
                self.regs[off],
                self.regs[off + 1],
                self.regs[off + 2],
                self.regs[off + 3],
            ]);
        }
        self.dev.history.push(ParsedPacket {
            header,
            arg,
            payload,
        });

        let mut resp = [0u8; 20];
        let mut data_end = false;
        if header & UHS2_NATIVE_PACKET != 0 {
            self.serve_native(arg, &payload, &mut resp);
        } else {
            data_end = self.serve_sd(arg, &payload, &mut resp);
        }
        if self.dev.nack_all {
            resp[2] |= UHS2_RES_NACK_MASK;
        }

        let base = SDHCI_UHS2_RESPONSE as usize;
        self.regs[base..base + 20].copy_from_slice(&resp);
        let mut bits = SDHCI_INT_RESPONSE;
        if data_end {
            bits |= SDHCI_INT_DATA_END;
        }
        self.raise_int(bits);
    }

    fn serve_native(&mut self, arg: u16, payload: &[u32; 4], resp: &mut [u8; 20]) {
        let ioadr = arg_ioadr(arg);
        let is_write = arg & UHS2_NATIVE_CMD_WRITE != 0;
        resp[3] = (ioadr & 0xFF) as u8;
        match ioadr {
            UHS2_DEV_CMD_DEVICE_INIT => {
                self.dev.init_seen += 1;
                let accept = self
                    .dev
                    .init_accept_attempt
                    .is_some_and(|n| self.dev.init_seen >= n);
                if accept {
                    resp[5] = 0x8;
                } else {
                    resp[4] = self.dev.gap & 0xF;
                }
            }
            UHS2_DEV_CMD_ENUMERATE => {
                resp[4] = (self.dev.node_id << 4) | self.dev.node_id;
            }
            UHS2_DEV_CMD_GO_DORMANT_STATE => {
                self.dev.dormant = true;
                self.dev.dormant_entries += 1;
            }
            UHS2_DEV_CONFIG_GEN_CAPS if !is_write => {
                Self::put_resp_words(resp, &self.dev.gen_caps);
            }
            UHS2_DEV_CONFIG_PHY_CAPS if !is_write => {
                Self::put_resp_words(resp, &self.dev.phy_caps);
            }
            UHS2_DEV_CONFIG_LINK_TRAN_CAPS if !is_write => {
                Self::put_resp_words(resp, &self.dev.lt_caps);
            }
            UHS2_DEV_CONFIG_GEN_SET if !is_write => {
                self.dev.gen_set_reads += 1;
                let done = self.dev.gen_set_reads >= self.dev.cfg_complete_after;
                let words = [
                    0,
                    if done {
                        UHS2_DEV_CONFIG_GEN_SET_CFG_COMPLETE
                    } else {
                        0
                    },
                ];
                Self::put_resp_words(resp, &words);
            }
            UHS2_DEV_CONFIG_GEN_SET | UHS2_DEV_CONFIG_PHY_SET | UHS2_DEV_CONFIG_LINK_TRAN_SET => {
                self.dev.writes.push((ioadr, [payload[0], payload[1]]));
                if ioadr == UHS2_DEV_CONFIG_PHY_SET && self.dev.nack_phy_set {
                    resp[2] |= UHS2_RES_NACK_MASK;
                }
            }
            _ => {}
        }
    }

    fn serve_sd(&mut self, arg: u16, payload: &[u32; 4], resp: &mut [u8; 20]) -> bool {
        let opcode = ((arg >> UHS2_SD_CMD_INDEX_POS) & 0x3F) as u8;
        let app = arg & UHS2_SD_CMD_APP != 0;
        let sd_arg = payload[0];
        let mut words = [0u32; 4];
        let mut data_end = false;
        match (opcode, app) {
            (SD_CMD_GO_IDLE_STATE, _) => {}
            (SD_CMD_SEND_IF_COND, _) => words[0] = sd_arg & 0xFFF,
            (SD_ACMD_SEND_OP_COND, true) => {
                self.dev.acmd41_seen += 1;
                words[0] = SD_OCR_VDD_RANGE | SD_OCR_CCS;
                if self.dev.acmd41_seen >= self.dev.ocr_ready_after {
                    words[0] |= SD_OCR_BUSY;
                }
            }
            (SD_CMD_ALL_SEND_CID, _) => {
                words = [0x0253_4432, 0x4730_3247, 0x3800_1122, 0x3344_5566];
            }
            (SD_CMD_SEND_RELATIVE_ADDR, _) => words[0] = 0x0001_0500,
            (SD_CMD_SEND_CSD, _) => {
                words = [0x400E_0032, 0x5B59_0000, 0x3B37_7F80, 0x0A40_0000];
            }
            (SD_CMD_SELECT_CARD, _) => {
                words[0] = 0x0000_0700;
                data_end = true;
            }
            (SD_ACMD_SEND_SCR, true) => {
                words[0] = 0x0000_0900;
                self.dma_data = vec![0x02, 0x45, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00];
                data_end = true;
            }
            (SD_CMD_SWITCH_FUNC, _) => {
                words[0] = 0x0000_0900;
                let mut status = vec![0u8; 64];
                status[0] = 0x01;
                status[1] = 0x90;
                // Group 4 result: 1.80W selected
                status[15] = 0x40;
                self.dma_data = status;
                data_end = true;
            }
            _ => {}
        }
        for (i, word) in words.iter().enumerate() {
            resp[4 + i * 4..8 + i * 4].copy_from_slice(&word.to_be_bytes());
        }
        data_end
    }
}

impl RegisterBus for MockBus {
    fn read8(&self, offset: u16) -> u8 {
        self.regs[offset as usize]
    }

    fn read16(&self, offset: u16) -> u16 {
        let v = self.get16(offset);
        // The internal clock is always stable once enabled
        if offset == SDHCI_CLOCK_CONTROL && v & SDHCI_CLOCK_INT_EN != 0 {
            v | SDHCI_CLOCK_INT_STABLE
        } else {
            v
        }
    }

    fn read32(&self, offset: u16) -> u32 {
        if offset == SDHCI_PRESENT_STATE {
            self.present_state_reads
                .set(self.present_state_reads.get() + 1);
            return self.present_state();
        }
        self.get32(offset)
    }

    fn write8(&mut self, offset: u16, value: u8) {
        self.regs[offset as usize] = value;
    }

    fn write16(&mut self, offset: u16, value: u16) {
        match offset {
            SDHCI_UHS2_COMMAND => {
                self.put16(offset, value);
                self.last_cmd_reg = value;
                self.dispatch_command();
            }
            SDHCI_UHS2_SW_RESET => {
                if value & SDHCI_UHS2_SW_RESET_SD != 0 {
                    self.sd_resets += 1;
                }
                if self.stuck_reset && value != 0 {
                    self.put16(offset, value);
                } else {
                    // Reset completes instantly
                    self.put16(offset, 0);
                }
            }
            SDHCI_CLOCK_CONTROL => {
                let prev = self.get16(offset);
                self.put16(offset, value);
                if value & SDHCI_CLOCK_CARD_EN != 0
                    && prev & SDHCI_CLOCK_CARD_EN == 0
                    && self.dev.dormant
                {
                    self.dev.dormant = false;
                }
            }
            _ => self.put16(offset, value),
        }
    }

    fn write32(&mut self, offset: u16, value: u32) {
        match offset {
            // Write-1-to-clear status registers
            SDHCI_INT_STATUS | SDHCI_UHS2_ERR_INT_STATUS => {
                let cur = self.get32(offset);
                self.put32(offset, cur & !value);
            }
            _ => self.put32(offset, value),
        }
    }

    fn udelay(&mut self, us: u32) {
        self.delay_calls += 1;
        self.delays_us += us as u64;
    }

    fn card_present(&self) -> bool {
        self.present
            && self
                .present_after_delays
                .is_none_or(|n| self.delay_calls <= n)
    }

    fn dma_read(&mut self, buf: &mut [u8]) {
        let n = buf.len().min(self.dma_data.len());
        buf[..n].copy_from_slice(&self.dma_data[..n]);
    }

    fn dma_write(&mut self, data: &[u8]) {
        self.dma_written = data.to_vec();
    }

    fn dma_release(&mut self) {
        self.dma_releases += 1;
    }
}
