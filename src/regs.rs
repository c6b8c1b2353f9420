//! UHS-II Host Register Definitions
//!
//! Register offsets and bitfields for the UHS-II extension of the SD
//! Host Controller register block, plus the handful of legacy SDHCI
//! registers the UHS-II engine still drives (present state, clock,
//! power, interrupt status).

// ============================================================================
// Legacy SDHCI Register Offsets (shared with the UHS-II interface)
// ============================================================================

/// Present State Register
pub const SDHCI_PRESENT_STATE: u16 = 0x24;

/// Power Control Register
pub const SDHCI_POWER_CONTROL: u16 = 0x29;

/// Clock Control Register
pub const SDHCI_CLOCK_CONTROL: u16 = 0x2C;

/// Normal Interrupt Status Register
pub const SDHCI_INT_STATUS: u16 = 0x30;

/// Normal Interrupt Status Enable Register
pub const SDHCI_INT_ENABLE: u16 = 0x34;

/// Normal Interrupt Signal Enable Register
pub const SDHCI_SIGNAL_ENABLE: u16 = 0x38;

/// Host Control 2 Register
pub const SDHCI_HOST_CONTROL2: u16 = 0x3E;

/// ADMA Error Status Register
pub const SDHCI_ADMA_ERROR: u16 = 0x54;

// ============================================================================
// Present State Register (0x24) Bitfields
// ============================================================================

/// Command Inhibit (CMD)
pub const SDHCI_CMD_INHIBIT: u32 = 1 << 0;

/// UHS-II Interface Detect
pub const SDHCI_UHS2_IF_DETECT: u32 = 1 << 8;

/// UHS-II Lane Synchronization
pub const SDHCI_UHS2_LANE_SYNC: u32 = 1 << 9;

/// UHS-II In Dormant State
pub const SDHCI_UHS2_IN_DORMANT_STATE: u32 = 1 << 10;

/// Card Inserted
pub const SDHCI_CARD_PRESENT: u32 = 1 << 16;

// ============================================================================
// Clock Control Register (0x2C) Bitfields
// ============================================================================

/// Internal Clock Enable
pub const SDHCI_CLOCK_INT_EN: u16 = 1 << 0;

/// Internal Clock Stable
pub const SDHCI_CLOCK_INT_STABLE: u16 = 1 << 1;

/// SD/UHS-II Clock Enable
pub const SDHCI_CLOCK_CARD_EN: u16 = 1 << 2;

// ============================================================================
// Power Control Register (0x29) Bitfields
// ============================================================================

/// SD Bus Power (VDD1)
pub const SDHCI_POWER_ON: u8 = 0x01;

/// SD Bus Voltage Select: 1.8V (VDD1)
pub const SDHCI_POWER_180: u8 = 0x0A;

/// SD Bus Power (VDD2)
pub const SDHCI_VDD2_POWER_ON: u8 = 0x10;

// ============================================================================
// Normal Interrupt Status (0x30) Bitfields
// ============================================================================

/// Command Response received
pub const SDHCI_INT_RESPONSE: u32 = 1 << 0;

/// Transfer Complete
pub const SDHCI_INT_DATA_END: u32 = 1 << 1;

/// Card Interrupt
pub const SDHCI_INT_CARD_INT: u32 = 1 << 8;

/// Error Interrupt
pub const SDHCI_INT_ERROR: u32 = 1 << 15;

/// All normal interrupt sources
pub const SDHCI_INT_ALL_MASK: u32 = 0xFFFF_FFFF;

// ============================================================================
// Host Control 2 Register (0x3E) Bitfields
// ============================================================================

/// UHS Mode Select mask
pub const SDHCI_CTRL_UHS_MASK: u16 = 0x0007;

/// UHS Mode Select: UHS-II
pub const SDHCI_CTRL_UHS2: u16 = 0x0007;

/// UHS-II Interface Enable
pub const SDHCI_CTRL_UHS2_ENABLE: u16 = 1 << 8;

// ============================================================================
// UHS-II Register Offsets
// ============================================================================

/// UHS-II Block Size Register
pub const SDHCI_UHS2_BLOCK_SIZE: u16 = 0x80;

/// UHS-II Block Count Register
pub const SDHCI_UHS2_BLOCK_COUNT: u16 = 0x84;

/// UHS-II Command Packet Register (20 bytes: 0x88..0x9C)
pub const SDHCI_UHS2_CMD_PACKET: u16 = 0x88;

/// UHS-II Transfer Mode Register
pub const SDHCI_UHS2_TRANS_MODE: u16 = 0x9C;

/// UHS-II Command Register
pub const SDHCI_UHS2_COMMAND: u16 = 0x9E;

/// UHS-II Response Packet Register (20 bytes: 0xA0..0xB4)
pub const SDHCI_UHS2_RESPONSE: u16 = 0xA0;

/// UHS-II Software Reset Register
pub const SDHCI_UHS2_SW_RESET: u16 = 0xBA;

/// UHS-II Timer Control Register
pub const SDHCI_UHS2_TIMER_CTRL: u16 = 0xBC;

/// UHS-II Error Interrupt Status Register
pub const SDHCI_UHS2_ERR_INT_STATUS: u16 = 0xC0;

/// UHS-II Error Interrupt Status Enable Register
pub const SDHCI_UHS2_ERR_INT_STATUS_EN: u16 = 0xC4;

/// UHS-II Error Interrupt Signal Enable Register
pub const SDHCI_UHS2_ERR_INT_SIG_EN: u16 = 0xC8;

/// Pointer to UHS-II Settings Register
pub const SDHCI_UHS2_SETTINGS_PTR: u16 = 0xE0;

/// Pointer to UHS-II Host Capabilities Register
pub const SDHCI_UHS2_HOST_CAPS_PTR: u16 = 0xE2;

/// Maximum length of a command or response packet in bytes
pub const SDHCI_UHS2_PACKET_BYTES: usize = 20;

/// Lowest valid value of the host capabilities pointer
pub const SDHCI_UHS2_CAPS_PTR_MIN: u16 = 0x100;

/// Highest valid value of the host capabilities pointer
pub const SDHCI_UHS2_CAPS_PTR_MAX: u16 = 0x1FF;

// ============================================================================
// UHS-II Command Packet Register (0x88) Layout
// ============================================================================

/// Offset of the payload area inside the command packet register
pub const SDHCI_UHS2_CMD_PACKET_PAYLOAD: u16 = SDHCI_UHS2_CMD_PACKET + 4;

// ============================================================================
// UHS-II Transfer Mode Register (0x9C) Bitfields
// ============================================================================

/// DMA Enable
pub const SDHCI_UHS2_TRNS_DMA: u16 = 1 << 0;

/// Block Count Enable
pub const SDHCI_UHS2_TRNS_BLK_CNT_EN: u16 = 1 << 1;

/// Data Transfer Direction: Write
pub const SDHCI_UHS2_TRNS_WRITE: u16 = 1 << 4;

/// Wait for End-of-Busy after the transfer
pub const SDHCI_UHS2_TRNS_WAIT_EBSY: u16 = 1 << 6;

/// 2-Lane Half-Duplex Mode
pub const SDHCI_UHS2_TRNS_2L_HD: u16 = 1 << 8;

/// Byte Mode (block count register holds a byte count)
pub const SDHCI_UHS2_TRNS_BYTE_MODE: u16 = 1 << 9;

// ============================================================================
// UHS-II Command Register (0x9E) Bitfields
// ============================================================================

/// Command carries a data transfer
pub const SDHCI_UHS2_CMD_DATA: u16 = 1 << 5;

/// Command is a transfer abort (TRANS_ABORT CCMD)
pub const SDHCI_UHS2_CMD_TRNS_ABORT: u16 = 1 << 6;

/// Command is CMD12 (stop transmission)
pub const SDHCI_UHS2_CMD_CMD12: u16 = 1 << 7;

/// Command requests entry into Dormant state (command type 0b11)
pub const SDHCI_UHS2_CMD_DORMANT: u16 = SDHCI_UHS2_CMD_TRNS_ABORT | SDHCI_UHS2_CMD_CMD12;

/// Packet Length field position (bits 12:8)
pub const SDHCI_UHS2_CMD_PACK_LEN_POS: u16 = 8;
pub const SDHCI_UHS2_CMD_PACK_LEN_MASK: u16 = 0x1F;

/// Compose a UHS-II command register value
#[inline]
pub const fn make_uhs2_cmd(packet_len: u16, flags: u16) -> u16 {
    ((packet_len & SDHCI_UHS2_CMD_PACK_LEN_MASK) << SDHCI_UHS2_CMD_PACK_LEN_POS) | flags
}

// ============================================================================
// UHS-II Software Reset Register (0xBA) Bitfields
// ============================================================================

/// Full reset of the UHS-II interface
pub const SDHCI_UHS2_SW_RESET_FULL: u16 = 1 << 0;

/// Reset of the UHS-II command/data circuits only
pub const SDHCI_UHS2_SW_RESET_SD: u16 = 1 << 1;

// ============================================================================
// UHS-II Timer Control Register (0xBC) Bitfields
// ============================================================================

/// Deadlock timeout counter field position (bits 7:4)
pub const SDHCI_UHS2_TIMER_CTRL_DEADLOCK_POS: u16 = 4;

/// Compose a UHS-II timer control register value
#[inline]
pub const fn make_uhs2_timer(cmd_res_count: u8, deadlock_count: u8) -> u16 {
    ((deadlock_count as u16 & 0xF) << SDHCI_UHS2_TIMER_CTRL_DEADLOCK_POS)
        | (cmd_res_count as u16 & 0xF)
}

// ============================================================================
// UHS-II Error Interrupt Status (0xC0) Bitfields
// ============================================================================

/// Header error in a received packet
pub const SDHCI_UHS2_ERR_HEADER: u32 = 1 << 0;

/// Response error (NACK received)
pub const SDHCI_UHS2_ERR_RES: u32 = 1 << 1;

/// Retry cycles exhausted
pub const SDHCI_UHS2_ERR_RETRY_EXP: u32 = 1 << 2;

/// CRC error in a data packet
pub const SDHCI_UHS2_ERR_CRC: u32 = 1 << 3;

/// Framing error in a data packet
pub const SDHCI_UHS2_ERR_FRAME: u32 = 1 << 4;

/// Transaction ID error
pub const SDHCI_UHS2_ERR_TID: u32 = 1 << 5;

/// Unrecoverable link error
pub const SDHCI_UHS2_ERR_UNRECOVER: u32 = 1 << 7;

/// Unexpected end-of-busy
pub const SDHCI_UHS2_ERR_EBUSY: u32 = 1 << 8;

/// ADMA descriptor engine error
pub const SDHCI_UHS2_ERR_ADMA: u32 = 1 << 15;

/// Response timeout
pub const SDHCI_UHS2_ERR_RES_TIMEOUT: u32 = 1 << 16;

/// Deadlock timeout
pub const SDHCI_UHS2_ERR_DEADLOCK_TIMEOUT: u32 = 1 << 17;

/// Errors attributed to the command phase
pub const SDHCI_UHS2_ERR_CMD_MASK: u32 =
    SDHCI_UHS2_ERR_HEADER | SDHCI_UHS2_ERR_RES | SDHCI_UHS2_ERR_RETRY_EXP | SDHCI_UHS2_ERR_RES_TIMEOUT;

/// Errors attributed to the data phase
pub const SDHCI_UHS2_ERR_DATA_MASK: u32 = SDHCI_UHS2_ERR_CRC
    | SDHCI_UHS2_ERR_FRAME
    | SDHCI_UHS2_ERR_TID
    | SDHCI_UHS2_ERR_UNRECOVER
    | SDHCI_UHS2_ERR_EBUSY
    | SDHCI_UHS2_ERR_ADMA
    | SDHCI_UHS2_ERR_DEADLOCK_TIMEOUT;

/// All defined UHS-II error interrupt sources
pub const SDHCI_UHS2_ERR_ALL_MASK: u32 = SDHCI_UHS2_ERR_CMD_MASK | SDHCI_UHS2_ERR_DATA_MASK;

// ============================================================================
// Host Capability Registers (at the host capabilities pointer)
// ============================================================================

/// General capabilities word offset
pub const UHS2_HC_GEN_CAPS: u16 = 0x0;

/// PHY capabilities word offset
pub const UHS2_HC_PHY_CAPS: u16 = 0x4;

/// Link/Transport capabilities word offset
pub const UHS2_HC_TRAN_CAPS: u16 = 0x8;

/// Link/Transport capabilities word 1 offset
pub const UHS2_HC_TRAN_CAPS1: u16 = 0xC;

/// Gen caps: DAP (device-allocated power) mask
pub const UHS2_HC_GEN_DAP_MASK: u32 = 0xF;

/// Gen caps: GAP (group-allocated power) field position
pub const UHS2_HC_GEN_GAP_POS: u32 = 4;
pub const UHS2_HC_GEN_GAP_MASK: u32 = 0xF;

/// Gen caps: number of lanes field position
pub const UHS2_HC_GEN_N_LANES_POS: u32 = 8;
pub const UHS2_HC_GEN_N_LANES_MASK: u32 = 0x3F;

/// Gen caps: 64-bit addressing supported
pub const UHS2_HC_GEN_ADDR_64: u32 = 1 << 14;

/// Gen caps: card type field position
pub const UHS2_HC_GEN_CARD_TYPE_POS: u32 = 16;
pub const UHS2_HC_GEN_CARD_TYPE_MASK: u32 = 0x3;

/// PHY caps: PHY revision mask
pub const UHS2_HC_PHY_REV_MASK: u32 = 0x3F;

/// PHY caps: speed range field position
pub const UHS2_HC_PHY_RANGE_POS: u32 = 6;
pub const UHS2_HC_PHY_RANGE_MASK: u32 = 0x3;

/// PHY caps: N_LSS_SYN field position
pub const UHS2_HC_PHY_N_LSS_SYN_POS: u32 = 16;
pub const UHS2_HC_PHY_N_LSS_SYN_MASK: u32 = 0xF;

/// PHY caps: N_LSS_DIR field position
pub const UHS2_HC_PHY_N_LSS_DIR_POS: u32 = 20;
pub const UHS2_HC_PHY_N_LSS_DIR_MASK: u32 = 0xF;

/// Tran caps: link revision mask
pub const UHS2_HC_TRAN_LINK_REV_MASK: u32 = 0x3F;

/// Tran caps: N_FCU field position
pub const UHS2_HC_TRAN_N_FCU_POS: u32 = 8;
pub const UHS2_HC_TRAN_N_FCU_MASK: u32 = 0xFF;

/// Tran caps: host type field position
pub const UHS2_HC_TRAN_HOST_TYPE_POS: u32 = 16;
pub const UHS2_HC_TRAN_HOST_TYPE_MASK: u32 = 0x7;

/// Tran caps: maximum block length field position
pub const UHS2_HC_TRAN_BLK_LEN_POS: u32 = 20;
pub const UHS2_HC_TRAN_BLK_LEN_MASK: u32 = 0xFFF;

/// Tran caps 1: N_DATA_GAP mask
pub const UHS2_HC_TRAN_N_DATA_GAP_MASK: u32 = 0xFF;

// ============================================================================
// Host Settings Registers (at the settings pointer)
// ============================================================================

/// General settings word offset
pub const UHS2_HS_GEN_SET: u16 = 0x0;

/// PHY settings word offset
pub const UHS2_HS_PHY_SET: u16 = 0x4;

/// Link/Transport settings word offset
pub const UHS2_HS_TRAN_SET: u16 = 0x8;

/// Link/Transport settings word 1 offset
pub const UHS2_HS_TRAN_SET1: u16 = 0xC;

/// Gen settings: number of lanes field position
pub const UHS2_HS_GEN_N_LANES_POS: u32 = 8;

/// PHY settings: speed range field position
pub const UHS2_HS_PHY_RANGE_POS: u32 = 6;

/// PHY settings: N_LSS_SYN field position
pub const UHS2_HS_PHY_N_LSS_SYN_POS: u32 = 16;

/// PHY settings: N_LSS_DIR field position
pub const UHS2_HS_PHY_N_LSS_DIR_POS: u32 = 20;

/// Tran settings: N_FCU field position
pub const UHS2_HS_TRAN_N_FCU_POS: u32 = 8;

/// Tran settings: retry count field position
pub const UHS2_HS_TRAN_RETRY_CNT_POS: u32 = 16;

/// Tran settings: maximum block length field position
pub const UHS2_HS_TRAN_BLK_LEN_POS: u32 = 20;
