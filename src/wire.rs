//! UHS-II Link-Layer Wire Definitions
//!
//! Packet header and argument encodings, device command IOADRs and the
//! device configuration register layout, as carried on the wire in
//! native CCMD/DCMD packets.

// ============================================================================
// Packet Header (16 bits)
// ============================================================================

/// Native packet (CCMD); clear for SD-transparent traffic
pub const UHS2_NATIVE_PACKET: u16 = 1 << 7;

/// Packet type field position (bits 5:4)
pub const UHS2_PACKET_TYPE_POS: u16 = 4;

/// Control command packet
pub const UHS2_PACKET_TYPE_CCMD: u16 = 0 << UHS2_PACKET_TYPE_POS;

/// Data command packet (SD-transparent command)
pub const UHS2_PACKET_TYPE_DCMD: u16 = 1 << UHS2_PACKET_TYPE_POS;

/// Destination node ID mask (bits 3:0)
pub const UHS2_DEST_ID_MASK: u16 = 0xF;

/// Broadcast destination (pre-enumeration traffic)
pub const UHS2_DEST_ID_BROADCAST: u16 = 0x0;

/// Compose a packet header
#[inline]
pub const fn make_header(native: bool, packet_type: u16, dest_id: u8) -> u16 {
    let native_bit = if native { UHS2_NATIVE_PACKET } else { 0 };
    native_bit | packet_type | (dest_id as u16 & UHS2_DEST_ID_MASK)
}

// ============================================================================
// Native Command Argument (16 bits)
// ============================================================================

/// Direction: write to the device register
pub const UHS2_NATIVE_CMD_WRITE: u16 = 1 << 7;

/// Direction: read from the device register
pub const UHS2_NATIVE_CMD_READ: u16 = 0;

/// Payload length code field position (bits 5:4)
pub const UHS2_NATIVE_CMD_PLEN_POS: u16 = 4;

/// No payload
pub const UHS2_NATIVE_CMD_PLEN_0B: u16 = 0 << UHS2_NATIVE_CMD_PLEN_POS;

/// 4-byte payload
pub const UHS2_NATIVE_CMD_PLEN_4B: u16 = 1 << UHS2_NATIVE_CMD_PLEN_POS;

/// 8-byte payload
pub const UHS2_NATIVE_CMD_PLEN_8B: u16 = 2 << UHS2_NATIVE_CMD_PLEN_POS;

/// 16-byte payload
pub const UHS2_NATIVE_CMD_PLEN_16B: u16 = 3 << UHS2_NATIVE_CMD_PLEN_POS;

/// Compose a native command argument from a 12-bit IOADR.
///
/// The low byte of the IOADR lands in the argument's high byte so that
/// the IOADR straddles the argument the way it travels on the wire.
#[inline]
pub const fn make_native_arg(ioadr: u16, direction: u16, plen: u16) -> u16 {
    ((ioadr & 0xFF) << 8) | direction | plen | (ioadr >> 8)
}

/// Recover the IOADR from a native command argument.
#[inline]
pub const fn arg_ioadr(arg: u16) -> u16 {
    ((arg & 0xF) << 8) | ((arg >> 8) & 0xFF)
}

// ============================================================================
// SD-Transparent Command Argument (16 bits)
// ============================================================================

/// SD command index field position
pub const UHS2_SD_CMD_INDEX_POS: u16 = 8;

/// Application command (preceded by CMD55)
pub const UHS2_SD_CMD_APP: u16 = 1 << 14;

/// DCMD: 2-lane half-duplex transfer
pub const UHS2_DCMD_2L_HD_MODE: u16 = 1 << 6;

/// DCMD: TLEN field present in the payload
pub const UHS2_DCMD_LM_TLEN_EXIST: u16 = 1 << 5;

/// DCMD: TLEN counts bytes instead of blocks
pub const UHS2_DCMD_TLUM_BYTE_MODE: u16 = 1 << 4;

// ============================================================================
// Device Command IOADRs
// ============================================================================

/// Base of the device command address space
pub const UHS2_DEV_CMD_BASE: u16 = 0x100;

/// FULL_RESET command
pub const UHS2_DEV_CMD_FULL_RESET: u16 = UHS2_DEV_CMD_BASE;

/// GO_DORMANT_STATE command
pub const UHS2_DEV_CMD_GO_DORMANT_STATE: u16 = UHS2_DEV_CMD_BASE + 0x1;

/// DEVICE_INIT command
pub const UHS2_DEV_CMD_DEVICE_INIT: u16 = UHS2_DEV_CMD_BASE + 0x2;

/// ENUMERATE command
pub const UHS2_DEV_CMD_ENUMERATE: u16 = UHS2_DEV_CMD_BASE + 0x3;

/// TRANS_ABORT command
pub const UHS2_DEV_CMD_TRANS_ABORT: u16 = UHS2_DEV_CMD_BASE + 0x4;

// ============================================================================
// DEVICE_INIT Payload Fields
// ============================================================================

/// Device-allocated power field position
pub const UHS2_DEV_INIT_DAP_POS: u32 = 12;

/// Complete flag: final initialization pass
pub const UHS2_DEV_INIT_COMPLETE_FLAG: u32 = 1 << 11;

/// Group descriptor field position
pub const UHS2_DEV_INIT_GD_POS: u32 = 4;

/// Group-allocated power mask
pub const UHS2_DEV_INIT_GAP_MASK: u32 = 0xF;

// ============================================================================
// ENUMERATE Payload Fields
// ============================================================================

/// First assignable node ID field position
pub const UHS2_DEV_ENUM_ID_F_POS: u32 = 4;

/// Last assignable node ID mask
pub const UHS2_DEV_ENUM_ID_L_MASK: u32 = 0xF;

// ============================================================================
// Device Configuration Register IOADRs
// ============================================================================

/// Base of the device configuration address space
pub const UHS2_DEV_CONFIG_BASE: u16 = 0x000;

/// Generic capabilities register
pub const UHS2_DEV_CONFIG_GEN_CAPS: u16 = UHS2_DEV_CONFIG_BASE;

/// PHY capabilities register
pub const UHS2_DEV_CONFIG_PHY_CAPS: u16 = UHS2_DEV_CONFIG_BASE + 0x2;

/// Link/Transport capabilities register
pub const UHS2_DEV_CONFIG_LINK_TRAN_CAPS: u16 = UHS2_DEV_CONFIG_BASE + 0x4;

/// Generic settings register
pub const UHS2_DEV_CONFIG_GEN_SET: u16 = UHS2_DEV_CONFIG_BASE + 0x8;

/// PHY settings register
pub const UHS2_DEV_CONFIG_PHY_SET: u16 = UHS2_DEV_CONFIG_BASE + 0xA;

/// Link/Transport settings register
pub const UHS2_DEV_CONFIG_LINK_TRAN_SET: u16 = UHS2_DEV_CONFIG_BASE + 0xC;

// ============================================================================
// Device Generic Capabilities Fields
// ============================================================================

/// Number of lanes field position
pub const UHS2_DEV_CONFIG_N_LANES_POS: u32 = 8;
pub const UHS2_DEV_CONFIG_N_LANES_MASK: u32 = 0x3F;

/// Lane capability: 2 lanes, half and full duplex
pub const UHS2_DEV_CONFIG_2L_HD_FD: u32 = 0x1;

/// Device address length field position (set: 4-byte addressing)
pub const UHS2_DEV_CONFIG_DADR_POS: u32 = 14;
pub const UHS2_DEV_CONFIG_DADR_MASK: u32 = 0x1;

/// Application type field position
pub const UHS2_DEV_CONFIG_APP_POS: u32 = 16;
pub const UHS2_DEV_CONFIG_APP_MASK: u32 = 0xFF;

/// Application type: SD memory
pub const UHS2_DEV_CONFIG_APP_SD_MEM: u32 = 0x1;

// ============================================================================
// Device PHY Capabilities Fields
// ============================================================================

/// PHY minor revision mask (word 0)
pub const UHS2_DEV_CONFIG_PHY_MINOR_MASK: u32 = 0xF;

/// PHY major revision field position (word 0)
pub const UHS2_DEV_CONFIG_PHY_MAJOR_POS: u32 = 4;
pub const UHS2_DEV_CONFIG_PHY_MAJOR_MASK: u32 = 0x3;

/// Hibernate support (word 0)
pub const UHS2_DEV_CONFIG_CAN_HIBER_POS: u32 = 15;
pub const UHS2_DEV_CONFIG_CAN_HIBER_MASK: u32 = 0x1;

/// N_LSS_SYN mask (word 1)
pub const UHS2_DEV_CONFIG_N_LSS_SYN_MASK: u32 = 0xF;

/// N_LSS_DIR field position (word 1)
pub const UHS2_DEV_CONFIG_N_LSS_DIR_POS: u32 = 4;
pub const UHS2_DEV_CONFIG_N_LSS_DIR_MASK: u32 = 0xF;

// ============================================================================
// Device Link/Transport Capabilities Fields
// ============================================================================

/// Link/Transport minor revision mask (word 0)
pub const UHS2_DEV_CONFIG_LT_MINOR_MASK: u32 = 0xF;

/// Link/Transport major revision field position (word 0)
pub const UHS2_DEV_CONFIG_LT_MAJOR_POS: u32 = 4;
pub const UHS2_DEV_CONFIG_LT_MAJOR_MASK: u32 = 0x3;

/// N_FCU field position (word 0)
pub const UHS2_DEV_CONFIG_N_FCU_POS: u32 = 8;
pub const UHS2_DEV_CONFIG_N_FCU_MASK: u32 = 0xFF;

/// Device type field position (word 0)
pub const UHS2_DEV_CONFIG_DEV_TYPE_POS: u32 = 16;
pub const UHS2_DEV_CONFIG_DEV_TYPE_MASK: u32 = 0x7;

/// Maximum block length field position (word 0)
pub const UHS2_DEV_CONFIG_MAX_BLK_LEN_POS: u32 = 20;
pub const UHS2_DEV_CONFIG_MAX_BLK_LEN_MASK: u32 = 0xFFF;

/// N_DATA_GAP mask (word 1)
pub const UHS2_DEV_CONFIG_N_DATA_GAP_MASK: u32 = 0xFF;

// ============================================================================
// Device Settings Fields
// ============================================================================

/// Gen settings: lane selection field position
pub const UHS2_DEV_CONFIG_GEN_SET_N_LANES_POS: u32 = 8;

/// Gen settings: 2 lanes, full/half duplex
pub const UHS2_DEV_CONFIG_GEN_SET_2L_FD_HD: u32 = 0x0;

/// Gen settings: configuration complete (word 1)
pub const UHS2_DEV_CONFIG_GEN_SET_CFG_COMPLETE: u32 = 1 << 31;

/// PHY settings: speed range field position (word 0)
pub const UHS2_DEV_CONFIG_PHY_SET_SPEED_POS: u32 = 6;

/// Speed range A (low-speed link)
pub const UHS2_DEV_CONFIG_PHY_SET_SPEED_A: u32 = 0x0;

/// Speed range B (high-speed link)
pub const UHS2_DEV_CONFIG_PHY_SET_SPEED_B: u32 = 0x1;

/// Link/Transport settings: N_FCU field position (word 0)
pub const UHS2_DEV_CONFIG_LT_SET_N_FCU_POS: u32 = 8;

/// Link/Transport settings: retry count field position (word 0)
pub const UHS2_DEV_CONFIG_LT_SET_MAX_RETRY_POS: u32 = 16;

/// Link/Transport settings: maximum block length field position (word 0)
pub const UHS2_DEV_CONFIG_LT_SET_MAX_BLK_LEN_POS: u32 = 20;

/// Block length negotiated for SD-memory devices
pub const UHS2_DEV_CONFIG_LT_SET_MAX_BLK_LEN: u32 = 512;

// ============================================================================
// Response Packet Fields
// ============================================================================

/// Response byte 2: NACK
pub const UHS2_RES_NACK_MASK: u8 = 0x80;

/// Response byte 2: error code field position
pub const UHS2_RES_ECODE_POS: u8 = 4;
pub const UHS2_RES_ECODE_MASK: u8 = 0x7;

// ============================================================================
// SD-Transparent Commands (carried in DCMD packets)
// ============================================================================

/// CMD0: GO_IDLE_STATE
pub const SD_CMD_GO_IDLE_STATE: u8 = 0;

/// CMD2: ALL_SEND_CID
pub const SD_CMD_ALL_SEND_CID: u8 = 2;

/// CMD3: SEND_RELATIVE_ADDR
pub const SD_CMD_SEND_RELATIVE_ADDR: u8 = 3;

/// CMD6: SWITCH_FUNC
pub const SD_CMD_SWITCH_FUNC: u8 = 6;

/// CMD7: SELECT_CARD
pub const SD_CMD_SELECT_CARD: u8 = 7;

/// CMD8: SEND_IF_COND
pub const SD_CMD_SEND_IF_COND: u8 = 8;

/// CMD9: SEND_CSD
pub const SD_CMD_SEND_CSD: u8 = 9;

/// CMD12: STOP_TRANSMISSION
pub const SD_CMD_STOP_TRANSMISSION: u8 = 12;

/// CMD13: SEND_STATUS
pub const SD_CMD_SEND_STATUS: u8 = 13;

/// CMD17: READ_SINGLE_BLOCK
pub const SD_CMD_READ_SINGLE_BLOCK: u8 = 17;

/// CMD24: WRITE_BLOCK
pub const SD_CMD_WRITE_BLOCK: u8 = 24;

/// CMD38: ERASE
pub const SD_CMD_ERASE: u8 = 38;

/// CMD55: APP_CMD
pub const SD_CMD_APP_CMD: u8 = 55;

/// ACMD41: SD_SEND_OP_COND
pub const SD_ACMD_SEND_OP_COND: u8 = 41;

/// ACMD51: SEND_SCR
pub const SD_ACMD_SEND_SCR: u8 = 51;

/// CMD8 argument: 2.7-3.6V range, check pattern 0xAA
pub const SD_IF_COND_ARG: u32 = 0x1AA;

/// OCR: card power-up complete
pub const SD_OCR_BUSY: u32 = 1 << 31;

/// OCR: card capacity status / host capacity support
pub const SD_OCR_CCS: u32 = 1 << 30;

/// OCR: eXtended Performance Class (maximum performance) request
pub const SD_OCR_XPC: u32 = 1 << 28;

/// OCR: 3.2-3.3V supply window plus neighbours
pub const SD_OCR_VDD_RANGE: u32 = 0x00FF_8000;

/// CMD6 argument: set (commit) mode
pub const SD_SWITCH_SET: u32 = 1 << 31;

/// CMD6 function group for the power limit (1-based)
pub const SD_SWITCH_GRP_PWR_LIMIT: u32 = 4;

/// Power limit function: 1.80W
pub const SD_SWITCH_PWR_LIMIT_1_80W: u32 = 0x4;
