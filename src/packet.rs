//! UHS-II packet codec.
//!
//! Assembles native CCMD and SD-transparent DCMD packets and decodes
//! the raw 20-byte response area the controller captures. The payload
//! is kept as big-endian words so a packet can be streamed into the
//! command packet register without further conversion.

use heapless::Vec;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::U32 as BeU32;

use crate::engine::Command;
use crate::error::{Result, Uhs2Error};
use crate::regs::SDHCI_UHS2_PACKET_BYTES;
use crate::wire::*;

/// Maximum command payload in bytes (four 32-bit words)
pub const UHS2_MAX_PAYLOAD: usize = 16;

/// An assembled UHS-II command packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uhs2Packet {
    /// Packet header (native bit, packet type, destination node)
    pub header: u16,
    /// Command argument (IOADR/direction for CCMDs, SD index for DCMDs)
    pub arg: u16,
    payload: Vec<BeU32, 4>,
}

impl Uhs2Packet {
    /// Assemble a packet from header, argument and payload words.
    ///
    /// `payload_len` is the payload size in bytes; it must be a
    /// multiple of four, no larger than [`UHS2_MAX_PAYLOAD`], and
    /// covered by `payload`.
    pub fn assemble(header: u16, arg: u16, payload: &[u32], payload_len: usize) -> Result<Self> {
        if payload_len % 4 != 0 || payload_len > UHS2_MAX_PAYLOAD {
            return Err(Uhs2Error::InvalidParameter);
        }
        let words = payload_len / 4;
        if words > payload.len() {
            return Err(Uhs2Error::InvalidParameter);
        }

        let mut packed = Vec::new();
        for &word in &payload[..words] {
            // Capacity checked above
            let _ = packed.push(BeU32::new(word));
        }
        Ok(Uhs2Packet {
            header,
            arg,
            payload: packed,
        })
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len() * 4
    }

    /// Total packet length in bytes (header + argument + payload).
    pub fn packet_len(&self) -> usize {
        self.payload_len() + 4
    }

    /// Payload words in wire order.
    pub fn payload_words(&self) -> &[BeU32] {
        &self.payload
    }

    /// True for native (CCMD) packets.
    pub fn is_native(&self) -> bool {
        self.header & UHS2_NATIVE_PACKET != 0
    }

    /// IOADR of a native packet's argument.
    pub fn ioadr(&self) -> u16 {
        arg_ioadr(self.arg)
    }

    /// Register value of payload word `i`, encoded so that a
    /// little-endian register write reproduces the wire byte order.
    pub fn payload_reg(&self, i: usize) -> u32 {
        let bytes = self.payload[i].as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Decode the raw response area into `cmd`.
///
/// Commands that asked for a verbatim native response (`resp_len` of
/// 1..=20) get the leading bytes copied as-is. Everything else gets
/// the payload area (after the 4-byte handshake) folded into four
/// big-endian response words, matching the legacy response layout.
pub fn parse_response(cmd: &mut Command<'_>, raw: &[u8; SDHCI_UHS2_PACKET_BYTES]) {
    if (1..=SDHCI_UHS2_PACKET_BYTES).contains(&cmd.resp_len) {
        cmd.uhs2_resp.clear();
        // resp_len bounded by the buffer capacity
        let _ = cmd.uhs2_resp.extend_from_slice(&raw[..cmd.resp_len]);
    } else {
        for (i, word) in raw[4..].chunks_exact(4).enumerate() {
            cmd.resp[i] = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        }
    }
}

/// Build the DCMD packet for a legacy-style SD command descriptor.
///
/// `hd_mode` selects 2L-HD signalling for data transfers; `app_cmd`
/// marks the command as application-specific (CMD55 prefixed on the
/// legacy bus, a header bit here).
pub fn prepare_sd_packet(
    cmd: &mut Command<'_>,
    node_id: u8,
    hd_mode: bool,
    app_cmd: bool,
) -> Result<()> {
    let header = make_header(false, UHS2_PACKET_TYPE_DCMD, node_id);
    let mut arg = (cmd.opcode as u16) << UHS2_SD_CMD_INDEX_POS;
    if app_cmd {
        arg |= UHS2_SD_CMD_APP;
    }

    let mut payload = [cmd.arg, 0];
    let payload_len;
    if let Some(data) = &cmd.data {
        arg |= UHS2_DCMD_LM_TLEN_EXIST;
        if hd_mode {
            arg |= UHS2_DCMD_2L_HD_MODE;
        }
        // Single odd-sized blocks travel with a byte count; block
        // reads/writes always use block counting.
        if data.blocks == 1
            && data.blksz != 512
            && cmd.opcode != SD_CMD_READ_SINGLE_BLOCK
            && cmd.opcode != SD_CMD_WRITE_BLOCK
        {
            arg |= UHS2_DCMD_TLUM_BYTE_MODE;
            payload[1] = data.blksz as u32;
        } else {
            payload[1] = data.blocks as u32;
        }
        payload_len = 8;
    } else {
        payload_len = 4;
    }

    cmd.packet = Uhs2Packet::assemble(header, arg, &payload, payload_len)?;
    Ok(())
}
