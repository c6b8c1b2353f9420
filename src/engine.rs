//! Command/request engine.
//!
//! Drives single commands through the UHS-II command packet register:
//! inhibit handling with bounded retry, transfer-mode derivation,
//! response capture, request completion bookkeeping and the deferred
//! reset that follows a failed request.

use heapless::Vec;

use crate::attach::CardIdent;
use crate::caps::{CardConfig, HostCapabilities};
use crate::error::{Result, Uhs2Error};
use crate::io::RegisterBus;
use crate::packet::{self, Uhs2Packet};
use crate::regs::*;
use crate::wire::*;

/// Command-phase poll budget when no busy timeout is given
const CMD_TIMEOUT_MS: u32 = 1000;

/// Data-phase poll budget when no busy timeout is given
const DATA_TIMEOUT_MS: u32 = 5000;

/// Interrupt status poll interval
const POLL_INTERVAL_US: u32 = 10;

/// Inhibit retries after the initial submission attempt
const INHIBIT_RETRIES: u32 = 10;

/// Command/response timer target: 5 ms
const TIMER_CMD_RES_TARGET_US: u32 = 5_000;

/// Deadlock timer target: 1 s
const TIMER_DEADLOCK_TARGET_US: u32 = 1_000_000;

bitflags::bitflags! {
    /// Expected response shape of a command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u16 {
        /// A response is expected
        const RSP_PRESENT = 1 << 0;
        /// 136-bit response
        const RSP_136 = 1 << 1;
        /// Card signals busy after the response
        const RSP_BUSY = 1 << 2;
        /// Response carries a CRC
        const RSP_CRC = 1 << 3;
        /// Response echoes the opcode
        const RSP_OPCODE = 1 << 4;
        /// Command moves data
        const ADTC = 1 << 5;
    }
}

impl CmdFlags {
    pub const NONE: CmdFlags = CmdFlags::empty();
    pub const R1: CmdFlags = Self::RSP_PRESENT
        .union(Self::RSP_CRC)
        .union(Self::RSP_OPCODE);
    pub const R1B: CmdFlags = Self::R1.union(Self::RSP_BUSY);
    pub const R2: CmdFlags = Self::RSP_PRESENT
        .union(Self::RSP_136)
        .union(Self::RSP_CRC);
    pub const R3: CmdFlags = Self::RSP_PRESENT;
    pub const R6: CmdFlags = Self::R1;
    pub const R7: CmdFlags = Self::R1;
}

bitflags::bitflags! {
    /// Controller quirks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u8 {
        /// Timeout counter fields are unreliable; use the maximum
        const BROKEN_TIMEOUT_VAL = 1 << 0;
        /// Controller never raises the end-of-busy interrupt
        const NO_BUSY_IRQ = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Negotiated link state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct LinkFlags: u8 {
        /// Link runs in speed range B
        const SPEED_B = 1 << 0;
        /// 2-lane half-duplex transfers selected
        const HD_MODE = 1 << 1;
        /// Attach finished; NACK checking is armed
        const INITIALIZED = 1 << 2;
    }
}

/// One data transfer attached to a command.
#[derive(Debug)]
pub struct DataTransfer<'a> {
    pub blocks: u16,
    pub blksz: u16,
    pub write: bool,
    pub use_dma: bool,
    pub buf: &'a mut [u8],
    pub error: Option<Uhs2Error>,
}

impl<'a> DataTransfer<'a> {
    pub fn read(blocks: u16, blksz: u16, buf: &'a mut [u8]) -> Self {
        DataTransfer {
            blocks,
            blksz,
            write: false,
            use_dma: false,
            buf,
            error: None,
        }
    }

    pub fn write(blocks: u16, blksz: u16, buf: &'a mut [u8]) -> Self {
        DataTransfer {
            blocks,
            blksz,
            write: true,
            use_dma: false,
            buf,
            error: None,
        }
    }
}

/// A command descriptor plus its assembled packet and response state.
#[derive(Debug, Default)]
pub struct Command<'a> {
    /// SD opcode; ignored for native packets
    pub opcode: u8,
    /// SD argument; carried in the first payload word of DCMDs
    pub arg: u32,
    pub flags: CmdFlags,
    pub packet: Uhs2Packet,
    /// Folded legacy-style response words
    pub resp: [u32; 4],
    /// Verbatim native response bytes (when `resp_len` is 1..=20)
    pub uhs2_resp: Vec<u8, SDHCI_UHS2_PACKET_BYTES>,
    /// Requested native response length; 0 selects legacy folding
    pub resp_len: usize,
    pub busy_timeout_ms: u32,
    pub error: Option<Uhs2Error>,
    pub data: Option<DataTransfer<'a>>,
    /// Suppress negotiated transfer-mode extras (used before the link
    /// configuration is committed)
    pub init_tmode: bool,
}

impl Command<'_> {
    /// Build a native command around an assembled packet.
    pub fn native(packet: Uhs2Packet, resp_len: usize) -> Self {
        Command {
            packet,
            resp_len,
            ..Default::default()
        }
    }
}

/// Completion record drained by [`Uhs2Controller::request_done`].
#[derive(Debug, Clone, Copy)]
pub struct CompletedRequest {
    pub cmd_error: Option<Uhs2Error>,
    pub data_error: Option<Uhs2Error>,
    pub used_dma: bool,
}

/// Dataless command parked while the bus drains.
#[derive(Debug)]
struct DeferredCmd {
    packet: Uhs2Packet,
    opcode: u8,
    flags: CmdFlags,
    resp_len: usize,
    busy_timeout_ms: u32,
}

impl DeferredCmd {
    fn into_command(self) -> Command<'static> {
        Command {
            opcode: self.opcode,
            flags: self.flags,
            packet: self.packet,
            resp_len: self.resp_len,
            busy_timeout_ms: self.busy_timeout_ms,
            ..Default::default()
        }
    }
}

/// UHS-II host protocol engine.
///
/// Owns the register bus and all link state. Wrap it in a lock (see
/// [`crate::Uhs2Host`]) when it is shared between contexts.
pub struct Uhs2Controller<B: RegisterBus> {
    pub(crate) bus: B,
    pub quirks: Quirks,
    pub(crate) host_caps: Option<HostCapabilities>,
    pub(crate) card: Option<CardConfig>,
    pub(crate) ident: Option<CardIdent>,
    pub(crate) flags: LinkFlags,
    pub(crate) power_on: bool,
    pub(crate) clock_hz: u32,
    timeout_clk_khz: u32,
    pub(crate) cmd_inflight: bool,
    pub(crate) data_inflight: bool,
    pending_reset: bool,
    completed: Vec<CompletedRequest, 2>,
    deferred: Option<DeferredCmd>,
}

impl<B: RegisterBus> Uhs2Controller<B> {
    pub fn new(bus: B) -> Self {
        Uhs2Controller {
            bus,
            quirks: Quirks::empty(),
            host_caps: None,
            card: None,
            ident: None,
            flags: LinkFlags::empty(),
            power_on: false,
            clock_hz: 0,
            timeout_clk_khz: 10_000,
            cmd_inflight: false,
            data_inflight: false,
            pending_reset: false,
            completed: Vec::new(),
            deferred: None,
        }
    }

    /// Clock feeding the timeout counters, in kHz.
    pub fn set_timeout_clock(&mut self, khz: u32) {
        if khz > 0 {
            self.timeout_clk_khz = khz;
        }
    }

    /// True once attach has completed.
    pub fn is_initialized(&self) -> bool {
        self.flags.contains(LinkFlags::INITIALIZED)
    }

    /// Node ID assigned during enumeration (0 before attach).
    pub fn node_id(&self) -> u8 {
        self.card.as_ref().map_or(0, |c| c.node_id)
    }

    /// Identification data gathered during attach.
    pub fn ident(&self) -> Option<&CardIdent> {
        self.ident.as_ref()
    }

    /// Negotiated card configuration.
    pub fn card_config(&self) -> Option<&CardConfig> {
        self.card.as_ref()
    }

    // ------------------------------------------------------------------
    // Timeout counters
    // ------------------------------------------------------------------

    /// Smallest counter value whose 2^(13+n) timeout-clock window
    /// covers `target_us`, clamped to the register maximum.
    fn calc_timeout_count(&self, target_us: u32) -> u8 {
        if self.quirks.contains(Quirks::BROKEN_TIMEOUT_VAL) {
            return 0xE;
        }
        let mut count = 0u8;
        let mut window_us = (1u64 << 13) * 1000 / self.timeout_clk_khz as u64;
        while window_us < target_us as u64 && count < 0xE {
            count += 1;
            window_us <<= 1;
        }
        count
    }

    pub(crate) fn set_timer_ctrl(&mut self) {
        let cmd_res = self.calc_timeout_count(TIMER_CMD_RES_TARGET_US);
        let deadlock = self.calc_timeout_count(TIMER_DEADLOCK_TARGET_US);
        self.bus
            .write16(SDHCI_UHS2_TIMER_CTRL, make_uhs2_timer(cmd_res, deadlock));
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit a command. Returns `false` without touching the packet
    /// registers when the command line is still inhibited.
    pub fn send_command(&mut self, cmd: &mut Command<'_>) -> bool {
        if !cmd.packet.is_native() && cmd.opcode == SD_CMD_STOP_TRANSMISSION {
            cmd.flags |= CmdFlags::RSP_BUSY;
        }
        if self.bus.read32(SDHCI_PRESENT_STATE) & SDHCI_CMD_INHIBIT != 0 {
            return false;
        }
        if cmd.flags.contains(CmdFlags::RSP_136) && cmd.flags.contains(CmdFlags::RSP_BUSY) {
            log::warn!("unsupported response type: 136-bit with busy, dropping busy");
            cmd.flags.remove(CmdFlags::RSP_BUSY);
        }

        cmd.error = None;
        self.cmd_inflight = true;
        self.data_inflight = cmd.data.is_some();
        if cmd.data.is_some() || cmd.flags.contains(CmdFlags::RSP_BUSY) {
            self.set_timer_ctrl();
        }
        self.prepare_data(cmd);
        self.set_transfer_mode(cmd);
        self.write_packet(cmd);

        let mut cmd_reg = make_uhs2_cmd(cmd.packet.packet_len() as u16, 0);
        if cmd.data.is_some() {
            cmd_reg |= SDHCI_UHS2_CMD_DATA;
        }
        if cmd.packet.is_native() {
            match cmd.packet.ioadr() {
                UHS2_DEV_CMD_TRANS_ABORT => cmd_reg |= SDHCI_UHS2_CMD_TRNS_ABORT,
                UHS2_DEV_CMD_GO_DORMANT_STATE => cmd_reg |= SDHCI_UHS2_CMD_DORMANT,
                _ => {}
            }
        } else if cmd.opcode == SD_CMD_STOP_TRANSMISSION {
            cmd_reg |= SDHCI_UHS2_CMD_CMD12;
        }

        log::trace!(
            "UHS-II cmd: header={:#06x} arg={:#06x} reg={:#06x}",
            cmd.packet.header,
            cmd.packet.arg,
            cmd_reg
        );
        self.bus.write16(SDHCI_UHS2_COMMAND, cmd_reg);
        true
    }

    /// Submit with bounded retry while the command line is inhibited.
    ///
    /// One initial attempt plus [`INHIBIT_RETRIES`] more, a millisecond
    /// apart, re-checking card presence between attempts.
    pub fn send_command_retry(&mut self, cmd: &mut Command<'_>) -> Result<()> {
        let mut retries = INHIBIT_RETRIES;
        while !self.send_command(cmd) {
            if retries == 0 {
                log::error!("command inhibit never released");
                self.dump_regs();
                cmd.error = Some(Uhs2Error::Io);
                return Err(Uhs2Error::Io);
            }
            retries -= 1;
            self.bus.udelay(1000);
            if !self.bus.card_present() {
                cmd.error = Some(Uhs2Error::NoCard);
                return Err(Uhs2Error::NoCard);
            }
        }
        Ok(())
    }

    fn prepare_data(&mut self, cmd: &mut Command<'_>) {
        let Some(data) = &mut cmd.data else {
            return;
        };
        data.error = None;
        self.bus.write32(SDHCI_UHS2_BLOCK_SIZE, data.blksz as u32);
        self.bus.write32(SDHCI_UHS2_BLOCK_COUNT, data.blocks as u32);
        if data.write {
            self.bus.dma_write(data.buf);
        }
    }

    fn set_transfer_mode(&mut self, cmd: &Command<'_>) {
        let Some(data) = &cmd.data else {
            let mut mode = self.bus.read16(SDHCI_UHS2_TRANS_MODE);
            if cmd.packet.is_native() {
                if cmd.packet.ioadr() == UHS2_DEV_CMD_TRANS_ABORT {
                    mode = 0;
                }
            } else if cmd.opcode == SD_CMD_SEND_STATUS {
                mode = 0;
            } else if cmd.opcode == SD_CMD_STOP_TRANSMISSION || cmd.opcode == SD_CMD_ERASE {
                mode |= SDHCI_UHS2_TRNS_WAIT_EBSY;
            }
            self.bus.write16(SDHCI_UHS2_TRANS_MODE, mode);
            return;
        };

        let mut mode = SDHCI_UHS2_TRNS_BLK_CNT_EN | SDHCI_UHS2_TRNS_WAIT_EBSY;
        if data.write {
            mode |= SDHCI_UHS2_TRNS_WRITE;
        }
        if data.blocks == 1
            && data.blksz != 512
            && cmd.opcode != SD_CMD_READ_SINGLE_BLOCK
            && cmd.opcode != SD_CMD_WRITE_BLOCK
        {
            mode &= !SDHCI_UHS2_TRNS_BLK_CNT_EN;
            mode |= SDHCI_UHS2_TRNS_BYTE_MODE;
        }
        if data.use_dma {
            mode |= SDHCI_UHS2_TRNS_DMA;
        }
        if self.flags.contains(LinkFlags::HD_MODE) && !cmd.init_tmode {
            mode |= SDHCI_UHS2_TRNS_2L_HD;
        }
        self.bus.write16(SDHCI_UHS2_TRANS_MODE, mode);
    }

    fn write_packet(&mut self, cmd: &Command<'_>) {
        let packet = &cmd.packet;
        self.bus.write32(
            SDHCI_UHS2_CMD_PACKET,
            ((packet.arg as u32) << 16) | packet.header as u32,
        );
        let words = packet.payload_words().len();
        for i in 0..words {
            self.bus.write32(
                SDHCI_UHS2_CMD_PACKET_PAYLOAD + (i as u16) * 4,
                packet.payload_reg(i),
            );
        }
        // Zero-fill the rest of the packet area
        for i in words..4 {
            self.bus
                .write32(SDHCI_UHS2_CMD_PACKET_PAYLOAD + (i as u16) * 4, 0);
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    pub(crate) fn finish_command(&mut self, cmd: &mut Command<'_>) {
        if self.flags.contains(LinkFlags::INITIALIZED) {
            let status = self.bus.read8(SDHCI_UHS2_RESPONSE + 2);
            if status & UHS2_RES_NACK_MASK != 0 {
                // Logged only; the response is still consumed.
                log::error!(
                    "device NACKed the command, ecode={}",
                    (status >> UHS2_RES_ECODE_POS) & UHS2_RES_ECODE_MASK
                );
            }
        }

        let mut raw = [0u8; SDHCI_UHS2_PACKET_BYTES];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = self.bus.read8(SDHCI_UHS2_RESPONSE + i as u16);
        }
        packet::parse_response(cmd, &raw);
        self.cmd_inflight = false;
    }

    /// Poll the command through response and data/busy completion.
    pub fn wait_for_completion(&mut self, cmd: &mut Command<'_>) -> Result<()> {
        let cmd_timeout_us = CMD_TIMEOUT_MS.max(cmd.busy_timeout_ms).saturating_mul(1000);
        let mut waited = 0u32;
        loop {
            let status = self.bus.read32(SDHCI_INT_STATUS);
            if status & SDHCI_INT_ERROR != 0 {
                self.bus.write32(SDHCI_INT_STATUS, status);
                self.consume_error_irq(cmd);
                return self.complete_request(cmd);
            }
            if status & SDHCI_INT_RESPONSE != 0 {
                self.bus.write32(SDHCI_INT_STATUS, SDHCI_INT_RESPONSE);
                self.finish_command(cmd);
                break;
            }
            if waited >= cmd_timeout_us {
                log::error!("timeout waiting for command response");
                self.dump_regs();
                cmd.error = Some(Uhs2Error::Timeout);
                return self.complete_request(cmd);
            }
            self.bus.udelay(POLL_INTERVAL_US);
            waited = waited.saturating_add(POLL_INTERVAL_US);
        }

        let wait_end = cmd.data.is_some()
            || (cmd.flags.contains(CmdFlags::RSP_BUSY)
                && !self.quirks.contains(Quirks::NO_BUSY_IRQ));
        if wait_end {
            let data_timeout_us = DATA_TIMEOUT_MS
                .max(cmd.busy_timeout_ms)
                .saturating_mul(1000);
            let mut waited = 0u32;
            loop {
                let status = self.bus.read32(SDHCI_INT_STATUS);
                if status & SDHCI_INT_ERROR != 0 {
                    self.bus.write32(SDHCI_INT_STATUS, status);
                    self.consume_error_irq(cmd);
                    return self.complete_request(cmd);
                }
                if status & SDHCI_INT_DATA_END != 0 {
                    self.bus.write32(SDHCI_INT_STATUS, SDHCI_INT_DATA_END);
                    break;
                }
                if waited >= data_timeout_us {
                    log::error!("timeout waiting for transfer completion");
                    self.dump_regs();
                    match &mut cmd.data {
                        Some(data) => data.error = Some(Uhs2Error::Timeout),
                        None => cmd.error = Some(Uhs2Error::Timeout),
                    }
                    return self.complete_request(cmd);
                }
                self.bus.udelay(POLL_INTERVAL_US);
                waited = waited.saturating_add(POLL_INTERVAL_US);
            }
            if let Some(data) = &mut cmd.data {
                if !data.write {
                    self.bus.dma_read(data.buf);
                }
            }
        }
        self.complete_request(cmd)
    }

    fn consume_error_irq(&mut self, cmd: &mut Command<'_>) {
        self.handle_irq(SDHCI_INT_ERROR, Some(cmd));
    }

    /// Record the request outcome, drain completions and report.
    fn complete_request(&mut self, cmd: &mut Command<'_>) -> Result<()> {
        self.cmd_inflight = false;
        self.data_inflight = false;
        let data_error = cmd.data.as_ref().and_then(|d| d.error);
        let used_dma = cmd.data.as_ref().is_some_and(|d| d.use_dma);
        if cmd.error.is_some() || data_error.is_some() {
            self.pending_reset = true;
        }
        let record = CompletedRequest {
            cmd_error: cmd.error,
            data_error,
            used_dma,
        };
        if self.completed.push(record).is_err() {
            log::error!("completion queue overflow");
        }
        self.complete_work();

        match (cmd.error, data_error) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }

    /// Pop one finished request, releasing its DMA mapping on failure
    /// and running the deferred interface reset once the bus is idle.
    pub fn request_done(&mut self) -> Option<CompletedRequest> {
        let record = self.completed.pop()?;
        if record.used_dma && (record.cmd_error.is_some() || record.data_error.is_some()) {
            self.bus.dma_release();
        }
        if self.pending_reset {
            if self.cmd_inflight || self.data_inflight {
                // Another command still owns the bus; reset once it drains.
                if self.completed.push(record).is_err() {
                    log::error!("completion queue overflow, record dropped");
                }
                return None;
            }
            if let Err(e) = self.uhs2_reset(SDHCI_UHS2_SW_RESET_SD) {
                log::error!("post-error interface reset failed: {:?}", e);
            }
            self.pending_reset = false;
        }
        Some(record)
    }

    /// Drain finished requests, then run the parked command if any.
    pub fn complete_work(&mut self) {
        while self.request_done().is_some() {}
        if let Some(deferred) = self.deferred.take() {
            log::debug!("resuming deferred command");
            let mut cmd = deferred.into_command();
            if let Err(e) = self.execute(&mut cmd) {
                log::warn!("deferred command failed: {:?}", e);
            }
        }
    }

    /// Park a dataless command until the next completion drain. The
    /// slot holds exactly one command.
    pub fn defer_command(&mut self, cmd: &Command<'_>) -> Result<()> {
        if cmd.data.is_some() || self.deferred.is_some() {
            return Err(Uhs2Error::InvalidParameter);
        }
        self.deferred = Some(DeferredCmd {
            packet: cmd.packet.clone(),
            opcode: cmd.opcode,
            flags: cmd.flags,
            resp_len: cmd.resp_len,
            busy_timeout_ms: cmd.busy_timeout_ms,
        });
        Ok(())
    }

    /// Run a command to completion.
    pub fn execute(&mut self, cmd: &mut Command<'_>) -> Result<()> {
        match self.send_command_retry(cmd) {
            Ok(()) => self.wait_for_completion(cmd),
            Err(_) => self.complete_request(cmd),
        }
    }
}
