//! ETM packet state machine (component C). Per-octet dispatch and decode
//! for the ETMv3.5 byte stream (ARMv7-M architecture reference manual,
//! Appendix D4).
//!
//! The decoder's states are a tagged sum type (design note: a flat integer
//! state plus loose accumulator fields invites exactly the kind of
//! forgotten-reinitialisation bug this shape rules out at compile time), and
//! each variant carries only the accumulators relevant to that state.

use crate::cpu_state::{AddrMode, ChangeKind, CpuState};
use crate::error::{ProtocolError, Stats, TraceConsumer, Verbosity};

/// Configured width of context-ID fields in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextIdWidth {
    B0,
    B1,
    B2,
    B4,
}

impl ContextIdWidth {
    fn bytes(self) -> u8 {
        match self {
            ContextIdWidth::B0 => 0,
            ContextIdWidth::B1 => 1,
            ContextIdWidth::B2 => 2,
            ContextIdWidth::B4 => 4,
        }
    }
}

/// ETM-specific decoder configuration (component B's configuration half).
#[derive(Debug, Clone, Copy)]
pub struct EtmConfig {
    pub using_alt_addr_encode: bool,
    pub context_id_width: ContextIdWidth,
    pub cycle_accurate: bool,
    pub data_only_mode: bool,
}

impl Default for EtmConfig {
    fn default() -> Self {
        EtmConfig {
            using_alt_addr_encode: false,
            context_id_width: ContextIdWidth::B0,
            cycle_accurate: false,
            data_only_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
enum EtmState {
    Unsynced,
    /// Synced at the byte level, but the first I-Sync has not yet been
    /// seen: no message may be emitted from here (invariant 2).
    WaitIsync,
    /// Synced and at least one I-Sync has completed.
    Idle,

    /// COLLECT_BA_STD_FORMAT (`std == true`) / COLLECT_BA_ALT_FORMAT
    /// (`std == false`).
    CollectBranchAddress { std: bool, byte_count: u8, addr: u32 },
    CollectException { byte_count: u8 },
    GetVmid,
    GetTimestamp { byte_count: u8, ts: u64 },
    GetCycleCount { byte_count: u8, cycles: u32, in_isync: bool },
    GetContextId { byte_count: u8, context_id: u32 },

    GetContextByte { byte_count: u8, context_id: u32 },
    GetInfoByte,
    GetIAddress { byte_count: u8, addr: u32 },
}

/// Per-octet, push-driven decoder for the ETMv3.5 packet stream.
pub(crate) struct EtmDecoder {
    state: EtmState,
    async_count: u32,
    rxed_isync: bool,
    config: EtmConfig,
}

impl EtmDecoder {
    pub(crate) fn new(config: EtmConfig) -> Self {
        EtmDecoder {
            state: EtmState::Unsynced,
            async_count: 0,
            rxed_isync: false,
            config,
        }
    }

    pub(crate) fn set_config(&mut self, config: EtmConfig) {
        self.config = config;
    }

    pub(crate) fn is_synced(&self) -> bool {
        !matches!(self.state, EtmState::Unsynced)
    }

    pub(crate) fn force_sync(&mut self, synced: bool) {
        if synced {
            self.async_count = 0;
            self.state = self.resting_state();
        } else {
            self.state = EtmState::Unsynced;
            self.async_count = 0;
            self.rxed_isync = false;
        }
    }

    fn resting_state(&self) -> EtmState {
        if self.rxed_isync {
            EtmState::Idle
        } else {
            EtmState::WaitIsync
        }
    }

    fn emit<C: TraceConsumer>(&self, cpu: &CpuState, consumer: &mut C) {
        if self.rxed_isync {
            consumer.on_message(cpu);
        }
    }

    /// Consume exactly one octet.
    pub(crate) fn pump_byte<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        stats: &mut Stats,
        consumer: &mut C,
    ) {
        // The A-Sync check runs before per-state dispatch only while
        // UNSYNCED; once synced, a run of zero bytes is instead handled as
        // the IDLE no-op packet (see `dispatch_resting`).
        if let EtmState::Unsynced = self.state {
            if c == 0x00 {
                self.async_count += 1;
            } else if self.async_count >= 5 && c == 0x80 {
                self.async_count = 0;
                self.state = self.resting_state();
                stats.sync_count += 1;
                log::debug!("A-Sync sequence recognised, decoder synchronised");
            } else {
                self.async_count = 0;
            }
            return;
        }

        let state = std::mem::replace(&mut self.state, EtmState::Idle);
        self.state = match state {
            EtmState::Unsynced => unreachable!("handled above"),
            EtmState::WaitIsync | EtmState::Idle => self.dispatch_resting(c, cpu, consumer),
            EtmState::CollectBranchAddress { std, byte_count, addr } => {
                self.continue_branch_address(std, byte_count, addr, c, cpu, consumer)
            }
            EtmState::CollectException { byte_count } => {
                self.continue_exception(byte_count, c, cpu, consumer)
            }
            EtmState::GetVmid => self.finish_vmid(c, cpu, consumer),
            EtmState::GetTimestamp { byte_count, ts } => {
                self.continue_timestamp(byte_count, ts, c, cpu, consumer)
            }
            EtmState::GetCycleCount { byte_count, cycles, in_isync } => {
                self.continue_cycle_count(byte_count, cycles, in_isync, c, cpu, consumer)
            }
            EtmState::GetContextId { byte_count, context_id } => {
                self.continue_context_id(byte_count, context_id, c, cpu, consumer)
            }
            EtmState::GetContextByte { byte_count, context_id } => {
                self.continue_context_byte(byte_count, context_id, c, cpu)
            }
            EtmState::GetInfoByte => self.finish_info_byte(c, cpu, consumer),
            EtmState::GetIAddress { byte_count, addr } => {
                self.continue_iaddress(byte_count, addr, c, cpu, consumer)
            }
        };
    }

    /// IDLE / WAIT_ISYNC dispatch: identifies one of the ETM packet
    /// families from the first octet. Order matters, see spec.
    fn dispatch_resting<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        // Branch address byte 0 (xxxxxxx1): checked first, as it would
        // otherwise overlap every other pattern below.
        if c & 1 == 1 {
            self.async_count = 0;
            return self.begin_branch_address(c, cpu, consumer);
        }

        if c == 0b0000_0000 {
            // A-Sync filler; also a no-op packet while already synced.
            self.async_count += 1;
            return self.resting_state();
        }
        self.async_count = 0;

        if c == 0b0000_0100 {
            return EtmState::GetCycleCount { byte_count: 0, cycles: 0, in_isync: false };
        }

        if c == 0b0000_1000 {
            return self.begin_isync(cpu);
        }

        if c == 0b0111_0000 {
            return EtmState::GetCycleCount { byte_count: 0, cycles: 0, in_isync: true };
        }

        if c == 0b0000_1100 {
            cpu.changes.set(ChangeKind::Trigger);
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        if c == 0b0011_1100 {
            return EtmState::GetVmid;
        }

        // Timestamp: 01000x1x, mask 11111011 == 01000010.
        if c & 0b1111_1011 == 0b0100_0010 {
            if c & 0b0000_0100 != 0 {
                cpu.changes.set(ChangeKind::ClockSpeed);
            }
            return EtmState::GetTimestamp { byte_count: 0, ts: 0 };
        }

        if c == 0b0110_0110 {
            // Ignore packet.
            return self.resting_state();
        }

        if c == 0b0110_1110 {
            return EtmState::GetContextId { byte_count: 0, context_id: 0 };
        }

        if c == 0b0111_0110 {
            cpu.changes.set(ChangeKind::ExExit);
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        if c == 0b0111_1110 {
            cpu.changes.set(ChangeKind::ExEntry);
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        if c & 1 == 0 && c & 0x80 != 0 {
            // P-header: 1xxxxxxx0.
            return self.dispatch_pheader(c, cpu, consumer);
        }

        let err = ProtocolError::UnrecognisedByte(c);
        log::warn!("{}", err);
        consumer.on_report(Verbosity::Error, format_args!("{}", err));
        self.resting_state()
    }

    fn dispatch_pheader<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        let (eatoms, natoms, watoms, disposition): (u8, u8, u8, u16);

        if !self.config.cycle_accurate {
            if c & 0b0000_0010 == 0 {
                // Format 1. The distinguishing bit is bit1 (0 here); the
                // mask below follows from the eatoms/natoms bit positions,
                // not the (internally inconsistent) table literal.
                if c & 0b1000_0011 != 0b1000_0000 {
                    return self.report_bad_pheader(c, consumer);
                }
                eatoms = (c & 0x3C) >> 2;
                natoms = (c >> 6) & 1;
                watoms = 0;
                disposition = (1u16 << eatoms) - 1;
            } else if c & 0b1111_0011 == 0b1000_0010 {
                // Format 2: two atoms.
                let e0 = (c >> 3) & 1 == 0;
                let e1 = (c >> 2) & 1 == 0;
                eatoms = e0 as u8 + e1 as u8;
                natoms = 2 - eatoms;
                watoms = 0;
                disposition = (e0 as u16) | ((e1 as u16) << 1);
            } else {
                return self.report_bad_pheader(c, consumer);
            }
        } else if c == 0b1000_0000 {
            // Format 0: one wait atom.
            eatoms = 0;
            natoms = 0;
            watoms = 1;
            disposition = 0;
        } else if c & 0b1010_0011 == 0b1000_0000 {
            // Format 1 (cycle-accurate).
            eatoms = (c & 0x1C) >> 2;
            natoms = (c >> 6) & 1;
            watoms = eatoms + natoms;
            disposition = (1u16 << eatoms) - 1;
        } else if c & 0b1111_0011 == 0b1000_0010 {
            // Format 2: two atoms plus one wait.
            let e0 = (c >> 3) & 1 == 0;
            let e1 = (c >> 2) & 1 == 0;
            eatoms = e0 as u8 + e1 as u8;
            natoms = 2 - eatoms;
            watoms = 1;
            disposition = (e0 as u16) | ((e1 as u16) << 1);
        } else if c & 0b1010_0000 == 0b1010_0000 {
            // Format 3.
            watoms = (c & 0x1C) >> 2;
            eatoms = (c >> 6) & 1;
            natoms = 0;
            disposition = (1u16 << eatoms) - 1;
        } else if c & 0b1111_1011 == 0b1001_0010 {
            // Format 4: one atom, no wait.
            if c & 0b0000_0100 != 0 {
                eatoms = 0;
                natoms = 1;
            } else {
                eatoms = 1;
                natoms = 0;
            }
            watoms = 0;
            disposition = (1u16 << eatoms) - 1;
        } else {
            return self.report_bad_pheader(c, consumer);
        }

        cpu.eatoms = eatoms;
        cpu.natoms = natoms;
        cpu.watoms = watoms;
        cpu.disposition = disposition;
        cpu.changes.set(ChangeKind::ENAtoms);
        if self.config.cycle_accurate {
            cpu.changes.set(ChangeKind::WAtoms);
            cpu.inst_count += watoms as u64;
        } else {
            cpu.inst_count += (eatoms + natoms) as u64;
        }

        self.emit(cpu, consumer);
        self.resting_state()
    }

    fn report_bad_pheader<C: TraceConsumer>(&mut self, c: u8, consumer: &mut C) -> EtmState {
        let err = ProtocolError::UnrecognisedPHeader(c);
        log::warn!("{}", err);
        consumer.on_report(Verbosity::Error, format_args!("{}", err));
        self.resting_state()
    }

    fn begin_branch_address<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        // Branch-address packets are differential: a single byte carries
        // only 6-7 bits, so byte 0 clears and reseeds just its own window
        // of the *existing* address, leaving the untouched bits as they
        // were.
        let (window, seed) = match cpu.addr_mode {
            AddrMode::Arm => (0xFCu32, (c as u32 & 0x7E) << 1),
            AddrMode::Thumb => (0x7Fu32, c as u32 & 0x7E),
            AddrMode::Jazelle => (0x3Fu32, (c as u32 & 0x7E) >> 1),
        };
        let addr = (cpu.addr & !window) | seed;
        cpu.changes.set(ChangeKind::Address);

        if c & 0x80 == 0 {
            // Single-byte branch address, no exception information.
            cpu.addr = addr;
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        EtmState::CollectBranchAddress {
            std: !self.config.using_alt_addr_encode,
            byte_count: 1,
            addr,
        }
    }

    fn continue_branch_address<C: TraceConsumer>(
        &mut self,
        std: bool,
        byte_count: u8,
        mut addr: u32,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        let ofs: i32 = match cpu.addr_mode {
            AddrMode::Arm => 1,
            AddrMode::Thumb => 0,
            AddrMode::Jazelle => -1,
        };
        let idx = byte_count as i32;
        let will_be_fifth = byte_count == 4;

        if std {
            let c_bit = if will_be_fifth { c & 0x40 != 0 } else { c & 0x80 != 0 };

            if will_be_fifth && c_bit {
                // Legacy 5-byte ARM form: this byte carries exception
                // information, not address bits.
                cpu.addr = addr;
                cpu.exception = ((c >> 4) & 0x07) as u16;
                cpu.changes.set(ChangeKind::Exception);
                if c & 0x40 != 0 {
                    cpu.changes.set(ChangeKind::Cancelled);
                }
                self.emit(cpu, consumer);
                return self.resting_state();
            }

            let bit_offset = (7 * idx + ofs) as u32;
            let window = 0x7Fu32 << bit_offset;
            addr = (addr & !window) | (((c as u32) & 0x7F) << bit_offset);

            if !c_bit || will_be_fifth {
                cpu.addr = addr;
                self.emit(cpu, consumer);
                return self.resting_state();
            }

            EtmState::CollectBranchAddress { std, byte_count: byte_count + 1, addr }
        } else {
            let continuing = c & 0x80 != 0;
            let exception_follows = !continuing && (c & 0x40 != 0);

            if exception_follows {
                cpu.addr = addr;
                cpu.resume = 0;
                cpu.changes.set(ChangeKind::ExEntry);
                return EtmState::CollectException { byte_count: 0 };
            }

            let mask: u32 = if continuing { 0x7F } else { 0x3F };
            let bit_offset = (7 * idx + ofs) as u32;
            let window = mask << bit_offset;
            addr = (addr & !window) | (((c as u32) & mask) << bit_offset);

            if !continuing || byte_count + 1 == 5 {
                cpu.addr = addr;
                self.emit(cpu, consumer);
                return self.resting_state();
            }

            EtmState::CollectBranchAddress { std, byte_count: byte_count + 1, addr }
        }
    }

    fn continue_exception<C: TraceConsumer>(
        &mut self,
        byte_count: u8,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        match byte_count {
            0 => {
                let non_secure = c & 0x01 != 0;
                let mut ns = cpu.non_secure;
                cpu.set_flag_changed(&mut ns, non_secure, ChangeKind::Secure);
                cpu.non_secure = ns;

                cpu.exception = (cpu.exception & !0x0F) | (((c >> 1) & 0x0F) as u16);

                if c & 0x20 != 0 {
                    cpu.changes.set(ChangeKind::Cancelled);
                }

                let mut alt_isa = cpu.alt_isa;
                cpu.set_flag_changed(&mut alt_isa, c & 0x40 != 0, ChangeKind::AltIsa);
                cpu.alt_isa = alt_isa;

                if c & 0x80 == 0 {
                    self.emit(cpu, consumer);
                    return self.resting_state();
                }

                EtmState::CollectException { byte_count: 1 }
            }
            1 => {
                if c & 0x80 != 0 {
                    // Exception byte 1.
                    cpu.exception |= ((c as u16) & 0x1F) << 4;

                    let mut hyp = cpu.hyp;
                    cpu.set_flag_changed(&mut hyp, c & 0x20 != 0, ChangeKind::Hyp);
                    cpu.hyp = hyp;

                    if c & 0x40 == 0 {
                        self.emit(cpu, consumer);
                        return self.resting_state();
                    }

                    EtmState::CollectException { byte_count: 2 }
                } else {
                    // Exception byte 2 (byte 1 was skipped).
                    cpu.resume = c & 0x0F;
                    if cpu.resume != 0 {
                        cpu.changes.set(ChangeKind::Resume);
                    }
                    self.emit(cpu, consumer);
                    self.resting_state()
                }
            }
            _ => {
                cpu.resume = c & 0x0F;
                if cpu.resume != 0 {
                    cpu.changes.set(ChangeKind::Resume);
                }
                self.emit(cpu, consumer);
                self.resting_state()
            }
        }
    }

    fn finish_vmid<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        if cpu.vmid != c {
            cpu.changes.set(ChangeKind::Vmid);
        }
        cpu.vmid = c;
        self.emit(cpu, consumer);
        self.resting_state()
    }

    /// Accumulator windows are `0x7F << byte_count` for bytes 0..7 and
    /// `0xFF << 8` for byte 8, not `7 * byte_count`. This almost
    /// certainly loses bits beyond byte 1, but is preserved verbatim
    /// pending hardware trace comparison (spec open question).
    fn continue_timestamp<C: TraceConsumer>(
        &mut self,
        byte_count: u8,
        mut ts: u64,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        if byte_count < 8 {
            let window = 0x7Fu64 << byte_count;
            ts = (ts & !window) | (((c as u64) & 0x7F) << byte_count) & window;
        } else {
            let window = 0xFFu64 << 8;
            ts = (ts & !window) | ((c as u64) << 8) & window;
        }

        let next_count = byte_count + 1;
        if c & 0x80 == 0 || next_count == 9 {
            cpu.ts = ts;
            cpu.changes.set(ChangeKind::Timestamp);
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        EtmState::GetTimestamp { byte_count: next_count, ts }
    }

    fn continue_cycle_count<C: TraceConsumer>(
        &mut self,
        byte_count: u8,
        mut cycles: u32,
        in_isync: bool,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        cycles |= ((c as u32) & 0x7F) << (7 * byte_count as u32);
        let next_count = byte_count + 1;

        if c & 0x80 == 0 || next_count == 5 {
            cpu.cycle_count = cycles;
            cpu.changes.set(ChangeKind::CycleCount);
            if in_isync {
                return self.begin_isync(cpu);
            }
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        EtmState::GetCycleCount { byte_count: next_count, cycles, in_isync }
    }

    fn continue_context_id<C: TraceConsumer>(
        &mut self,
        byte_count: u8,
        mut context_id: u32,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        context_id |= (c as u32) << (8 * byte_count as u32);
        let next_count = byte_count + 1;

        if next_count >= self.config.context_id_width.bytes() {
            cpu.set_context_id_changed(context_id);
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        EtmState::GetContextId { byte_count: next_count, context_id }
    }

    /// Entered on the Normal I-Sync header, or once a preceding
    /// GET_ICYCLECOUNT sequence has committed its cycle count.
    fn begin_isync(&mut self, cpu: &mut CpuState) -> EtmState {
        if !self.rxed_isync {
            self.rxed_isync = true;
            cpu.changes.clear();
            log::debug!("first I-Sync received, messages will now be emitted");
        }

        if self.config.context_id_width.bytes() > 0 {
            EtmState::GetContextByte { byte_count: 0, context_id: 0 }
        } else {
            EtmState::GetInfoByte
        }
    }

    fn continue_context_byte(
        &mut self,
        byte_count: u8,
        mut context_id: u32,
        c: u8,
        cpu: &mut CpuState,
    ) -> EtmState {
        context_id |= (c as u32) << (8 * byte_count as u32);
        let next_count = byte_count + 1;

        if next_count >= self.config.context_id_width.bytes() {
            cpu.set_context_id_changed(context_id);
            EtmState::GetInfoByte
        } else {
            EtmState::GetContextByte { byte_count: next_count, context_id }
        }
    }

    fn finish_info_byte<C: TraceConsumer>(
        &mut self,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        let is_lsip = c & 0x80 != 0;
        let reason = (c & 0x60) >> 5;
        let jazelle = c & 0x10 != 0;
        let non_secure = c & 0x08 != 0;
        let alt_isa = c & 0x04 != 0;
        let hyp = c & 0x02 != 0;

        if cpu.is_lsip != is_lsip {
            cpu.changes.set(ChangeKind::IsLsiP);
        }
        cpu.is_lsip = is_lsip;

        if cpu.reason != reason {
            cpu.changes.set(ChangeKind::Reason);
        }
        cpu.reason = reason;

        let mut j = cpu.jazelle;
        cpu.set_flag_changed(&mut j, jazelle, ChangeKind::Jazelle);
        cpu.jazelle = j;

        let mut ns = cpu.non_secure;
        cpu.set_flag_changed(&mut ns, non_secure, ChangeKind::Secure);
        cpu.non_secure = ns;

        let mut ai = cpu.alt_isa;
        cpu.set_flag_changed(&mut ai, alt_isa, ChangeKind::AltIsa);
        cpu.alt_isa = ai;

        let mut hy = cpu.hyp;
        cpu.set_flag_changed(&mut hy, hyp, ChangeKind::Hyp);
        cpu.hyp = hy;

        if self.config.data_only_mode {
            self.emit(cpu, consumer);
            return self.resting_state();
        }

        EtmState::GetIAddress { byte_count: 0, addr: 0 }
    }

    fn continue_iaddress<C: TraceConsumer>(
        &mut self,
        byte_count: u8,
        mut addr: u32,
        c: u8,
        cpu: &mut CpuState,
        consumer: &mut C,
    ) -> EtmState {
        addr |= (c as u32) << (8 * byte_count as u32);
        let next_count = byte_count + 1;

        if next_count < 4 {
            return EtmState::GetIAddress { byte_count: next_count, addr };
        }

        if cpu.jazelle {
            cpu.addr_mode = AddrMode::Jazelle;
            cpu.addr = addr;
        } else {
            let thumb = addr & 1 != 0;
            let mut t = cpu.thumb;
            cpu.set_flag_changed(&mut t, thumb, ChangeKind::Thumb);
            cpu.thumb = t;
            cpu.addr_mode = if thumb { AddrMode::Thumb } else { AddrMode::Arm };
            cpu.addr = if thumb { addr } else { addr & 0xFFFF_FFFC };
        }
        cpu.changes.set(ChangeKind::Address);

        self.emit(cpu, consumer);
        self.resting_state()
    }
}
