//! A decoding library for the ARM ETMv3.5 and MTB CPU instruction-trace
//! packet protocols (ARMv7-M architecture reference manual, Appendix D4).
//!
//! The decoder is push-driven: feed it bytes through [`Decoder::pump`] as
//! they arrive off the wire, and it calls back into a [`TraceConsumer`]
//! once per fully decoded message. It never blocks, never allocates on the
//! hot path, and never returns a hard error: malformed input is reported
//! through the consumer and the decoder resynchronises at the next packet
//! boundary.

mod cpu_state;
mod error;
mod etm;
mod mtb;

pub use cpu_state::{AddrMode, ChangeKind, ChangeSet, CpuState};
pub use error::{ProtocolError, Stats, TraceConsumer, Verbosity};
pub use etm::{ContextIdWidth, EtmConfig};

use etm::EtmDecoder;
use mtb::MtbDecoder;

/// Which wire protocol the trace source is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Etm35,
    Mtb,
}

/// Decoder-wide configuration (component B). `etm` is ignored while
/// [`Protocol::Mtb`] is selected and vice versa.
#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    pub protocol: Protocol,
    pub etm: EtmConfig,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions {
            protocol: Protocol::Etm35,
            etm: EtmConfig::default(),
        }
    }
}

/// Top-level decoder. Owns the reconstructed [`CpuState`], the
/// protocol-specific state machine (ETM or MTB), and sync/loss counters.
pub struct Decoder {
    options: DecoderOptions,
    cpu: CpuState,
    etm: EtmDecoder,
    mtb: MtbDecoder,
    stats: Stats,
    mtb_pending: Option<u32>,
}

impl Decoder {
    pub fn new(options: DecoderOptions) -> Self {
        Decoder {
            etm: EtmDecoder::new(options.etm),
            mtb: MtbDecoder::default(),
            cpu: CpuState::default(),
            stats: Stats::default(),
            mtb_pending: None,
            options,
        }
    }

    /// Feed a chunk of trace bytes through the decoder, invoking
    /// `consumer.on_message` once per completed message. Under
    /// [`Protocol::Mtb`], `buf` is interpreted as a stream of 8-byte
    /// (source, destination) little-endian address pairs; a trailing
    /// incomplete pair is buffered until the next call.
    pub fn pump<C: TraceConsumer>(&mut self, buf: &[u8], consumer: &mut C) {
        match self.options.protocol {
            Protocol::Etm35 => {
                for &c in buf {
                    self.etm.pump_byte(c, &mut self.cpu, &mut self.stats, consumer);
                }
            }
            Protocol::Mtb => self.pump_mtb(buf, consumer),
        }
    }

    fn pump_mtb<C: TraceConsumer>(&mut self, buf: &[u8], consumer: &mut C) {
        let mut words = buf.chunks_exact(4).map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));

        loop {
            let source = match self.mtb_pending.take().or_else(|| words.next()) {
                Some(w) => w,
                None => break,
            };
            let dest = match words.next() {
                Some(w) => w,
                None => {
                    self.mtb_pending = Some(source);
                    break;
                }
            };

            if self.mtb.pump_pair(source, dest, &mut self.cpu) {
                consumer.on_message(&self.cpu);
            }
        }
    }

    /// Force synchronisation state without waiting for an A-Sync sequence
    /// (or, for MTB, the fixed-size pair framing) to occur naturally.
    /// Passing `false` discards all in-flight accumulator state.
    pub fn force_sync(&mut self, synced: bool) {
        match self.options.protocol {
            Protocol::Etm35 => self.etm.force_sync(synced),
            Protocol::Mtb => self.mtb.force_sync(synced),
        }
        if synced {
            self.stats.sync_count += 1;
        } else {
            self.stats.lost_sync_count += 1;
            self.mtb_pending = None;
        }
    }

    pub fn is_synced(&self) -> bool {
        match self.options.protocol {
            Protocol::Etm35 => self.etm.is_synced(),
            Protocol::Mtb => self.mtb.is_synced(),
        }
    }

    /// Switch protocols mid-stream. Resets synchronisation state for both
    /// state machines, since a byte stream synced under one protocol
    /// carries no meaning under the other.
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.options.protocol = protocol;
        self.etm.force_sync(false);
        self.mtb.reset();
        self.mtb_pending = None;
    }

    pub fn set_alt_addr_encode(&mut self, using_alt_addr_encode: bool) {
        self.options.etm.using_alt_addr_encode = using_alt_addr_encode;
        self.etm.set_config(self.options.etm);
    }

    pub fn set_etm_config(&mut self, config: EtmConfig) {
        self.options.etm = config;
        self.etm.set_config(config);
    }

    pub fn zero_stats(&mut self) {
        self.stats.zero();
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu
    }

    /// Test-and-clear a single bit of the sticky change-bitmask.
    pub fn take_change(&mut self, kind: ChangeKind) -> bool {
        self.cpu.changes.take(kind)
    }
}
