//! Diagnostics, the consumer contract, and the protocol-violation taxonomy
//! (spec §6/§7). None of these are ever returned to the consumer as a hard
//! error: a malformed byte is reported through [`TraceConsumer::on_report`]
//! and the decoder carries on at the next natural packet boundary, per the
//! "never fatal" rule.

use std::fmt;

use crate::cpu_state::CpuState;

/// Severity of a diagnostic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Protocol violations the decoder can encounter mid-stream. Surfaced only
/// via [`TraceConsumer::on_report`] at [`Verbosity::Error`]; never returned
/// from [`crate::Decoder::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The first byte of a P-header matched none of Format 0-4 (or 1-2 in
    /// the non-cycle-accurate grammar).
    #[error("unrecognised P-header byte: {0:#010b}")]
    UnrecognisedPHeader(u8),

    /// The IDLE/WAIT_ISYNC dispatch saw a byte that matched no known packet
    /// family.
    #[error("unrecognised byte in IDLE state: {0:#010b}")]
    UnrecognisedByte(u8),
}

/// Consumer contract (spec §6). Both methods default to a no-op so a
/// consumer need only implement the half of the capability set it cares
/// about, the same "all handlers default to nop" shape used for dense
/// packet-dispatch traits elsewhere in this family of decoders.
pub trait TraceConsumer {
    /// Invoked synchronously, on the pumping thread, once a fully parsed
    /// message becomes available. Never invoked before the first I-Sync.
    #[allow(unused_variables)]
    fn on_message(&mut self, cpu: &CpuState) {}

    /// Optional diagnostic sink.
    #[allow(unused_variables)]
    fn on_report(&mut self, verbosity: Verbosity, message: fmt::Arguments<'_>) {}
}

/// Running counters for sync acquisition/loss (component F).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    /// Number of times the decoder has transitioned into sync (A-Sync
    /// acquired or `force_sync(true)`).
    pub sync_count: u64,
    /// Number of times the decoder has lost sync (`force_sync(false)`).
    pub lost_sync_count: u64,
}

impl Stats {
    pub(crate) fn zero(&mut self) {
        *self = Stats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_orders_by_severity() {
        assert!(Verbosity::Debug < Verbosity::Info);
        assert!(Verbosity::Info < Verbosity::Warn);
        assert!(Verbosity::Warn < Verbosity::Error);
    }

    #[test]
    fn unrecognised_pheader_display_is_binary() {
        let err = ProtocolError::UnrecognisedPHeader(0b1010_0101);
        assert_eq!(format!("{}", err), "unrecognised P-header byte: 0b10100101");
    }

    #[test]
    fn stats_zero_resets_both_counters() {
        let mut stats = Stats { sync_count: 3, lost_sync_count: 1 };
        stats.zero();
        assert_eq!(stats, Stats::default());
    }

    #[derive(Default)]
    struct Noop;
    impl TraceConsumer for Noop {}

    #[test]
    fn trace_consumer_defaults_are_nops() {
        let mut noop = Noop;
        noop.on_message(&CpuState::default());
        noop.on_report(Verbosity::Error, format_args!("unused"));
    }
}
