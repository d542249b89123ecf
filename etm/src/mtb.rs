//! MTB decoder (component D). Deliberately thin: a (source, destination)
//! 32-bit address pair maps directly onto one state transition and, from
//! the second pair onward, one emitted message. No variable-length
//! encodings, no sub-states.

use crate::cpu_state::{ChangeKind, CpuState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtbState {
    Unsynced,
    Idle,
}

#[derive(Debug, Clone)]
pub(crate) struct MtbDecoder {
    state: MtbState,
}

impl Default for MtbDecoder {
    fn default() -> Self {
        MtbDecoder {
            state: MtbState::Unsynced,
        }
    }
}

impl MtbDecoder {
    pub(crate) fn reset(&mut self) {
        self.state = MtbState::Unsynced;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.state != MtbState::Unsynced
    }

    pub(crate) fn force_sync(&mut self, synced: bool) {
        self.state = if synced {
            MtbState::Idle
        } else {
            MtbState::Unsynced
        };
    }

    /// Consume one (source, destination) pair. Returns `true` iff a
    /// message is ready to be emitted.
    pub(crate) fn pump_pair(&mut self, source: u32, dest: u32, cpu: &mut CpuState) -> bool {
        match self.state {
            MtbState::Unsynced => {
                cpu.next_addr = (dest & !1) | (source & 1);
                if dest & 1 != 0 {
                    cpu.changes.set(ChangeKind::TraceStart);
                }
                self.state = MtbState::Idle;
                false
            }
            MtbState::Idle => {
                if cpu.next_addr & 1 != 0 {
                    cpu.changes.set(ChangeKind::ExEntry);
                }
                if dest & 1 != 0 {
                    cpu.changes.set(ChangeKind::TraceStart);
                }

                cpu.addr = cpu.next_addr & !1;
                cpu.next_addr = (dest & !1) | (source & 1);
                cpu.to_addr = source & !1;
                cpu.exception = 0;

                cpu.changes.set(ChangeKind::Address);
                cpu.changes.set(ChangeKind::Linear);

                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pair_only_seeds_next_addr() {
        let mut decoder = MtbDecoder::default();
        let mut cpu = CpuState::default();
        let emitted = decoder.pump_pair(0x1000, 0x2000, &mut cpu);
        assert!(!emitted);
        assert_eq!(cpu.next_addr, 0x2000);
        assert!(decoder.is_synced());
    }

    #[test]
    fn second_pair_commits_and_emits() {
        let mut decoder = MtbDecoder::default();
        let mut cpu = CpuState::default();
        decoder.pump_pair(0x1000, 0x2000, &mut cpu);
        let emitted = decoder.pump_pair(0x3000, 0x4001, &mut cpu);
        assert!(emitted);
        assert_eq!(cpu.addr, 0x2000);
        assert_eq!(cpu.to_addr, 0x3000);
        assert_eq!(cpu.next_addr, 0x4000);
        assert!(cpu.changes.take(ChangeKind::Address));
        assert!(cpu.changes.take(ChangeKind::Linear));
    }

    #[test]
    fn odd_dest_raises_trace_start() {
        let mut decoder = MtbDecoder::default();
        let mut cpu = CpuState::default();
        decoder.pump_pair(0x1000, 0x2001, &mut cpu);
        assert!(cpu.changes.take(ChangeKind::TraceStart));
    }

    #[test]
    fn force_sync_resets_state() {
        let mut decoder = MtbDecoder::default();
        let mut cpu = CpuState::default();
        decoder.pump_pair(0x1000, 0x2000, &mut cpu);
        decoder.force_sync(false);
        assert!(!decoder.is_synced());
        decoder.reset();
        assert!(!decoder.is_synced());
    }
}
