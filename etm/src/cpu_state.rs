//! The decoder's externally-visible view of the traced processor
//! (component A), and the sticky change-bitmask that lets a consumer find
//! out what moved since it last looked (component G).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Instruction set the processor is currently executing. (Appendix D4,
/// addrMode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AddrMode {
    #[default]
    Arm,
    Thumb,
    Jazelle,
}

/// One bit of the sticky change-bitmask. The discriminant is the bit
/// index, so [`ChangeSet`] needs no separately maintained constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum ChangeKind {
    Address = 0,
    Exception,
    Cancelled,
    AltIsa,
    Hyp,
    Secure,
    Jazelle,
    Thumb,
    Reason,
    IsLsiP,
    ContextId,
    Vmid,
    Timestamp,
    CycleCount,
    TraceStart,
    Linear,
    ENAtoms,
    WAtoms,
    ExEntry,
    ExExit,
    Trigger,
    ClockSpeed,
    Resume,
}

/// Sticky bitmask of [`ChangeKind`]s raised since the consumer last polled.
/// Bits are set internally by the decoder and cleared only by
/// [`take`](ChangeSet::take), never implicitly by the decoder itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeSet(u32);

impl ChangeSet {
    pub(crate) fn set(&mut self, kind: ChangeKind) {
        self.0 |= 1 << kind as u32;
    }

    /// Test-and-clear: returns whether `kind` was set, and clears it.
    /// Idempotent: calling twice in a row returns `true` then `false`.
    pub fn take(&mut self, kind: ChangeKind) -> bool {
        let bit = 1 << kind as u32;
        let was_set = self.0 & bit != 0;
        self.0 &= !bit;
        was_set
    }

    pub fn is_set(&self, kind: ChangeKind) -> bool {
        self.0 & (1 << kind as u32) != 0
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Reconstructed processor view. Only ever mutated by the decoder; the
/// consumer sees it through [`Decoder::cpu_state`](crate::Decoder::cpu_state)
/// and [`Decoder::take_change`](crate::Decoder::take_change).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CpuState {
    pub(crate) addr: u32,
    /// MTB only: predicted next fetch address.
    pub(crate) next_addr: u32,
    /// MTB only: branch source address.
    pub(crate) to_addr: u32,
    pub(crate) addr_mode: AddrMode,
    pub(crate) thumb: bool,
    pub(crate) jazelle: bool,
    pub(crate) alt_isa: bool,
    pub(crate) non_secure: bool,
    pub(crate) hyp: bool,
    pub(crate) context_id: u32,
    pub(crate) vmid: u8,
    pub(crate) ts: u64,
    pub(crate) cycle_count: u32,
    /// Cumulative count of executed instructions implied by P-headers.
    pub(crate) inst_count: u64,
    pub(crate) eatoms: u8,
    pub(crate) natoms: u8,
    pub(crate) watoms: u8,
    /// Bit *k* set iff the (*k*+1)-th atom of the most recent P-header executed.
    pub(crate) disposition: u16,
    pub(crate) exception: u16,
    pub(crate) resume: u8,
    pub(crate) reason: u8,
    pub(crate) is_lsip: bool,

    pub(crate) changes: ChangeSet,
}

impl CpuState {
    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn next_addr(&self) -> u32 {
        self.next_addr
    }

    pub fn to_addr(&self) -> u32 {
        self.to_addr
    }

    pub fn addr_mode(&self) -> AddrMode {
        self.addr_mode
    }

    pub fn thumb(&self) -> bool {
        self.thumb
    }

    pub fn jazelle(&self) -> bool {
        self.jazelle
    }

    pub fn alt_isa(&self) -> bool {
        self.alt_isa
    }

    pub fn non_secure(&self) -> bool {
        self.non_secure
    }

    pub fn hyp(&self) -> bool {
        self.hyp
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn vmid(&self) -> u8 {
        self.vmid
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycle_count
    }

    pub fn inst_count(&self) -> u64 {
        self.inst_count
    }

    pub fn eatoms(&self) -> u8 {
        self.eatoms
    }

    pub fn natoms(&self) -> u8 {
        self.natoms
    }

    pub fn watoms(&self) -> u8 {
        self.watoms
    }

    pub fn disposition(&self) -> u16 {
        self.disposition
    }

    pub fn exception(&self) -> u16 {
        self.exception
    }

    pub fn resume(&self) -> u8 {
        self.resume
    }

    pub fn reason(&self) -> u8 {
        self.reason
    }

    pub fn is_lsip(&self) -> bool {
        self.is_lsip
    }

    /// Set a boolean field and, iff the value actually changed, raise the
    /// matching change bit. Used for the mode flags that multiple packet
    /// families can touch (THUMB, ALTISA, HYP, SECURE, JAZELLE).
    pub(crate) fn set_flag_changed(&mut self, field: &mut bool, new: bool, kind: ChangeKind) {
        if *field != new {
            self.changes.set(kind);
        }
        *field = new;
    }

    pub(crate) fn set_context_id_changed(&mut self, new: u32) {
        if self.context_id != new {
            self.changes.set(ChangeKind::ContextId);
        }
        self.context_id = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_and_is_idempotent() {
        let mut changes = ChangeSet::default();
        changes.set(ChangeKind::Thumb);
        assert!(changes.take(ChangeKind::Thumb));
        assert!(!changes.take(ChangeKind::Thumb));
    }

    #[test]
    fn is_set_does_not_clear() {
        let mut changes = ChangeSet::default();
        changes.set(ChangeKind::Vmid);
        assert!(changes.is_set(ChangeKind::Vmid));
        assert!(changes.is_set(ChangeKind::Vmid));
        assert!(changes.take(ChangeKind::Vmid));
    }

    #[test]
    fn unrelated_bits_are_independent() {
        let mut changes = ChangeSet::default();
        changes.set(ChangeKind::Address);
        assert!(!changes.is_set(ChangeKind::Exception));
        changes.clear();
        assert!(!changes.is_set(ChangeKind::Address));
    }

    #[test]
    fn set_flag_changed_raises_only_on_transition() {
        let mut cpu = CpuState::default();
        let mut thumb = cpu.thumb;
        cpu.set_flag_changed(&mut thumb, false, ChangeKind::Thumb);
        cpu.thumb = thumb;
        assert!(!cpu.changes.take(ChangeKind::Thumb));

        let mut thumb = cpu.thumb;
        cpu.set_flag_changed(&mut thumb, true, ChangeKind::Thumb);
        cpu.thumb = thumb;
        assert!(cpu.changes.take(ChangeKind::Thumb));
    }

    #[test]
    fn set_context_id_changed_raises_only_on_transition() {
        let mut cpu = CpuState::default();
        cpu.set_context_id_changed(0);
        assert!(!cpu.changes.take(ChangeKind::ContextId));
        cpu.set_context_id_changed(42);
        assert!(cpu.changes.take(ChangeKind::ContextId));
    }
}
