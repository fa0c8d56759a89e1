//! The per-preg constraint accumulator (component design §4.2).

use crate::error::{AllocatorError, Result};
use crate::location::RealizedAt;
use crate::reg::PregId;

/// Read/write intent a handle declares for its preg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The current value must be observed.
    Read,
    /// The preg will be overwritten; the old value need not be preserved.
    Write,
    /// Both: observed, then overwritten.
    ReadWrite,
}

impl Mode {
    fn wants_read(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    fn wants_write(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }
}

/// The five handle shapes from §4.2's table, each contributing a fixed set
/// of constraint flags and a fixed set of locations it will accept once
/// realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Any realized location is acceptable.
    Use,
    /// Immediates are rejected; realize must land on `Bound` or `Mem`.
    UseNoImm,
    /// Memory is rejected; realize must land on `Bound` or `Imm`.
    BindOrImm,
    /// Always realizes to a bound host register.
    Bind,
    /// Always realizes to a bound host register under a two-phase
    /// transaction.
    RevertableBind,
}

impl HandleKind {
    /// Whether `at` is an acceptable realized location for this handle
    /// kind.
    pub fn accepts(self, at: RealizedAt) -> bool {
        match self {
            HandleKind::Use => matches!(at, RealizedAt::Bound | RealizedAt::Imm | RealizedAt::Mem),
            HandleKind::UseNoImm => matches!(at, RealizedAt::Bound | RealizedAt::Mem),
            HandleKind::BindOrImm => matches!(at, RealizedAt::Bound | RealizedAt::Imm),
            HandleKind::Bind | HandleKind::RevertableBind => matches!(at, RealizedAt::Bound),
        }
    }

    fn kills_immediate(self) -> bool {
        matches!(self, HandleKind::UseNoImm | HandleKind::Bind | HandleKind::RevertableBind)
    }

    fn kills_memory(self) -> bool {
        matches!(self, HandleKind::BindOrImm | HandleKind::Bind | HandleKind::RevertableBind)
    }

    fn is_revertable(self) -> bool {
        matches!(self, HandleKind::RevertableBind)
    }
}

/// The accumulated realization plan for one preg, growing monotonically as
/// handles are taken and reset wholesale when the last lock on the preg
/// releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraint {
    /// At least one outstanding handle wants to observe the current value.
    pub read: bool,
    /// At least one outstanding handle will overwrite the value.
    pub write: bool,
    /// At least one outstanding handle forbids realizing to an immediate.
    pub kill_immediate: bool,
    /// At least one outstanding handle forbids realizing to bare memory.
    pub kill_memory: bool,
    /// At least one outstanding handle requires the two-phase transaction.
    pub revertable: bool,
    /// Stamped the first time this preg is realized in the current lock
    /// scope; `Unset` beforehand.
    pub realized_at: RealizedAt,
}

impl Constraint {
    /// Fold a new handle's contribution into the accumulated constraint.
    ///
    /// Once `realized_at == Bound`, every handle kind's accepted-location
    /// set includes `Bound`, so the only way a later handle can disagree
    /// with an already-bound preg is a revertability mismatch — that is a
    /// genuine conflict, since a retroactive revertable bind would need a
    /// shadow spill that should have happened before the first write. A
    /// later handle that disagrees with a `Mem`/`Imm` realization instead
    /// of a `Bound` one is not a conflict: `BankCache::realize` upgrades
    /// the preg to `Bound` the next time it is asked to realize (see
    /// `needs_rebind`), per the boundary behavior "a second `Bind` on a
    /// preg whose existing realization is `Mem` must upgrade to `Bound`".
    pub fn accumulate(&mut self, preg: PregId, kind: HandleKind, mode: Mode) -> Result<()> {
        if self.realized_at == RealizedAt::Bound && kind.is_revertable() != self.revertable {
            return Err(AllocatorError::ConstraintConflict(preg));
        }

        self.read |= mode.wants_read();
        self.write |= mode.wants_write();
        self.kill_immediate |= kind.kills_immediate();
        self.kill_memory |= kind.kills_memory();
        self.revertable |= kind.is_revertable();
        Ok(())
    }

    /// Whether the already-stamped realization no longer satisfies the
    /// accumulated constraint and must be upgraded to `Bound`. `Mem` goes
    /// stale only via `kill_memory`: an x86 store can target memory
    /// directly, so a plain write doesn't disturb a `Mem` realization.
    /// `Imm` goes stale via `kill_immediate` *or* a newly accumulated
    /// `write`: an immediate literal can't be a store destination, so any
    /// write intent forces materialization into a host register, mirroring
    /// the same `write || kill_immediate` test the first-realize path uses
    /// for a preg that starts out with a known immediate. Every handle
    /// kind accepts `Bound`, so a `Bound` realization never needs
    /// rebinding.
    pub fn needs_rebind(&self) -> bool {
        (self.realized_at == RealizedAt::Imm && (self.kill_immediate || self.write))
            || (self.realized_at == RealizedAt::Mem && self.kill_memory)
    }

    /// Stamp the terminal realized location, overwriting whatever was
    /// stamped before. Called by `BankCache::realize` only when it has
    /// decided a (re)realize is actually needed — the first realize in an
    /// empty lock scope, or an upgrade once `needs_rebind` reports the
    /// current stamp is stale — so an unconditional overwrite here is
    /// safe and matches "realizing again is a no-op only if compatible"
    /// from the caller's perspective.
    pub fn stamp(&mut self, at: RealizedAt) {
        self.realized_at = at;
    }

    /// Reset to the empty constraint; called when `lock_count` on the
    /// owning preg reaches zero.
    pub fn reset(&mut self) {
        *self = Constraint::default();
    }
}
