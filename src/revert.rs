//! Two-phase (revertable) transaction control, layered over the per-bank
//! bookkeeping already in `cache` (§4.6). `Commit`/`Revert` in the external
//! interface act across both banks at once, since a guest fault can touch
//! either the GPR or the FPR cache mid-instruction.

use crate::cache::BankCache;
use crate::emitter::Emitter;
use crate::reg::PregId;

/// The current revertable set, split by bank.
#[derive(Debug, Clone, Default)]
pub struct RevertableSet {
    pub gpr: Vec<PregId>,
    pub fpr: Vec<PregId>,
}

impl RevertableSet {
    pub fn is_empty(&self) -> bool {
        self.gpr.is_empty() && self.fpr.is_empty()
    }
}

/// `Commit()`: the outstanding `RevertableBind` transactions across both
/// banks become authoritative. Invariant 5 (revertable containment):
/// `registers_revertable` is empty immediately after.
pub fn commit<E: Emitter>(gpr: &BankCache<E>, fpr: &BankCache<E>) {
    gpr.commit();
    fpr.commit();
}

/// `Revert()`: roll every outstanding `RevertableBind` transaction back to
/// its pre-bind memory value across both banks.
pub fn revert<E: Emitter>(gpr: &BankCache<E>, fpr: &BankCache<E>) {
    gpr.revert();
    fpr.revert();
}

/// `RegistersRevertable()`: pregs currently under a two-phase transaction,
/// for the guest-fault handler to iterate.
pub fn registers_revertable<E: Emitter>(gpr: &BankCache<E>, fpr: &BankCache<E>) -> RevertableSet {
    RevertableSet { gpr: gpr.registers_revertable(), fpr: fpr.registers_revertable() }
}
