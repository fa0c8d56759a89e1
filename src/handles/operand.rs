//! The per-preg operand handle (component design §4.3).
//!
//! A handle is move-only: it carries no `Clone`/`Copy`, so the only way to
//! have two outstanding handles on the same preg is to construct two (which
//! both lock it, via reentrant `lock_count`). Dropping releases the lock,
//! resetting the preg's accumulated constraint once the last one goes.

use crate::cache::Shared;
use crate::emitter::Emitter;
use crate::error::Result;
use crate::location::OperandLocation;
use crate::reg::PregId;
use crate::state::constraint::{HandleKind, Mode};

/// A scoped, move-only reference to one guest register's operand. Realizing
/// is a separate, explicit step (§4.3's two-step realize) from
/// construction: taking the handle only accumulates intent, `realize`
/// commits it to a concrete location.
pub struct OperandHandle<E: Emitter> {
    inner: Shared<E>,
    preg: PregId,
}

impl<E: Emitter> OperandHandle<E> {
    fn new(inner: Shared<E>, preg: PregId, kind: HandleKind, mode: Mode) -> Result<Self> {
        inner.borrow_mut().lock_and_accumulate(preg, kind, mode)?;
        Ok(Self { inner, preg })
    }

    /// Any realized location is acceptable (`Use`).
    pub fn use_handle(inner: Shared<E>, preg: PregId, mode: Mode) -> Result<Self> {
        Self::new(inner, preg, HandleKind::Use, mode)
    }

    /// Immediates are rejected (`UseNoImm`).
    pub fn use_no_imm(inner: Shared<E>, preg: PregId, mode: Mode) -> Result<Self> {
        Self::new(inner, preg, HandleKind::UseNoImm, mode)
    }

    /// Memory is rejected (`BindOrImm`).
    pub fn bind_or_imm(inner: Shared<E>, preg: PregId, mode: Mode) -> Result<Self> {
        Self::new(inner, preg, HandleKind::BindOrImm, mode)
    }

    /// Always realizes to a bound host register (`Bind`).
    pub fn bind(inner: Shared<E>, preg: PregId, mode: Mode) -> Result<Self> {
        Self::new(inner, preg, HandleKind::Bind, mode)
    }

    /// Always realizes to a bound host register under a two-phase
    /// transaction (`RevertableBind`).
    pub fn revertable_bind(inner: Shared<E>, preg: PregId, mode: Mode) -> Result<Self> {
        Self::new(inner, preg, HandleKind::RevertableBind, mode)
    }

    /// Commit this handle's (and every other outstanding handle's)
    /// accumulated constraint on this preg to a concrete location. Safe to
    /// call more than once: the second call is a no-op, returning the
    /// already-stamped location.
    pub fn realize(&mut self) -> Result<OperandLocation> {
        self.inner.borrow_mut().realize(self.preg)
    }

    /// The location this handle last realized to. Fails if `realize`
    /// hasn't been called yet.
    pub fn location(&self) -> Result<OperandLocation> {
        self.inner.borrow().operand_location(self.preg)
    }

    /// The preg this handle references.
    pub fn preg(&self) -> PregId {
        self.preg
    }

    /// §4.3 batch realize: commit every handle in `handles` to a concrete
    /// location as one unit, so the spiller can weigh their collective
    /// pressure instead of resolving one handle at a time. Every handle
    /// already locked its preg at construction, so realizing them in
    /// sequence here can never pick one batch member as another's spill
    /// victim (`PregState::is_protected`) — what a plain loop over
    /// `realize()` doesn't give the caller is an all-or-nothing failure:
    /// if the batch collectively needs more host registers than the bank
    /// can produce by spilling unprotected candidates, this fails before
    /// committing any of them rather than realizing a prefix and then
    /// erroring partway through.
    pub fn realize_batch(handles: &mut [OperandHandle<E>]) -> Result<Vec<OperandLocation>> {
        let Some(first) = handles.first() else {
            return Ok(Vec::new());
        };
        let pregs: Vec<PregId> = handles.iter().map(|h| h.preg).collect();
        first.inner.borrow().check_batch_feasible(&pregs)?;

        let mut locations = Vec::with_capacity(handles.len());
        for h in handles.iter_mut() {
            locations.push(h.realize()?);
        }
        Ok(locations)
    }
}

impl<E: Emitter> Drop for OperandHandle<E> {
    fn drop(&mut self) {
        self.inner.borrow_mut().release_preg_lock(self.preg);
    }
}
